// src/core_types.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_CODE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// The closed set of things a caller can ask the sandbox to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    /// Source code handed to the interpreter, no network.
    Code,
    /// A command line handed to the shell verbatim, network enabled.
    ShellCommand,
    /// Source code with network access. The only opt-in path for networked code.
    CodeWithNetwork,
}

impl ExecutionKind {
    pub fn network_enabled(&self) -> bool {
        match self {
            ExecutionKind::Code => false,
            ExecutionKind::ShellCommand | ExecutionKind::CodeWithNetwork => true,
        }
    }

    pub fn is_shell(&self) -> bool {
        matches!(self, ExecutionKind::ShellCommand)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionKind::Code => "code",
            ExecutionKind::ShellCommand => "shell_command",
            ExecutionKind::CodeWithNetwork => "code_with_network",
        }
    }
}

impl fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub kind: ExecutionKind,
    pub payload: String,
    /// `None` falls back to the configured default for `kind`.
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(kind: ExecutionKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            timeout: None,
        }
    }

    pub fn code(source: impl Into<String>) -> Self {
        Self::new(ExecutionKind::Code, source)
    }

    pub fn command(cmd: impl Into<String>) -> Self {
        Self::new(ExecutionKind::ShellCommand, cmd)
    }

    pub fn code_with_network(source: impl Into<String>) -> Self {
        Self::new(ExecutionKind::CodeWithNetwork, source)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn network_enabled(&self) -> bool {
        self.kind.network_enabled()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    NonZeroExit,
    TimedOut,
    DaemonError,
    ValidationRejected,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::NonZeroExit => "non_zero_exit",
            ExecutionStatus::TimedOut => "timed_out",
            ExecutionStatus::DaemonError => "daemon_error",
            ExecutionStatus::ValidationRejected => "validation_rejected",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller gets back. The container behind it is already gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub oom_killed: bool,
}

impl ExecutionResult {
    pub fn rejected(reason: impl Into<String>, duration: Duration) -> Self {
        Self {
            status: ExecutionStatus::ValidationRejected,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            exit_code: None,
            duration_ms: duration.as_millis() as u64,
            message: Some(reason.into()),
            oom_killed: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }
}
