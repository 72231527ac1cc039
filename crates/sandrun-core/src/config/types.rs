//! Configuration type definitions for the sandbox
//!
//! Every section is optional in YAML; a missing section falls back to the
//! defaults below, so an empty file yields a working configuration pointed at
//! the local Docker daemon.

use crate::core_types::{DEFAULT_CODE_TIMEOUT, DEFAULT_COMMAND_TIMEOUT};
use crate::errors::SandboxError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub request: RequestConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub sanitation: SanitationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The pre-built execution image. Built and published outside this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_image_reference")]
    pub reference: String,
    /// User the sandboxed process runs as. Must not be root.
    #[serde(default = "default_image_user")]
    pub user: String,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            reference: default_image_reference(),
            user: default_image_user(),
            interpreter: default_interpreter(),
            shell: default_shell(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: u64,
    #[serde(default = "default_cpu_fraction")]
    pub cpu_fraction: f64,
    #[serde(default = "default_pids")]
    pub pids: u32,
    #[serde(default)]
    pub read_only_rootfs: bool,
    /// Size of the writable /tmp mounted when the root filesystem is read-only.
    #[serde(default = "default_tmpfs_size_bytes")]
    pub tmpfs_size_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            memory_bytes: default_memory_bytes(),
            cpu_fraction: default_cpu_fraction(),
            pids: default_pids(),
            read_only_rootfs: false,
            tmpfs_size_bytes: default_tmpfs_size_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_code_timeout_secs")]
    pub code_timeout_secs: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            code_timeout_secs: default_code_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl RequestConfig {
    pub fn code_timeout(&self) -> Duration {
        Duration::from_secs(self.code_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Per-stream cap; stdout and stderr are truncated independently.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// `None` uses the local defaults (DOCKER_HOST or the platform socket).
    /// Otherwise `unix:///path/to/docker.sock` or `tcp://host:port`.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Bound on every call other than the execution wait.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            operation_timeout_secs: default_operation_timeout_secs(),
        }
    }
}

impl DaemonConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SanitationConfig {
    /// Additional regexes rejected for every request kind.
    #[serde(default)]
    pub extra_deny_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_image_reference() -> String {
    "sandrun/python-sandbox:3.12".to_string()
}
fn default_image_user() -> String {
    "sandbox".to_string()
}
fn default_interpreter() -> String {
    "python3".to_string()
}
fn default_shell() -> String {
    "/bin/sh".to_string()
}
fn default_memory_bytes() -> u64 { 512 * 1024 * 1024 }
fn default_cpu_fraction() -> f64 { 0.5 }
fn default_pids() -> u32 { 100 }
fn default_tmpfs_size_bytes() -> u64 { 64 * 1024 * 1024 }
fn default_max_payload_bytes() -> usize { 64 * 1024 }
fn default_code_timeout_secs() -> u64 { DEFAULT_CODE_TIMEOUT.as_secs() }
fn default_command_timeout_secs() -> u64 { DEFAULT_COMMAND_TIMEOUT.as_secs() }
fn default_max_output_bytes() -> usize { 100 * 1024 }
fn default_connect_timeout_secs() -> u64 { 120 }
fn default_operation_timeout_secs() -> u64 { 10 }
fn default_log_level() -> String {
    "info".to_string()
}

const LOG_LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

impl SandboxConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.image.reference.trim().is_empty() {
            return Err(SandboxError::ConfigError("Sandbox image reference cannot be empty".to_string()));
        }

        if is_root_user(&self.image.user) {
            return Err(SandboxError::ConfigError(format!(
                "Sandbox user '{}' is root; the sandbox must run as an unprivileged user",
                self.image.user
            )));
        }

        if self.image.interpreter.trim().is_empty() || self.image.shell.trim().is_empty() {
            return Err(SandboxError::ConfigError("Interpreter and shell paths cannot be empty".to_string()));
        }

        if self.limits.memory_bytes == 0 {
            return Err(SandboxError::ConfigError("Memory limit must be greater than 0".to_string()));
        }

        if !(self.limits.cpu_fraction > 0.0 && self.limits.cpu_fraction <= 1.0) {
            return Err(SandboxError::ConfigError(format!(
                "CPU fraction must be in (0, 1], got {}",
                self.limits.cpu_fraction
            )));
        }

        if self.limits.pids == 0 {
            return Err(SandboxError::ConfigError("PID limit must be greater than 0".to_string()));
        }

        if self.limits.read_only_rootfs && self.limits.tmpfs_size_bytes == 0 {
            return Err(SandboxError::ConfigError(
                "A read-only root filesystem needs a non-zero tmpfs size".to_string(),
            ));
        }

        if self.request.max_payload_bytes == 0 {
            return Err(SandboxError::ConfigError("Maximum payload size must be greater than 0".to_string()));
        }

        if self.request.code_timeout_secs == 0 || self.request.command_timeout_secs == 0 {
            return Err(SandboxError::ConfigError("Execution timeouts must be greater than 0".to_string()));
        }

        if self.output.max_output_bytes == 0 {
            return Err(SandboxError::ConfigError("Output cap must be greater than 0".to_string()));
        }

        if self.daemon.operation_timeout_secs == 0 {
            return Err(SandboxError::ConfigError("Daemon operation timeout must be greater than 0".to_string()));
        }

        if let Some(endpoint) = &self.daemon.endpoint {
            let supported = ["unix://", "tcp://", "http://"];
            if !supported.iter().any(|scheme| endpoint.starts_with(scheme)) {
                return Err(SandboxError::ConfigError(format!(
                    "Unsupported daemon endpoint '{}'; expected unix://, tcp:// or http://",
                    endpoint
                )));
            }
        }

        for pattern in &self.sanitation.extra_deny_patterns {
            Regex::new(pattern).map_err(|e| {
                SandboxError::ConfigError(format!("Invalid deny pattern '{}': {}", pattern, e))
            })?;
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(SandboxError::ConfigError(format!(
                "Unknown log level '{}'",
                self.logging.level
            )));
        }

        Ok(())
    }
}

/// `root`, uid 0, and any `root:group` / `0:gid` form.
pub fn is_root_user(user: &str) -> bool {
    let name = user.trim().split(':').next().unwrap_or("");
    name.is_empty() || name == "root" || name == "0"
}
