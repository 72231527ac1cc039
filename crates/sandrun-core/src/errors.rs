//! Error types for the sandboxed execution subsystem
//!
//! Request outcomes (validation rejections, daemon failures, timeouts, nonzero
//! exits) travel inside `ExecutionResult::status`, never as `Err`. The types in
//! this module cover the fallible plumbing underneath: talking to the container
//! runtime, checking payloads, and loading configuration.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SandboxError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("Container runtime error: {0}")]
    RuntimeError(#[from] RuntimeError),
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        SandboxError::IoError(err.to_string())
    }
}

/// Failures reported by a [`crate::lifecycle::ContainerRuntime`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("Container runtime unreachable: {0}")]
    Unavailable(String),
    #[error("Sandbox image '{image}' not found; build/verify the sandbox image before executing code")]
    ImageMissing { image: String },
    #[error("Container {container} not found")]
    NotFound { container: String },
    #[error("Container {container} is in a conflicting state: {message}")]
    Conflict { container: String, message: String },
    #[error("Daemon operation '{operation}' timed out after {timeout:?}")]
    OperationTimeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("Daemon operation '{operation}' failed: {message}")]
    Daemon {
        operation: &'static str,
        message: String,
    },
}

impl RuntimeError {
    /// Classify a bollard error raised by `operation` against `target`
    /// (a container id, or the image reference for `create_container`).
    pub fn from_bollard(
        operation: &'static str,
        target: &str,
        err: bollard::errors::Error,
    ) -> Self {
        use bollard::errors::Error as BollardError;

        match err {
            BollardError::DockerResponseServerError {
                status_code: 404,
                message,
            } => {
                if operation == "create_container" || operation == "inspect_image" {
                    RuntimeError::ImageMissing {
                        image: target.to_string(),
                    }
                } else {
                    log::debug!("{} on {} returned 404: {}", operation, target, message);
                    RuntimeError::NotFound {
                        container: target.to_string(),
                    }
                }
            }
            BollardError::DockerResponseServerError {
                status_code: 409,
                message,
            } => RuntimeError::Conflict {
                container: target.to_string(),
                message,
            },
            BollardError::DockerResponseServerError {
                status_code,
                message,
            } => RuntimeError::Daemon {
                operation,
                message: format!("HTTP {}: {}", status_code, message),
            },
            BollardError::IOError { err } => RuntimeError::Unavailable(err.to_string()),
            BollardError::RequestTimeoutError => RuntimeError::Unavailable(
                "request to the Docker daemon timed out".to_string(),
            ),
            other => RuntimeError::Daemon {
                operation,
                message: other.to_string(),
            },
        }
    }

    /// True when the error means the container is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound { .. })
    }
}

/// Reasons a payload is refused before any container exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Payload is empty")]
    Empty,
    #[error("Payload is {size} bytes, exceeding the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("Payload contains a NUL byte")]
    NullByte,
    #[error("Payload matches prohibited pattern '{rule}'")]
    Prohibited { rule: String },
}
