//! Configuration loader for YAML files and environment overrides
//!
//! Values are resolved in three layers: built-in defaults, then the YAML
//! document, then `SANDRUN_*` environment variables.

use crate::config::types::*;
use crate::errors::SandboxError;
use std::env;
use std::path::Path;
use std::str::FromStr;
use tokio::fs;

pub const ENV_IMAGE: &str = "SANDRUN_IMAGE";
pub const ENV_USER: &str = "SANDRUN_USER";
pub const ENV_MEMORY_BYTES: &str = "SANDRUN_MEMORY_BYTES";
pub const ENV_CPU_FRACTION: &str = "SANDRUN_CPU_FRACTION";
pub const ENV_PIDS_LIMIT: &str = "SANDRUN_PIDS_LIMIT";
pub const ENV_MAX_OUTPUT_BYTES: &str = "SANDRUN_MAX_OUTPUT_BYTES";
pub const ENV_DOCKER_HOST: &str = "SANDRUN_DOCKER_HOST";
pub const ENV_LOG_LEVEL: &str = "SANDRUN_LOG_LEVEL";

/// Configuration loader with environment resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<SandboxConfig, SandboxError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| {
            SandboxError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<SandboxConfig, SandboxError> {
        let mut config: SandboxConfig = if content.trim().is_empty() {
            SandboxConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| {
                SandboxError::ConfigError(format!("Failed to parse YAML config: {}", e))
            })?
        };

        Self::resolve_environment(&mut config)?;

        config.validate()?;

        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file.
    pub fn from_env() -> Result<SandboxConfig, SandboxError> {
        Self::from_str("")
    }

    /// Apply `SANDRUN_*` overrides on top of the parsed document
    pub fn resolve_environment(config: &mut SandboxConfig) -> Result<(), SandboxError> {
        if let Some(image) = read_var(ENV_IMAGE) {
            config.image.reference = image;
        }
        if let Some(user) = read_var(ENV_USER) {
            config.image.user = user;
        }
        if let Some(memory) = parse_var::<u64>(ENV_MEMORY_BYTES)? {
            config.limits.memory_bytes = memory;
        }
        if let Some(cpu) = parse_var::<f64>(ENV_CPU_FRACTION)? {
            config.limits.cpu_fraction = cpu;
        }
        if let Some(pids) = parse_var::<u32>(ENV_PIDS_LIMIT)? {
            config.limits.pids = pids;
        }
        if let Some(cap) = parse_var::<usize>(ENV_MAX_OUTPUT_BYTES)? {
            config.output.max_output_bytes = cap;
        }
        if let Some(endpoint) = read_var(ENV_DOCKER_HOST) {
            config.daemon.endpoint = Some(endpoint);
        }
        if let Some(level) = read_var(ENV_LOG_LEVEL) {
            config.logging.level = level;
        }
        Ok(())
    }
}

fn read_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_var<T>(key: &str) -> Result<Option<T>, SandboxError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match read_var(key) {
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            SandboxError::ConfigError(format!("Invalid value '{}' for {}: {}", raw, key, e))
        }),
        None => Ok(None),
    }
}
