//! Resource policy for sandboxed executions
//!
//! Turns an [`ExecutionKind`] into the concrete limits one container runs
//! under. A [`ResourceProfile`] can only be produced by [`ResourcePolicy`], and
//! the privilege-related parts of it are not stored at all: every profile drops
//! all capabilities, forbids privilege escalation and runs as the configured
//! unprivileged user.

use crate::config::types::{ImageConfig, LimitsConfig};
use crate::core_types::ExecutionKind;
use serde::Serialize;

/// Linux capabilities removed from every sandboxed process.
pub const DROPPED_CAPABILITIES: &[&str] = &["ALL"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceProfile {
    memory_limit_bytes: u64,
    cpu_quota_fraction: f64,
    pids_limit: u32,
    network_enabled: bool,
    user: String,
    read_only_rootfs: bool,
    tmpfs_size_bytes: u64,
}

impl ResourceProfile {
    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_bytes
    }

    pub fn cpu_quota_fraction(&self) -> f64 {
        self.cpu_quota_fraction
    }

    pub fn pids_limit(&self) -> u32 {
        self.pids_limit
    }

    pub fn network_enabled(&self) -> bool {
        self.network_enabled
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn read_only_rootfs(&self) -> bool {
        self.read_only_rootfs
    }

    pub fn tmpfs_size_bytes(&self) -> u64 {
        self.tmpfs_size_bytes
    }

    pub fn capabilities_dropped(&self) -> &'static [&'static str] {
        DROPPED_CAPABILITIES
    }

    pub fn no_new_privileges(&self) -> bool {
        true
    }

    pub fn run_as_unprivileged_user(&self) -> bool {
        true
    }

    /// CPU limit in the billionths-of-a-CPU unit the Docker API expects.
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_quota_fraction * 1_000_000_000.0).round() as i64
    }
}

/// Fixed policy table, parameterised by the configured ceilings.
#[derive(Debug, Clone)]
pub struct ResourcePolicy {
    limits: LimitsConfig,
    user: String,
}

impl ResourcePolicy {
    /// `image.user` is expected to have passed config validation (non-root).
    pub fn new(limits: LimitsConfig, image: &ImageConfig) -> Self {
        Self {
            limits,
            user: image.user.clone(),
        }
    }

    pub fn build_profile(&self, kind: ExecutionKind) -> ResourceProfile {
        let network_enabled = match kind {
            ExecutionKind::Code => false,
            ExecutionKind::ShellCommand => true,
            ExecutionKind::CodeWithNetwork => true,
        };

        ResourceProfile {
            memory_limit_bytes: self.limits.memory_bytes,
            cpu_quota_fraction: self.limits.cpu_fraction,
            pids_limit: self.limits.pids,
            network_enabled,
            user: self.user.clone(),
            read_only_rootfs: self.limits.read_only_rootfs,
            tmpfs_size_bytes: self.limits.tmpfs_size_bytes,
        }
    }
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self::new(LimitsConfig::default(), &ImageConfig::default())
    }
}
