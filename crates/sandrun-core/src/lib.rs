//! Sandboxed execution of untrusted code for autonomous agents.
//!
//! Every request runs in a fresh, single-use container that is created,
//! started, awaited under a deadline, read and removed before the call
//! returns. Nothing is shared between requests and no container outlives the
//! request that created it.
//!
//! # Architecture Overview
//!
//! - **Dispatch**: [`Dispatcher`] validates a request, picks its resource
//!   profile and drives it to exactly one [`ExecutionResult`]
//! - **Validation**: size, encoding and deny-list screening before any
//!   container exists
//! - **Policy**: memory, CPU, process and network limits per execution kind
//! - **Lifecycle**: create/start/wait/kill/logs against a [`ContainerRuntime`],
//!   with Docker as the production backend
//! - **Cleanup**: a guard that removes the container on every exit path,
//!   including cancellation
//! - **Metrics**: stage events reported to an injected [`MetricsSink`]
//! - **Configuration**: YAML files with `SANDRUN_*` environment overrides

pub mod cleanup;
pub mod collector;
pub mod config;
pub mod core_types;
pub mod dispatcher;
pub mod docker;
pub mod errors;
pub mod lifecycle;
pub mod metrics;
pub mod policy;
pub mod validation;

pub use config::*;
pub use core_types::{ExecutionKind, ExecutionRequest, ExecutionResult, ExecutionStatus};
pub use dispatcher::{CodeExecutor, Dispatcher};
pub use docker::DockerRuntime;
pub use errors::{RuntimeError, SandboxError, ValidationError};
pub use lifecycle::ContainerRuntime;
pub use metrics::{ExecutionMetrics, MetricsSink, NoopMetrics};

#[cfg(test)]
pub mod test_utils;
