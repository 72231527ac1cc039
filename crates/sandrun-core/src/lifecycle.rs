//! Container lifecycle for a single execution
//!
//! [`LifecycleManager::run`] creates one container, starts it, waits for it
//! under the request's deadline, kills it if the deadline passes, reads its
//! output and removes it before returning. Everything that touches the
//! container runtime goes through the [`ContainerRuntime`] trait, so the Docker
//! implementation in [`crate::docker`] can be swapped for a mock in tests.
//!
//! Every daemon call except the execution wait is bounded by a short
//! per-operation timeout so an unresponsive daemon cannot hold a request
//! forever.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cleanup::CleanupGuard;
use crate::collector::RawOutput;
use crate::errors::RuntimeError;
use crate::metrics::{MetricEvent, MetricsSink};
use crate::policy::ResourceProfile;

/// Everything needed to create one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub entrypoint: Vec<String>,
    pub profile: ResourceProfile,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container; returns its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Resolves with the exit code once the container's process exits.
    async fn wait(&self, id: &str) -> Result<i64, RuntimeError>;

    /// Send SIGKILL to the container's process.
    async fn kill(&self, id: &str) -> Result<(), RuntimeError>;

    /// Read stdout/stderr, keeping at most `cap` bytes of each.
    async fn logs(&self, id: &str, cap: usize) -> Result<RawOutput, RuntimeError>;

    /// Force-remove the container. A missing container is reported as
    /// [`RuntimeError::NotFound`].
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;

    /// Whether the kernel OOM killer terminated the container.
    async fn oom_killed(&self, _id: &str) -> Result<bool, RuntimeError> {
        Ok(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Completed,
    TimedOut,
    Failed,
    Removed,
}

impl ContainerState {
    fn can_become(self, next: ContainerState) -> bool {
        use ContainerState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Failed)
                | (Running, Completed)
                | (Running, TimedOut)
                | (Running, Failed)
                | (Created, Removed)
                | (Running, Removed)
                | (Completed, Removed)
                | (TimedOut, Removed)
                | (Failed, Removed)
        )
    }
}

/// One container, owned by the lifecycle manager for one request.
#[derive(Debug)]
pub struct ContainerHandle {
    id: String,
    state: ContainerState,
}

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: ContainerState::Created,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    /// Returns false (and leaves the state alone) for an illegal transition.
    pub fn transition(&mut self, next: ContainerState) -> bool {
        if self.state.can_become(next) {
            log::debug!("Container {}: {:?} -> {:?}", self.id, self.state, next);
            self.state = next;
            true
        } else {
            log::warn!(
                "Ignoring illegal transition {:?} -> {:?} for container {}",
                self.state,
                next,
                self.id
            );
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    Completed { exit_code: i64 },
    TimedOut { after: Duration },
    Failed(RuntimeError),
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub output: RawOutput,
    pub status: RunStatus,
    pub oom_killed: bool,
}

impl RunOutcome {
    fn failed(err: RuntimeError, cap: usize) -> Self {
        Self {
            output: RawOutput::with_cap(cap),
            status: RunStatus::Failed(err),
            oom_killed: false,
        }
    }
}

/// Run `fut`, turning an overrun of `limit` into [`RuntimeError::OperationTimeout`].
pub(crate) async fn bounded<T, F>(
    operation: &'static str,
    limit: Duration,
    fut: F,
) -> Result<T, RuntimeError>
where
    F: Future<Output = Result<T, RuntimeError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RuntimeError::OperationTimeout {
            operation,
            timeout: limit,
        }),
    }
}

pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    metrics: Arc<dyn MetricsSink>,
    operation_timeout: Duration,
    max_output_bytes: usize,
}

impl LifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        metrics: Arc<dyn MetricsSink>,
        operation_timeout: Duration,
        max_output_bytes: usize,
    ) -> Self {
        Self {
            runtime,
            metrics,
            operation_timeout,
            max_output_bytes,
        }
    }

    /// Execute `entrypoint` in a fresh container. The container has been
    /// removed (or its removal attempted and logged) by the time this returns.
    pub async fn run(
        &self,
        image: &str,
        entrypoint: Vec<String>,
        profile: &ResourceProfile,
        timeout: Duration,
    ) -> RunOutcome {
        let spec = ContainerSpec {
            name: format!("sandrun-{}", Uuid::new_v4()),
            image: image.to_string(),
            entrypoint,
            profile: profile.clone(),
        };

        // Armed before the create call so a request dropped mid-create still
        // removes whatever the daemon made under this name.
        let mut guard = CleanupGuard::pending(
            self.runtime.clone(),
            self.metrics.clone(),
            &spec.name,
            self.operation_timeout,
        );

        let id = match bounded(
            "create_container",
            self.operation_timeout,
            self.runtime.create(&spec),
        )
        .await
        {
            Ok(id) => id,
            Err(err) => {
                log::error!("Failed to create sandbox container from {}: {}", image, err);
                if matches!(err, RuntimeError::OperationTimeout { .. }) {
                    // The daemon may still have produced the container.
                    guard.ensure_removed().await;
                } else {
                    guard.disarm();
                }
                return RunOutcome::failed(err, self.max_output_bytes);
            }
        };
        guard.bind(id.clone());
        self.metrics.record(MetricEvent::ContainerCreated);
        log::debug!("Created container {} ({})", id, spec.name);

        let outcome = self.drive(guard.handle_mut(), timeout).await;
        guard.ensure_removed().await;
        outcome
    }

    async fn drive(&self, handle: &mut ContainerHandle, timeout: Duration) -> RunOutcome {
        let cap = self.max_output_bytes;
        let id = handle.id().to_string();

        if let Err(err) = bounded(
            "start_container",
            self.operation_timeout,
            self.runtime.start(&id),
        )
        .await
        {
            log::error!("Failed to start container {}: {}", id, err);
            handle.transition(ContainerState::Failed);
            return RunOutcome::failed(err, cap);
        }
        handle.transition(ContainerState::Running);

        match tokio::time::timeout(timeout, self.runtime.wait(&id)).await {
            Ok(Ok(exit_code)) => {
                handle.transition(ContainerState::Completed);
                log::debug!("Container {} exited with code {}", id, exit_code);

                let oom_killed = if exit_code != 0 {
                    bounded(
                        "inspect_container",
                        self.operation_timeout,
                        self.runtime.oom_killed(&id),
                    )
                    .await
                    .unwrap_or_else(|err| {
                        log::warn!("Could not inspect container {}: {}", id, err);
                        false
                    })
                } else {
                    false
                };

                match bounded("logs", self.operation_timeout, self.runtime.logs(&id, cap)).await {
                    Ok(output) => RunOutcome {
                        output,
                        status: RunStatus::Completed { exit_code },
                        oom_killed,
                    },
                    Err(err) => {
                        log::error!("Failed to read output of container {}: {}", id, err);
                        RunOutcome::failed(err, cap)
                    }
                }
            }
            Ok(Err(err)) => {
                log::error!("Waiting on container {} failed: {}", id, err);
                handle.transition(ContainerState::Failed);
                RunOutcome::failed(err, cap)
            }
            Err(_) => {
                handle.transition(ContainerState::TimedOut);
                log::warn!("Execution timed out for container {} after {:?}", id, timeout);

                // Forced removal kills too, so a failed kill is not fatal.
                if let Err(err) = bounded(
                    "kill_container",
                    self.operation_timeout,
                    self.runtime.kill(&id),
                )
                .await
                {
                    log::warn!("Failed to kill timed-out container {}: {}", id, err);
                }

                let output = bounded("logs", self.operation_timeout, self.runtime.logs(&id, cap))
                    .await
                    .unwrap_or_else(|err| {
                        log::warn!("No partial output for container {}: {}", id, err);
                        RawOutput::with_cap(cap)
                    });

                RunOutcome {
                    output,
                    status: RunStatus::TimedOut { after: timeout },
                    oom_killed: false,
                }
            }
        }
    }
}
