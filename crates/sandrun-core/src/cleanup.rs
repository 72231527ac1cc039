//! Guaranteed container removal
//!
//! A [`CleanupGuard`] is armed on the container's name before the create call
//! is sent and re-keyed to the daemon id once one comes back. The lifecycle
//! manager calls [`CleanupGuard::ensure_removed`] at the end of every run. If
//! the run never finishes a removal (the request future is dropped during
//! create, execution or cleanup itself, or the task panics) the guard's `Drop`
//! schedules the removal on the current Tokio runtime instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::errors::RuntimeError;
use crate::lifecycle::{bounded, ContainerHandle, ContainerRuntime, ContainerState};
use crate::metrics::{MetricEvent, MetricsSink};

#[derive(Debug, Clone, PartialEq)]
pub enum CleanupOutcome {
    Removed,
    /// An earlier call already removed the container; nothing was sent.
    AlreadyRemoved,
    /// Logged and counted, never surfaced as a request failure.
    Failed(RuntimeError),
}

pub struct CleanupGuard {
    runtime: Arc<dyn ContainerRuntime>,
    metrics: Arc<dyn MetricsSink>,
    handle: ContainerHandle,
    operation_timeout: Duration,
    /// Keyed on the requested name; the daemon has not confirmed a container.
    pending: bool,
    /// A removal ran to completion (successfully or not).
    finished: bool,
}

impl CleanupGuard {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        metrics: Arc<dyn MetricsSink>,
        handle: ContainerHandle,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            metrics,
            handle,
            operation_timeout,
            pending: false,
            finished: false,
        }
    }

    /// Guard a container that is about to be created under `name`.
    pub fn pending(
        runtime: Arc<dyn ContainerRuntime>,
        metrics: Arc<dyn MetricsSink>,
        name: &str,
        operation_timeout: Duration,
    ) -> Self {
        let mut guard = Self::new(runtime, metrics, ContainerHandle::new(name), operation_timeout);
        guard.pending = true;
        guard
    }

    /// Switch from the requested name to the id the daemon returned.
    pub fn bind(&mut self, id: impl Into<String>) {
        self.handle = ContainerHandle::new(id);
        self.pending = false;
    }

    /// The daemon refused the create outright; there is nothing to remove.
    pub fn disarm(&mut self) {
        self.finished = true;
    }

    pub fn handle(&self) -> &ContainerHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut ContainerHandle {
        &mut self.handle
    }

    pub fn is_removed(&self) -> bool {
        self.handle.state() == ContainerState::Removed
    }

    /// Remove the container. Safe to call repeatedly; a container the daemon
    /// no longer knows about counts as removed.
    pub async fn ensure_removed(&mut self) -> CleanupOutcome {
        if self.is_removed() {
            return CleanupOutcome::AlreadyRemoved;
        }

        let outcome = if self.pending {
            remove_unconfirmed(self.runtime.as_ref(), self.handle.id(), self.operation_timeout)
                .await
        } else {
            remove_container(
                self.runtime.as_ref(),
                self.metrics.as_ref(),
                self.handle.id(),
                self.operation_timeout,
            )
            .await
        };
        self.finished = true;

        if outcome == CleanupOutcome::Removed {
            self.handle.transition(ContainerState::Removed);
        }
        outcome
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.finished || self.is_removed() {
            return;
        }

        let id = self.handle.id().to_string();
        log::warn!("Container {} abandoned before cleanup; scheduling removal", id);

        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let runtime = self.runtime.clone();
                let metrics = self.metrics.clone();
                let timeout = self.operation_timeout;
                let pending = self.pending;
                rt.spawn(async move {
                    if pending {
                        remove_unconfirmed(runtime.as_ref(), &id, timeout).await;
                    } else {
                        remove_container(runtime.as_ref(), metrics.as_ref(), &id, timeout).await;
                    }
                });
            }
            Err(_) => log::error!(
                "No async runtime available to remove container {}; remove it manually",
                id
            ),
        }
    }
}

async fn remove_container(
    runtime: &dyn ContainerRuntime,
    metrics: &dyn MetricsSink,
    id: &str,
    timeout: Duration,
) -> CleanupOutcome {
    let started = Instant::now();
    match bounded("remove_container", timeout, runtime.remove(id)).await {
        Ok(()) | Err(RuntimeError::NotFound { .. }) | Err(RuntimeError::Conflict { .. }) => {
            let elapsed = started.elapsed();
            log::debug!("Removed container {} in {:?}", id, elapsed);
            metrics.record(MetricEvent::ContainerRemoved { cleanup: elapsed });
            CleanupOutcome::Removed
        }
        Err(err) => {
            log::warn!("Cleanup failed for container {}: {}", id, err);
            metrics.record(MetricEvent::CleanupFailed);
            CleanupOutcome::Failed(err)
        }
    }
}

/// Remove by name a container whose create never returned. It was never
/// counted as created, so it is not counted as removed either.
async fn remove_unconfirmed(
    runtime: &dyn ContainerRuntime,
    name: &str,
    timeout: Duration,
) -> CleanupOutcome {
    match bounded("remove_container", timeout, runtime.remove(name)).await {
        Ok(()) => {
            log::warn!("Removed container {} left behind by an unfinished create", name);
            CleanupOutcome::Removed
        }
        Err(err) if err.is_not_found() => CleanupOutcome::Removed,
        Err(err) => {
            log::warn!("Could not remove possibly orphaned container {}: {}", name, err);
            CleanupOutcome::Failed(err)
        }
    }
}
