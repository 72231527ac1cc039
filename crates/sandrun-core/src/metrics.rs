//! Execution metrics
//!
//! The dispatcher and lifecycle manager report stage boundaries as
//! [`MetricEvent`]s to an injected [`MetricsSink`]. [`ExecutionMetrics`] keeps
//! lock-free counters and timers that an external collector can poll through
//! [`ExecutionMetrics::snapshot`]; [`NoopMetrics`] discards everything.

use crate::core_types::{ExecutionKind, ExecutionStatus};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    DispatchStarted { kind: ExecutionKind },
    ValidationRejected { kind: ExecutionKind },
    ContainerCreated,
    ContainerRemoved { cleanup: Duration },
    CleanupFailed,
    ExecutionFinished {
        kind: ExecutionKind,
        status: ExecutionStatus,
        duration: Duration,
    },
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _event: MetricEvent) {}
}

/// Atomic counters shared by all concurrent requests.
#[derive(Debug, Default)]
pub struct ExecutionMetrics {
    dispatched: AtomicU64,
    rejected: AtomicU64,
    containers_created: AtomicU64,
    containers_removed: AtomicU64,
    cleanup_failures: AtomicU64,
    cleanup_micros_total: AtomicU64,
    execution_micros_total: AtomicU64,
    succeeded: AtomicU64,
    non_zero_exits: AtomicU64,
    timed_out: AtomicU64,
    daemon_errors: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub dispatched: u64,
    pub rejected: u64,
    pub containers_created: u64,
    pub containers_removed: u64,
    pub cleanup_failures: u64,
    pub cleanup_micros_total: u64,
    pub execution_micros_total: u64,
    pub succeeded: u64,
    pub non_zero_exits: u64,
    pub timed_out: u64,
    pub daemon_errors: u64,
}

impl MetricsSnapshot {
    /// Containers created but not (yet) confirmed removed.
    pub fn containers_outstanding(&self) -> u64 {
        self.containers_created
            .saturating_sub(self.containers_removed + self.cleanup_failures)
    }
}

impl ExecutionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            containers_created: self.containers_created.load(Ordering::Relaxed),
            containers_removed: self.containers_removed.load(Ordering::Relaxed),
            cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
            cleanup_micros_total: self.cleanup_micros_total.load(Ordering::Relaxed),
            execution_micros_total: self.execution_micros_total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            non_zero_exits: self.non_zero_exits.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            daemon_errors: self.daemon_errors.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for ExecutionMetrics {
    fn record(&self, event: MetricEvent) {
        match event {
            MetricEvent::DispatchStarted { .. } => {
                self.dispatched.fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::ValidationRejected { .. } => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::ContainerCreated => {
                self.containers_created.fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::ContainerRemoved { cleanup } => {
                self.containers_removed.fetch_add(1, Ordering::Relaxed);
                self.cleanup_micros_total
                    .fetch_add(cleanup.as_micros() as u64, Ordering::Relaxed);
            }
            MetricEvent::CleanupFailed => {
                self.cleanup_failures.fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::ExecutionFinished {
                status, duration, ..
            } => {
                self.execution_micros_total
                    .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
                let counter = match status {
                    ExecutionStatus::Success => &self.succeeded,
                    ExecutionStatus::NonZeroExit => &self.non_zero_exits,
                    ExecutionStatus::TimedOut => &self.timed_out,
                    ExecutionStatus::DaemonError => &self.daemon_errors,
                    // Already counted by ValidationRejected.
                    ExecutionStatus::ValidationRejected => return,
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_events_update_counters() {
        let metrics = ExecutionMetrics::new();
        metrics.record(MetricEvent::DispatchStarted {
            kind: ExecutionKind::Code,
        });
        metrics.record(MetricEvent::ContainerCreated);
        metrics.record(MetricEvent::ContainerRemoved {
            cleanup: Duration::from_micros(250),
        });
        metrics.record(MetricEvent::ExecutionFinished {
            kind: ExecutionKind::Code,
            status: ExecutionStatus::TimedOut,
            duration: Duration::from_millis(2),
        });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.dispatched, 1);
        assert_eq!(snapshot.containers_created, 1);
        assert_eq!(snapshot.containers_removed, 1);
        assert_eq!(snapshot.cleanup_micros_total, 250);
        assert_eq!(snapshot.timed_out, 1);
        assert_eq!(snapshot.execution_micros_total, 2000);
        assert_eq!(snapshot.containers_outstanding(), 0);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let metrics = Arc::new(ExecutionMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record(MetricEvent::ContainerCreated);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.snapshot().containers_created, 8000);
    }
}
