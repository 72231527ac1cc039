//! Request dispatch: validation, policy selection and execution
//!
//! The [`Dispatcher`] is the entry point the orchestrating agent calls. It is
//! built once at startup with an injected runtime client and metrics sink and
//! then shared (`Arc<Dispatcher>`) across concurrent requests; it holds no
//! per-request mutable state.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::collector::ResultCollector;
use crate::config::types::SandboxConfig;
use crate::core_types::{ExecutionKind, ExecutionRequest, ExecutionResult};
use crate::docker::DockerRuntime;
use crate::errors::SandboxError;
use crate::lifecycle::{ContainerRuntime, LifecycleManager};
use crate::metrics::{MetricEvent, MetricsSink};
use crate::policy::ResourcePolicy;
use crate::validation::PayloadValidator;

/// The operations offered to the agent. Every call yields exactly one result;
/// failures are reported through `ExecutionResult::status`.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> ExecutionResult;

    async fn execute_code(&self, source: &str) -> ExecutionResult {
        self.execute(ExecutionRequest::code(source)).await
    }

    async fn execute_command(&self, cmd: &str) -> ExecutionResult {
        self.execute(ExecutionRequest::command(cmd)).await
    }

    async fn execute_code_with_network(&self, source: &str) -> ExecutionResult {
        self.execute(ExecutionRequest::code_with_network(source)).await
    }

    async fn execute_with_timeout(
        &self,
        kind: ExecutionKind,
        payload: &str,
        timeout: Duration,
    ) -> ExecutionResult {
        self.execute(ExecutionRequest::new(kind, payload).with_timeout(timeout))
            .await
    }
}

pub struct Dispatcher {
    config: SandboxConfig,
    policy: ResourcePolicy,
    validator: PayloadValidator,
    collector: ResultCollector,
    lifecycle: LifecycleManager,
    metrics: Arc<dyn MetricsSink>,
}

impl Dispatcher {
    pub fn new(
        config: SandboxConfig,
        runtime: Arc<dyn ContainerRuntime>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, SandboxError> {
        config.validate()?;

        let validator = PayloadValidator::new(
            config.request.max_payload_bytes,
            &config.sanitation.extra_deny_patterns,
        )?;
        let policy = ResourcePolicy::new(config.limits.clone(), &config.image);
        let collector = ResultCollector::new(config.output.max_output_bytes);
        let lifecycle = LifecycleManager::new(
            runtime,
            metrics.clone(),
            config.daemon.operation_timeout(),
            config.output.max_output_bytes,
        );

        Ok(Self {
            config,
            policy,
            validator,
            collector,
            lifecycle,
            metrics,
        })
    }

    /// Connect to the Docker daemon described by `config.daemon`.
    pub fn connect(
        config: SandboxConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, SandboxError> {
        let runtime = DockerRuntime::connect(&config.daemon)?;
        Self::new(config, Arc::new(runtime), metrics)
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn timeout_for(&self, request: &ExecutionRequest) -> Duration {
        request.timeout.unwrap_or_else(|| match request.kind {
            ExecutionKind::ShellCommand => self.config.request.command_timeout(),
            ExecutionKind::Code | ExecutionKind::CodeWithNetwork => {
                self.config.request.code_timeout()
            }
        })
    }

    /// Code goes to the interpreter; shell commands go to the shell verbatim.
    pub fn entrypoint(&self, kind: ExecutionKind, payload: &str) -> Vec<String> {
        let program = match kind {
            ExecutionKind::ShellCommand => &self.config.image.shell,
            ExecutionKind::Code | ExecutionKind::CodeWithNetwork => &self.config.image.interpreter,
        };
        vec![program.clone(), "-c".to_string(), payload.to_string()]
    }

    fn reject(&self, kind: ExecutionKind, reason: String, started: Instant) -> ExecutionResult {
        log::info!("Rejected {} request: {}", kind, reason);
        self.metrics.record(MetricEvent::ValidationRejected { kind });
        let result = ExecutionResult::rejected(reason, started.elapsed());
        self.metrics.record(MetricEvent::ExecutionFinished {
            kind,
            status: result.status,
            duration: started.elapsed(),
        });
        result
    }
}

#[async_trait]
impl CodeExecutor for Dispatcher {
    async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        let kind = request.kind;
        self.metrics.record(MetricEvent::DispatchStarted { kind });

        if let Err(err) = self.validator.validate(kind, &request.payload) {
            return self.reject(kind, err.to_string(), started);
        }

        let timeout = self.timeout_for(&request);
        if timeout.is_zero() {
            return self.reject(kind, "Timeout must be greater than zero".to_string(), started);
        }

        let profile = self.policy.build_profile(kind);
        let entrypoint = self.entrypoint(kind, &request.payload);
        log::info!(
            "Dispatching {} request ({} bytes, timeout {:?}, network {})",
            kind,
            request.payload.len(),
            timeout,
            if profile.network_enabled() { "on" } else { "off" }
        );

        let outcome = self
            .lifecycle
            .run(&self.config.image.reference, entrypoint, &profile, timeout)
            .await;
        let result = self.collector.collect(outcome, started.elapsed());

        self.metrics.record(MetricEvent::ExecutionFinished {
            kind,
            status: result.status,
            duration: started.elapsed(),
        });
        log::info!(
            "{} request finished: {} (exit {:?}, {} ms)",
            kind,
            result.status,
            result.exit_code,
            result.duration_ms
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::ExecutionStatus;
    use crate::errors::RuntimeError;
    use crate::metrics::ExecutionMetrics;
    use crate::test_utils::MockRuntime;
    use std::collections::HashSet;

    fn dispatcher(runtime: Arc<MockRuntime>) -> (Dispatcher, Arc<ExecutionMetrics>) {
        dispatcher_with(SandboxConfig::default(), runtime)
    }

    fn dispatcher_with(
        config: SandboxConfig,
        runtime: Arc<MockRuntime>,
    ) -> (Dispatcher, Arc<ExecutionMetrics>) {
        let metrics = Arc::new(ExecutionMetrics::new());
        let dispatcher = Dispatcher::new(config, runtime, metrics.clone()).unwrap();
        (dispatcher, metrics)
    }

    #[tokio::test]
    async fn test_execute_code_success() {
        let runtime = Arc::new(MockRuntime::new().with_stdout("2\n"));
        let (dispatcher, metrics) = dispatcher(runtime.clone());

        let result = dispatcher.execute_code("print(1+1)").await;

        assert_eq!(result.status, ExecutionStatus::Success);
        assert!(result.stdout.contains('2'));
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(runtime.create_calls(), 1);
        assert_eq!(runtime.start_calls(), 1);
        assert_eq!(runtime.removed(), 1);
        assert_eq!(runtime.live_containers(), 0);

        let spec = runtime.last_spec().unwrap();
        assert_eq!(spec.entrypoint, vec!["python3", "-c", "print(1+1)"]);
        assert_eq!(spec.image, "sandrun/python-sandbox:3.12");
        assert!(!spec.profile.network_enabled());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.dispatched, 1);
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.containers_outstanding(), 0);
    }

    #[tokio::test]
    async fn test_oversized_payload_never_creates_container() {
        let runtime = Arc::new(MockRuntime::new());
        let (dispatcher, metrics) = dispatcher(runtime.clone());

        let payload = "x".repeat(64 * 1024 + 1);
        let result = dispatcher.execute_code(&payload).await;

        assert_eq!(result.status, ExecutionStatus::ValidationRejected);
        assert_eq!(result.exit_code, None);
        assert!(result.message.unwrap().contains("65537 bytes"));
        assert_eq!(runtime.create_calls(), 0);
        assert_eq!(metrics.snapshot().rejected, 1);
    }

    #[tokio::test]
    async fn test_prohibited_shell_pattern_is_rejected() {
        let runtime = Arc::new(MockRuntime::new());
        let (dispatcher, _) = dispatcher(runtime.clone());

        let result = dispatcher.execute_command("echo $(whoami)").await;

        assert_eq!(result.status, ExecutionStatus::ValidationRejected);
        assert!(result.message.unwrap().contains("command-substitution"));
        assert_eq!(runtime.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_zero_timeout_is_rejected() {
        let runtime = Arc::new(MockRuntime::new());
        let (dispatcher, _) = dispatcher(runtime.clone());

        let result = dispatcher
            .execute_with_timeout(ExecutionKind::Code, "print(1)", Duration::ZERO)
            .await;

        assert_eq!(result.status, ExecutionStatus::ValidationRejected);
        assert_eq!(runtime.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_timeout_kills_and_removes() {
        let runtime = Arc::new(
            MockRuntime::new()
                .with_wait_delay(Duration::from_secs(30))
                .with_stdout("partial"),
        );
        let (dispatcher, metrics) = dispatcher(runtime.clone());

        let started = Instant::now();
        let result = dispatcher
            .execute_with_timeout(
                ExecutionKind::Code,
                "while True: pass",
                Duration::from_millis(200),
            )
            .await;
        let elapsed = started.elapsed();

        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert_eq!(result.stdout, "partial");
        assert_eq!(result.exit_code, None);
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
        assert_eq!(runtime.kill_calls(), 1);
        assert_eq!(runtime.removed(), 1);
        assert_eq!(runtime.live_containers(), 0);
        assert_eq!(metrics.snapshot().timed_out, 1);
    }

    #[tokio::test]
    async fn test_shell_command_nonzero_exit() {
        let runtime = Arc::new(
            MockRuntime::new()
                .with_exit_code(1)
                .with_stderr("ERROR: No matching distribution found for nonexistent-package-xyz"),
        );
        let (dispatcher, _) = dispatcher(runtime.clone());

        let result = dispatcher
            .execute_command("pip install nonexistent-package-xyz")
            .await;

        assert_eq!(result.status, ExecutionStatus::NonZeroExit);
        assert_eq!(result.exit_code, Some(1));
        assert!(result.stderr.contains("No matching distribution"));

        let spec = runtime.last_spec().unwrap();
        assert_eq!(
            spec.entrypoint,
            vec!["/bin/sh", "-c", "pip install nonexistent-package-xyz"]
        );
        assert!(spec.profile.network_enabled());
        assert_eq!(runtime.removed(), 1);
    }

    #[tokio::test]
    async fn test_code_with_network_opts_in() {
        let runtime = Arc::new(MockRuntime::new());
        let (dispatcher, _) = dispatcher(runtime.clone());

        let result = dispatcher
            .execute_code_with_network("import urllib.request")
            .await;

        assert_eq!(result.status, ExecutionStatus::Success);
        let spec = runtime.last_spec().unwrap();
        assert_eq!(spec.entrypoint[0], "python3");
        assert!(spec.profile.network_enabled());
    }

    #[tokio::test]
    async fn test_missing_image_is_daemon_error_without_cleanup() {
        let runtime = Arc::new(MockRuntime::new().with_create_error(RuntimeError::ImageMissing {
            image: "sandrun/python-sandbox:3.12".to_string(),
        }));
        let (dispatcher, metrics) = dispatcher(runtime.clone());

        let result = dispatcher.execute_code("print(1)").await;

        assert_eq!(result.status, ExecutionStatus::DaemonError);
        assert_eq!(result.exit_code, None);
        assert!(result.message.unwrap().contains("build/verify the sandbox image"));
        assert_eq!(runtime.create_calls(), 1);
        assert_eq!(runtime.remove_calls(), 0);
        assert_eq!(metrics.snapshot().containers_created, 0);
        assert_eq!(metrics.snapshot().daemon_errors, 1);
    }

    #[tokio::test]
    async fn test_start_failure_still_removes_container() {
        let runtime = Arc::new(
            MockRuntime::new()
                .with_start_error(RuntimeError::Unavailable("connection reset".to_string())),
        );
        let (dispatcher, _) = dispatcher(runtime.clone());

        let result = dispatcher.execute_code("print(1)").await;

        assert_eq!(result.status, ExecutionStatus::DaemonError);
        assert_eq!(runtime.start_calls(), 1);
        assert_eq!(runtime.kill_calls(), 0);
        assert_eq!(runtime.removed(), 1);
        assert_eq!(runtime.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_wait_failure_is_daemon_error() {
        let runtime = Arc::new(MockRuntime::new().with_wait_error(RuntimeError::Daemon {
            operation: "wait_container",
            message: "daemon restarted".to_string(),
        }));
        let (dispatcher, _) = dispatcher(runtime.clone());

        let result = dispatcher.execute_code("print(1)").await;

        assert_eq!(result.status, ExecutionStatus::DaemonError);
        assert!(result.message.unwrap().contains("daemon restarted"));
        assert_eq!(runtime.removed(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_failure_does_not_mask_result() {
        let runtime = Arc::new(
            MockRuntime::new()
                .with_stdout("ok")
                .with_remove_error(RuntimeError::Unavailable("socket closed".to_string())),
        );
        let (dispatcher, metrics) = dispatcher(runtime.clone());

        let result = dispatcher.execute_code("print('ok')").await;

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.stdout, "ok");
        assert_eq!(runtime.remove_calls(), 1);
        assert_eq!(metrics.snapshot().cleanup_failures, 1);
    }

    #[tokio::test]
    async fn test_oom_kill_reported_as_non_success() {
        let runtime = Arc::new(MockRuntime::new().with_exit_code(137).with_oom_killed());
        let (dispatcher, _) = dispatcher(runtime.clone());

        let result = dispatcher.execute_code("x = 'a' * 10**10").await;

        assert_eq!(result.status, ExecutionStatus::NonZeroExit);
        assert!(result.oom_killed);
        assert_eq!(runtime.removed(), 1);
    }

    #[tokio::test]
    async fn test_output_is_truncated_to_cap() {
        let mut config = SandboxConfig::default();
        config.output.max_output_bytes = 8;
        let runtime = Arc::new(MockRuntime::new().with_stdout("0123456789abcdef"));
        let (dispatcher, _) = dispatcher_with(config, runtime);

        let result = dispatcher.execute_code("print('x' * 16)").await;

        assert_eq!(result.stdout, "01234567");
        assert!(result.stdout_truncated);
        assert!(!result.stderr_truncated);
    }

    #[tokio::test]
    async fn test_default_timeouts_by_kind() {
        let (dispatcher, _) = dispatcher(Arc::new(MockRuntime::new()));

        assert_eq!(
            dispatcher.timeout_for(&ExecutionRequest::code("1")),
            Duration::from_secs(30)
        );
        assert_eq!(
            dispatcher.timeout_for(&ExecutionRequest::code_with_network("1")),
            Duration::from_secs(30)
        );
        assert_eq!(
            dispatcher.timeout_for(&ExecutionRequest::command("ls")),
            Duration::from_secs(120)
        );
        assert_eq!(
            dispatcher.timeout_for(&ExecutionRequest::command("ls").with_timeout(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_each_get_their_own_container() {
        let runtime = Arc::new(
            MockRuntime::new()
                .with_stdout("done")
                .with_wait_delay(Duration::from_millis(20)),
        );
        let (dispatcher, metrics) = dispatcher(runtime.clone());
        let dispatcher = Arc::new(dispatcher);

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { dispatcher.execute_code(&format!("print({})", i)).await })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().status, ExecutionStatus::Success);
        }

        let ids: HashSet<_> = runtime.created_ids().into_iter().collect();
        assert_eq!(ids.len(), 16);
        assert_eq!(runtime.removed(), 16);
        assert_eq!(runtime.live_containers(), 0);
        assert_eq!(metrics.snapshot().containers_outstanding(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_request_still_removes_container() {
        let runtime = Arc::new(MockRuntime::new().with_wait_delay(Duration::from_secs(30)));
        let (dispatcher, _) = dispatcher(runtime.clone());

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            dispatcher.execute_code("while True: pass"),
        )
        .await;
        assert!(abandoned.is_err());

        // Removal is scheduled from the guard's Drop; let it run.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runtime.create_calls(), 1);
        assert_eq!(runtime.removed(), 1);
        assert_eq!(runtime.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_logs_failure_after_exit_is_daemon_error() {
        let runtime = Arc::new(
            MockRuntime::new()
                .with_stdout("lost")
                .with_logs_error(RuntimeError::Unavailable("stream reset".to_string())),
        );
        let (dispatcher, _) = dispatcher(runtime.clone());

        let result = dispatcher.execute_code("print('lost')").await;

        assert_eq!(result.status, ExecutionStatus::DaemonError);
        assert!(result.message.unwrap().contains("stream reset"));
        assert!(result.stdout.is_empty());
        assert_eq!(runtime.removed(), 1);
    }

    #[tokio::test]
    async fn test_logs_failure_after_timeout_keeps_timed_out() {
        let runtime = Arc::new(
            MockRuntime::new()
                .with_wait_delay(Duration::from_secs(30))
                .with_logs_error(RuntimeError::Unavailable("stream reset".to_string())),
        );
        let (dispatcher, _) = dispatcher(runtime.clone());

        let result = dispatcher
            .execute_with_timeout(
                ExecutionKind::Code,
                "while True: pass",
                Duration::from_millis(100),
            )
            .await;

        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert!(result.stdout.is_empty());
        assert!(result.stderr.is_empty());
        assert_eq!(runtime.kill_calls(), 1);
        assert_eq!(runtime.removed(), 1);
    }

    #[tokio::test]
    async fn test_timed_out_create_removes_container_by_name() {
        let mut config = SandboxConfig::default();
        config.daemon.operation_timeout_secs = 1;
        let runtime = Arc::new(MockRuntime::new().with_create_delay(Duration::from_secs(5)));
        let (dispatcher, metrics) = dispatcher_with(config, runtime.clone());

        let result = dispatcher.execute_code("print(1)").await;

        assert_eq!(result.status, ExecutionStatus::DaemonError);
        assert!(result.message.unwrap().contains("create_container"));
        assert_eq!(runtime.start_calls(), 0);
        assert_eq!(runtime.removed(), 1);
        assert_eq!(runtime.live_containers(), 0);
        assert_eq!(metrics.snapshot().containers_created, 0);
    }

    #[tokio::test]
    async fn test_abandoned_during_create_still_removes_container() {
        let runtime = Arc::new(MockRuntime::new().with_create_delay(Duration::from_millis(200)));
        let (dispatcher, _) = dispatcher(runtime.clone());

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), dispatcher.execute_code("print(1)"))
                .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runtime.start_calls(), 0);
        assert_eq!(runtime.removed(), 1);
        assert_eq!(runtime.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_during_cleanup_still_removes_container() {
        let runtime = Arc::new(MockRuntime::new().with_remove_delay(Duration::from_millis(200)));
        let (dispatcher, _) = dispatcher(runtime.clone());

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), dispatcher.execute_code("print(1)"))
                .await;
        assert!(abandoned.is_err());
        assert_eq!(runtime.remove_calls(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runtime.remove_calls(), 2);
        assert_eq!(runtime.removed(), 1);
        assert_eq!(runtime.live_containers(), 0);
    }
}
