// src/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput; // For LogOutput::StdOut, LogOutput::StdErr
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    InspectContainerOptions as BollardInspectContainerOptionsQuery,
    KillContainerOptionsBuilder, LogsOptions as BollardLogsOptionsQuery,
    RemoveContainerOptionsBuilder,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::stream::{Stream, StreamExt};
use std::collections::HashMap;
use std::time::Duration;

use crate::collector::{OutputBuffer, RawOutput};
use crate::config::types::DaemonConfig;
use crate::errors::RuntimeError;
use crate::lifecycle::{ContainerRuntime, ContainerSpec};
use crate::policy::ResourceProfile;

/// Label put on every sandbox container so strays can be found and reaped.
pub const MANAGED_LABEL: &str = "io.sandrun.managed";

/// [`ContainerRuntime`] backed by the Docker Engine API.
///
/// `bollard::Docker` is a cheap, clonable handle over a connection pool and is
/// safe to share between concurrent requests.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect(config: &DaemonConfig) -> Result<Self, RuntimeError> {
        let timeout = config.connect_timeout_secs;
        let docker = match config.endpoint.as_deref() {
            None => Docker::connect_with_local_defaults()
                .map(|docker| docker.with_timeout(Duration::from_secs(timeout))),
            Some(endpoint) if endpoint.starts_with("unix://") => Docker::connect_with_socket(
                endpoint.trim_start_matches("unix://"),
                timeout,
                API_DEFAULT_VERSION,
            ),
            Some(endpoint) => Docker::connect_with_http(endpoint, timeout, API_DEFAULT_VERSION),
        }
        .map_err(|e| RuntimeError::Unavailable(format!("Failed to connect to Docker: {}", e)))?;

        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Round-trip to the daemon; returns the engine version.
    pub async fn ping(&self) -> Result<String, RuntimeError> {
        self.docker
            .ping()
            .await
            .map_err(|e| RuntimeError::from_bollard("ping", "daemon", e))?;
        let version = self
            .docker
            .version()
            .await
            .map_err(|e| RuntimeError::from_bollard("version", "daemon", e))?;
        Ok(version.version.unwrap_or_else(|| "unknown".to_string()))
    }

    /// Confirm the sandbox image is present locally. Images are never pulled
    /// at request time.
    pub async fn verify_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.docker
            .inspect_image(image)
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::from_bollard("inspect_image", image, e))
    }
}

pub(crate) fn host_config(profile: &ResourceProfile) -> HostConfig {
    let memory = i64::try_from(profile.memory_limit_bytes()).unwrap_or(i64::MAX);

    let tmpfs = if profile.read_only_rootfs() {
        let mut mounts = HashMap::new();
        mounts.insert(
            "/tmp".to_string(),
            format!("rw,noexec,nosuid,size={}", profile.tmpfs_size_bytes()),
        );
        Some(mounts)
    } else {
        None
    };

    HostConfig {
        memory: Some(memory),
        // Equal to memory: no swap on top of the ceiling.
        memory_swap: Some(memory),
        nano_cpus: Some(profile.nano_cpus()),
        pids_limit: Some(i64::from(profile.pids_limit())),
        cap_drop: Some(
            profile
                .capabilities_dropped()
                .iter()
                .map(|cap| cap.to_string())
                .collect(),
        ),
        security_opt: if profile.no_new_privileges() {
            Some(vec!["no-new-privileges:true".to_string()])
        } else {
            None
        },
        privileged: Some(false),
        network_mode: Some(if profile.network_enabled() { "bridge" } else { "none" }.to_string()),
        readonly_rootfs: Some(profile.read_only_rootfs()),
        tmpfs,
        auto_remove: Some(false),
        ..Default::default()
    }
}

pub(crate) fn container_body(spec: &ContainerSpec) -> ContainerCreateBody {
    let mut labels = HashMap::new();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        cmd: Some(spec.entrypoint.clone()),
        user: Some(spec.profile.user().to_string()),
        network_disabled: Some(!spec.profile.network_enabled()),
        labels: Some(labels),
        host_config: Some(host_config(&spec.profile)),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(false),
        ..Default::default()
    }
}

/// Copy log frames into `buffer` until the stream ends or the buffer has
/// dropped bytes. Anything left unread is covered by the truncation flag.
pub(crate) async fn drain_logs<S>(
    stream: S,
    buffer: &mut OutputBuffer,
) -> Result<(), bollard::errors::Error>
where
    S: Stream<Item = Result<LogOutput, bollard::errors::Error>>,
{
    let mut stream = std::pin::pin!(stream);
    while let Some(frame) = stream.next().await {
        match frame? {
            LogOutput::StdOut { message }
            | LogOutput::StdErr { message }
            | LogOutput::Console { message } => buffer.push(&message),
            _ => {}
        }
        if buffer.is_truncated() {
            log::debug!("Output cap reached; {} bytes dropped", buffer.dropped());
            break;
        }
    }
    Ok(())
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(spec.name.clone()),
            ..Default::default()
        });

        let container = self
            .docker
            .create_container(options, container_body(spec))
            .await
            .map_err(|e| RuntimeError::from_bollard("create_container", &spec.image, e))?;

        for warning in &container.warnings {
            log::warn!("Docker warning for {}: {}", container.id, warning);
        }
        Ok(container.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<BollardStartContainerOptionsQuery>)
            .await
            .map_err(|e| RuntimeError::from_bollard("start_container", id, e))
    }

    async fn wait(&self, id: &str) -> Result<i64, RuntimeError> {
        // wait_container returns a stream. We need to await the next item for the result.
        let mut wait_stream = self
            .docker
            .wait_container(id, None::<BollardWaitContainerOptionsQuery>);

        match wait_stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a nonzero exit as an error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(RuntimeError::from_bollard("wait_container", id, e)),
            None => Err(RuntimeError::Daemon {
                operation: "wait_container",
                message: "Container wait stream ended unexpectedly".to_string(),
            }),
        }
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        let options = KillContainerOptionsBuilder::new().signal("SIGKILL").build();
        self.docker
            .kill_container(id, Some(options))
            .await
            .map_err(|e| RuntimeError::from_bollard("kill_container", id, e))
    }

    async fn logs(&self, id: &str, cap: usize) -> Result<RawOutput, RuntimeError> {
        // One stream per channel so a flood on stdout cannot starve stderr,
        // and each read stops as soon as its buffer overflows.
        let mut output = RawOutput::with_cap(cap);
        for (buffer, stdout) in [(&mut output.stdout, true), (&mut output.stderr, false)] {
            let stream = self.docker.logs(
                id,
                Some(BollardLogsOptionsQuery {
                    stdout,
                    stderr: !stdout,
                    ..Default::default()
                }),
            );
            drain_logs(stream, buffer)
                .await
                .map_err(|e| RuntimeError::from_bollard("logs", id, e))?;
        }
        Ok(output)
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptionsBuilder::new().force(true).v(true).build();
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| RuntimeError::from_bollard("remove_container", id, e))
    }

    async fn oom_killed(&self, id: &str) -> Result<bool, RuntimeError> {
        let details = self
            .docker
            .inspect_container(id, None::<BollardInspectContainerOptionsQuery>)
            .await
            .map_err(|e| RuntimeError::from_bollard("inspect_container", id, e))?;
        Ok(details
            .state
            .and_then(|state| state.oom_killed)
            .unwrap_or(false))
    }
}
