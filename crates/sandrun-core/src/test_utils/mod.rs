//! In-memory [`ContainerRuntime`] for unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::collector::RawOutput;
use crate::errors::RuntimeError;
use crate::lifecycle::{ContainerRuntime, ContainerSpec};

/// Records every call and tracks which containers are still "alive".
/// Containers can be removed by id or by the name they were created under;
/// removing an unknown container yields `RuntimeError::NotFound`, as the
/// Docker daemon does.
#[derive(Default)]
pub struct MockRuntime {
    exit_code: i64,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    wait_delay: Duration,
    create_delay: Duration,
    remove_delay: Duration,
    oom_killed: bool,
    create_error: Option<RuntimeError>,
    start_error: Option<RuntimeError>,
    wait_error: Option<RuntimeError>,
    logs_error: Option<RuntimeError>,
    remove_error: Option<RuntimeError>,

    next_id: AtomicUsize,
    create_calls: AtomicUsize,
    start_calls: AtomicUsize,
    kill_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    removed: AtomicUsize,
    live: Mutex<HashSet<String>>,
    names: Mutex<HashMap<String, String>>,
    created: Mutex<Vec<String>>,
    specs: Mutex<Vec<ContainerSpec>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exit_code(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_stdout(mut self, stdout: &str) -> Self {
        self.stdout = stdout.as_bytes().to_vec();
        self
    }

    pub fn with_stderr(mut self, stderr: &str) -> Self {
        self.stderr = stderr.as_bytes().to_vec();
        self
    }

    pub fn with_wait_delay(mut self, delay: Duration) -> Self {
        self.wait_delay = delay;
        self
    }

    /// The container exists on the "daemon" as soon as create is called;
    /// only the reply is delayed.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn with_remove_delay(mut self, delay: Duration) -> Self {
        self.remove_delay = delay;
        self
    }

    pub fn with_oom_killed(mut self) -> Self {
        self.oom_killed = true;
        self
    }

    pub fn with_create_error(mut self, err: RuntimeError) -> Self {
        self.create_error = Some(err);
        self
    }

    pub fn with_start_error(mut self, err: RuntimeError) -> Self {
        self.start_error = Some(err);
        self
    }

    pub fn with_wait_error(mut self, err: RuntimeError) -> Self {
        self.wait_error = Some(err);
        self
    }

    pub fn with_logs_error(mut self, err: RuntimeError) -> Self {
        self.logs_error = Some(err);
        self
    }

    pub fn with_remove_error(mut self, err: RuntimeError) -> Self {
        self.remove_error = Some(err);
        self
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn kill_calls(&self) -> usize {
        self.kill_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    /// Successful removals of a live container.
    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn live_containers(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn created_ids(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn last_spec(&self) -> Option<ContainerSpec> {
        self.specs.lock().unwrap().last().cloned()
    }

    /// Register a container without going through `create`.
    pub fn insert_live(&self, id: &str) {
        self.live.lock().unwrap().insert(id.to_string());
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.specs.lock().unwrap().push(spec.clone());
        if let Some(err) = &self.create_error {
            return Err(err.clone());
        }

        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.live.lock().unwrap().insert(id.clone());
        self.names.lock().unwrap().insert(spec.name.clone(), id.clone());
        self.created.lock().unwrap().push(id.clone());

        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        Ok(id)
    }

    async fn start(&self, _id: &str) -> Result<(), RuntimeError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        match &self.start_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn wait(&self, _id: &str) -> Result<i64, RuntimeError> {
        if !self.wait_delay.is_zero() {
            tokio::time::sleep(self.wait_delay).await;
        }
        match &self.wait_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.exit_code),
        }
    }

    async fn kill(&self, _id: &str) -> Result<(), RuntimeError> {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn logs(&self, _id: &str, cap: usize) -> Result<RawOutput, RuntimeError> {
        if let Some(err) = &self.logs_error {
            return Err(err.clone());
        }
        let mut output = RawOutput::with_cap(cap);
        output.stdout.push(&self.stdout);
        output.stderr.push(&self.stderr);
        Ok(output)
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.remove_error {
            return Err(err.clone());
        }

        if !self.remove_delay.is_zero() {
            tokio::time::sleep(self.remove_delay).await;
        }

        let id = self
            .names
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string());
        if self.live.lock().unwrap().remove(&id) {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        } else {
            Err(RuntimeError::NotFound { container: id })
        }
    }

    async fn oom_killed(&self, _id: &str) -> Result<bool, RuntimeError> {
        Ok(self.oom_killed)
    }
}
