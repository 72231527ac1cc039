//! Output capture and result assembly
//!
//! Capture is bounded while the log stream is read: bytes past the cap are
//! counted but never stored, so a chatty program cannot grow host memory. The
//! resulting [`ExecutionResult`] carries explicit truncation flags.

use crate::core_types::{ExecutionResult, ExecutionStatus};
use crate::lifecycle::{RunOutcome, RunStatus};
use std::time::Duration;

/// A byte buffer that keeps at most `cap` bytes and counts the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputBuffer {
    data: Vec<u8>,
    cap: usize,
    dropped: usize,
}

impl OutputBuffer {
    pub fn with_cap(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.data.len());
        let kept = chunk.len().min(room);
        self.data.extend_from_slice(&chunk[..kept]);
        self.dropped += chunk.len() - kept;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn is_truncated(&self) -> bool {
        self.dropped > 0
    }
}

/// Separate stdout/stderr captures for one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: OutputBuffer,
    pub stderr: OutputBuffer,
}

impl RawOutput {
    pub fn with_cap(cap: usize) -> Self {
        Self {
            stdout: OutputBuffer::with_cap(cap),
            stderr: OutputBuffer::with_cap(cap),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResultCollector {
    max_output_bytes: usize,
}

impl ResultCollector {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    pub fn collect(&self, outcome: RunOutcome, duration: Duration) -> ExecutionResult {
        let (stdout, stdout_truncated) = self.render(&outcome.output.stdout);
        let (stderr, stderr_truncated) = self.render(&outcome.output.stderr);

        let (status, exit_code, message) = match outcome.status {
            RunStatus::Completed { exit_code: 0 } => (ExecutionStatus::Success, Some(0), None),
            RunStatus::Completed { exit_code } => {
                let message = if outcome.oom_killed {
                    Some("Process was killed after exceeding the memory limit".to_string())
                } else {
                    None
                };
                (ExecutionStatus::NonZeroExit, Some(exit_code), message)
            }
            RunStatus::TimedOut { after } => (
                ExecutionStatus::TimedOut,
                None,
                Some(format!(
                    "Execution exceeded its {:.1}s time limit and was killed",
                    after.as_secs_f64()
                )),
            ),
            RunStatus::Failed(err) => (ExecutionStatus::DaemonError, None, Some(err.to_string())),
        };

        ExecutionResult {
            status,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            exit_code,
            duration_ms: duration.as_millis() as u64,
            message,
            oom_killed: outcome.oom_killed,
        }
    }

    fn render(&self, buffer: &OutputBuffer) -> (String, bool) {
        let bytes = buffer.as_bytes();
        let truncated = buffer.is_truncated() || bytes.len() > self.max_output_bytes;
        let bytes = &bytes[..bytes.len().min(self.max_output_bytes)];

        if !truncated {
            return (String::from_utf8_lossy(bytes).into_owned(), false);
        }

        // Don't leave half a character at the cut.
        let text = match std::str::from_utf8(bytes) {
            Ok(text) => text.to_string(),
            Err(e) if e.error_len().is_none() => {
                String::from_utf8_lossy(&bytes[..e.valid_up_to()]).into_owned()
            }
            Err(_) => String::from_utf8_lossy(bytes).into_owned(),
        };
        (text, true)
    }
}
