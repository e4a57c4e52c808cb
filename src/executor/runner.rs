use crate::error::{PilotError, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;

/// Hard cap on bytes captured per stream
const MAX_CAPTURE_BYTES: usize = 4 * 1024 * 1024;

/// How long to wait for pipes to drain after the process group is killed
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Raw result of one subprocess
#[derive(Debug, Clone)]
pub struct RawOutput {
    /// `None` when the process was killed on timeout or by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl RawOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Spawns commands in their own process group so a timeout can take down
/// the whole tree.
pub struct CommandRunner;

impl CommandRunner {
    pub fn new() -> Self {
        Self
    }

    pub async fn execute(
        &self,
        argv: &[String],
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> Result<RawOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| PilotError::Execution("empty argv".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let start = Instant::now();
        let mut child = command.spawn()?;
        let pid = child.id();

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stdout_task = child
            .stdout
            .take()
            .map(|s| tokio::spawn(drain(s, Arc::clone(&stdout_buf))));
        let stderr_task = child
            .stderr
            .take()
            .map(|s| tokio::spawn(drain(s, Arc::clone(&stderr_buf))));

        let waited = tokio::time::timeout(timeout, child.wait()).await;
        let (exit_code, timed_out) = match waited {
            Ok(status) => (status?.code(), false),
            Err(_) => {
                if let Some(pid) = pid {
                    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                        tracing::warn!(pid, error = %e, "failed to kill process group");
                    }
                }
                let _ = child.kill().await;
                (None, true)
            }
        };

        for task in [stdout_task, stderr_task].into_iter().flatten() {
            let abort = task.abort_handle();
            if tokio::time::timeout(DRAIN_GRACE, task).await.is_err() {
                // A grandchild escaped the group and still holds the pipe
                abort.abort();
            }
        }

        let stdout = String::from_utf8_lossy(&stdout_buf.lock().await).to_string();
        let stderr = String::from_utf8_lossy(&stderr_buf.lock().await).to_string();

        Ok(RawOutput {
            exit_code,
            stdout,
            stderr,
            timed_out,
            duration: start.elapsed(),
        })
    }
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy a pipe into a shared buffer chunk by chunk, so output read before
/// a kill survives even if this task is aborted.
async fn drain<R: AsyncRead + Unpin>(mut reader: R, buf: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut buf = buf.lock().await;
                let room = MAX_CAPTURE_BYTES.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
}

/// Cut `text` to at most `max` bytes on a char boundary
pub fn truncate_output(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated {} bytes]", &text[..end], text.len() - end)
}
