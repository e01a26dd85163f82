//! External process execution
//!
//! Runs an executable, streams its combined stdout/stderr line by line to a
//! callback and supports cooperative cancellation that escalates to killing
//! the whole process group.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Called once per output line, in order
pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

const MAX_CAPTURED_LINES: usize = 1000;

/// What to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteRequest {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

/// How a process run ended
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionResult {
    pub exit_code: Option<i32>,
    /// Last captured output lines
    pub output: Vec<String>,
    pub error: Option<String>,
    /// Terminated because of cancellation
    pub killed: bool,
}

impl ExecutionResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none() && self.exit_code == Some(0)
    }
}

/// Capability to run an external process
#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    /// Run to completion; cancellation terminates the process and still returns a result
    async fn execute(
        &self,
        request: ExecuteRequest,
        on_line: LineCallback,
        cancel: CancellationToken,
    ) -> ExecutionResult;
}

/// [`ProcessExecutor`] backed by `tokio::process`
pub struct TokioProcessExecutor {
    /// Time between the polite termination request and the forced kill
    grace: Duration,
}

impl TokioProcessExecutor {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

impl Default for TokioProcessExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl ProcessExecutor for TokioProcessExecutor {
    async fn execute(
        &self,
        request: ExecuteRequest,
        on_line: LineCallback,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let mut cmd = Command::new(&request.executable);
        cmd.args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = request.working_dir {
            cmd.current_dir(dir);
        }

        // Own process group so termination reaches every descendant.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn {:?}: {}", request.executable, e);
                return ExecutionResult::failed(format!(
                    "failed to spawn {}: {}",
                    request.executable.display(),
                    e
                ));
            }
        };

        info!(
            "Started {:?} with PID {}",
            request.executable,
            child.id().unwrap_or(0)
        );

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill().await;
            return ExecutionResult::failed("process output pipes unavailable");
        };

        let mut lines = LinesStream::new(BufReader::new(stdout).lines())
            .merge(LinesStream::new(BufReader::new(stderr).lines()));

        let mut output = VecDeque::with_capacity(64);
        let mut killed = false;

        loop {
            tokio::select! {
                line = lines.next() => match line {
                    Some(Ok(line)) => {
                        trace!(target: "torpool::process", "{}", line);
                        on_line(line.as_str());
                        if output.len() == MAX_CAPTURED_LINES {
                            output.pop_front();
                        }
                        output.push_back(line);
                    }
                    Some(Err(e)) => {
                        warn!("Failed to read process output: {}", e);
                        break;
                    }
                    None => break,
                },
                _ = cancel.cancelled() => {
                    killed = true;
                    break;
                }
            }
        }

        let status = if killed {
            terminate(&mut child, self.grace).await
        } else {
            tokio::select! {
                status = child.wait() => status,
                _ = cancel.cancelled() => {
                    killed = true;
                    terminate(&mut child, self.grace).await
                }
            }
        };

        let (exit_code, error) = match status {
            Ok(status) => (status.code(), None),
            Err(e) => (None, Some(format!("failed to wait for process: {}", e))),
        };

        debug!(
            "Process {:?} exited (code: {:?}, killed: {})",
            request.executable, exit_code, killed
        );

        ExecutionResult {
            exit_code,
            output: output.into(),
            error,
            killed,
        }
    }
}

/// Ask the process group to stop, then kill it after `grace`
async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    signal_group(child, nix::sys::signal::Signal::SIGTERM);
    #[cfg(not(unix))]
    let _ = child.start_kill();

    match timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("Process did not exit within {:?}, killing it", grace);
            #[cfg(unix)]
            signal_group(child, nix::sys::signal::Signal::SIGKILL);
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
            debug!("killpg({}, {:?}) failed: {}", pid, signal, e);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn shell(script: &str) -> ExecuteRequest {
        ExecuteRequest {
            executable: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: None,
        }
    }

    fn collecting_callback() -> (LineCallback, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: LineCallback = Arc::new(move |line: &str| sink.lock().push(line.to_string()));
        (callback, seen)
    }

    #[tokio::test]
    async fn test_streams_stdout_and_stderr() {
        let executor = TokioProcessExecutor::default();
        let (callback, seen) = collecting_callback();

        let result = executor
            .execute(
                shell("echo out-line; echo err-line 1>&2; exit 3"),
                callback,
                CancellationToken::new(),
            )
            .await;

        assert_eq!(result.exit_code, Some(3));
        assert!(!result.killed);
        assert!(result.error.is_none());

        let seen = seen.lock();
        assert!(seen.contains(&"out-line".to_string()));
        assert!(seen.contains(&"err-line".to_string()));
        assert_eq!(result.output.len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_kills_process_tree() {
        let executor = TokioProcessExecutor::new(Duration::from_millis(500));
        let (callback, _seen) = collecting_callback();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let result = timeout(
            Duration::from_secs(10),
            executor.execute(shell("echo started; sleep 30"), callback, cancel),
        )
        .await
        .expect("cancellation must end the run");

        assert!(result.killed);
        assert_eq!(result.output, vec!["started".to_string()]);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let executor = TokioProcessExecutor::default();
        let (callback, _seen) = collecting_callback();

        let result = executor
            .execute(
                ExecuteRequest {
                    executable: PathBuf::from("/nonexistent/torpool-test-binary"),
                    args: vec![],
                    working_dir: None,
                },
                callback,
                CancellationToken::new(),
            )
            .await;

        assert!(result.exit_code.is_none());
        assert!(result.error.as_deref().unwrap().contains("failed to spawn"));
        assert!(!result.success());
    }
}
