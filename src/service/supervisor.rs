//! Supervision of a single Tor process
//!
//! A supervisor launches Tor once, follows its log output until bootstrap
//! completes or fails, and exposes the control-port and probe operations that
//! are only meaningful while the process runs. It is single-use: after a stop
//! a new supervisor has to be created.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::control::{self, ControlReply, SIGNAL_NEWNYM};
use super::executor::{ExecuteRequest, ExecutionResult, LineCallback, ProcessExecutor};
use super::probe::probe_network;
use super::scanner::scan_line;
use super::signal::{AsyncSignal, SignalWait};
use crate::config::ServiceConfig;
use crate::error::{Result, TorPoolError};
use crate::models::{NetworkProbeResult, ProcessInstanceConfig, ProcessStatus};

/// Outcome of [`ProcessSupervisor::start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Process spawned; bootstrap is in progress
    Started,
    /// A process from an earlier `start` is still running
    AlreadyRunning,
    /// Failed before spawning; see `last_error`
    FailedToStart,
}

pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    service: Arc<ServiceConfig>,
    executor: Arc<dyn ProcessExecutor>,
    status: RwLock<ProcessStatus>,
    last_error: RwLock<Option<String>>,
    config: RwLock<Option<ProcessInstanceConfig>>,
    startup: AsyncSignal,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<ExecutionResult>>>,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl ProcessSupervisor {
    pub fn new(service: Arc<ServiceConfig>, executor: Arc<dyn ProcessExecutor>) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                service,
                executor,
                status: RwLock::new(ProcessStatus::NotStarted),
                last_error: RwLock::new(None),
                config: RwLock::new(None),
                startup: AsyncSignal::new(),
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
                started: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn status(&self) -> ProcessStatus {
        *self.inner.status.read()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.read().clone()
    }

    /// Ports and directory of the current (or last) run
    pub fn config(&self) -> Option<ProcessInstanceConfig> {
        self.inner.config.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.status().is_running()
    }

    /// Launch the process and begin watching its output
    ///
    /// Does not wait for bootstrap; use [`wait_for_startup`](Self::wait_for_startup).
    #[instrument(skip(self, config, on_output), fields(control_port = config.control_port, socks_port = config.socks_port))]
    pub async fn start(
        &self,
        config: ProcessInstanceConfig,
        on_output: Option<LineCallback>,
    ) -> Result<StartOutcome> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            let status = self.status();
            if status.is_running() {
                return Ok(StartOutcome::AlreadyRunning);
            }
            return Err(TorPoolError::AlreadyStarted);
        }

        *self.inner.config.write() = Some(config.clone());
        self.inner.startup.reset();
        self.inner.set_status(ProcessStatus::Starting);

        if let Some(ref dir) = config.data_directory {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                self.inner.fail(format!(
                    "failed to create data directory {}: {}",
                    dir.display(),
                    e
                ));
                self.inner.startup.set();
                return Ok(StartOutcome::FailedToStart);
            }
        }

        let request = ExecuteRequest {
            executable: self.inner.service.executable.clone(),
            args: build_arguments(
                &self.inner.service.arguments,
                &self.inner.service.working_dir,
                &config,
            ),
            working_dir: Some(self.inner.service.working_dir.clone()),
        };
        debug!("Launching {:?} {:?}", request.executable, request.args);

        let scanner = self.inner.clone();
        let on_line: LineCallback = Arc::new(move |line: &str| {
            if let Some(ref forward) = on_output {
                forward(line);
            }
            scanner.handle_output_line(line);
        });

        let inner = self.inner.clone();
        let executor = self.inner.executor.clone();
        let cancel = self.inner.cancel.clone();
        let handle = tokio::spawn(async move {
            let result = executor.execute(request, on_line, cancel).await;
            inner.handle_exit(&result);
            result
        });

        *self.inner.task.lock() = Some(handle);
        Ok(StartOutcome::Started)
    }

    /// Wait until bootstrap finished or failed; true only when connected
    pub async fn wait_for_startup(&self, timeout: Option<Duration>) -> bool {
        self.wait_for_startup_with_cancel(timeout, None).await
    }

    pub async fn wait_for_startup_with_cancel(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> bool {
        if !self.inner.started.load(Ordering::SeqCst) {
            return false;
        }

        match self.inner.startup.wait(timeout, cancel).await {
            SignalWait::Released => {}
            SignalWait::TimedOut => {
                warn!("Tor did not finish bootstrapping within {:?}", timeout);
            }
            SignalWait::Canceled => debug!("Startup wait canceled"),
        }

        matches!(
            self.status(),
            ProcessStatus::Connected | ProcessStatus::ExecutingControlCommand
        )
    }

    /// Start and wait for the process to exit
    pub async fn run_to_completion(
        &self,
        config: ProcessInstanceConfig,
        on_output: Option<LineCallback>,
    ) -> Result<ExecutionResult> {
        match self.start(config, on_output).await? {
            StartOutcome::Started => {}
            StartOutcome::FailedToStart => {
                return Ok(ExecutionResult::failed(
                    self.last_error().unwrap_or_else(|| "failed to start".into()),
                ))
            }
            StartOutcome::AlreadyRunning => {
                return Err(TorPoolError::InvalidState {
                    status: self.status(),
                })
            }
        }

        let handle = self.inner.task.lock().take();
        let result = match handle {
            Some(handle) => handle
                .await
                .map_err(|e| TorPoolError::Internal(format!("process task failed: {}", e)))?,
            None => return Err(TorPoolError::Internal("process task missing".into())),
        };

        self.inner.remove_data_directory().await;
        Ok(result)
    }

    /// Run one authenticated command on the control port
    pub async fn execute_control_command(&self, command: &str) -> Result<ControlReply> {
        let status = self.status();
        let config = match self.config() {
            Some(config) if status.is_running() => config,
            _ => return Err(TorPoolError::InvalidState { status }),
        };

        control::send_command(
            &config.control_addr(),
            &self.inner.service.control_password,
            command,
            self.inner.service.control_timeout(),
        )
        .await
    }

    /// Ask Tor for new circuits (SIGNAL NEWNYM)
    ///
    /// Tor rate-limits this signal, so success does not guarantee a new exit yet.
    pub async fn request_clean_circuits(&self) -> Result<bool> {
        {
            let mut status = self.inner.status.write();
            if *status != ProcessStatus::Connected {
                return Err(TorPoolError::InvalidState { status: *status });
            }
            *status = ProcessStatus::ExecutingControlCommand;
        }

        let result = self.execute_control_command(SIGNAL_NEWNYM).await;

        {
            let mut status = self.inner.status.write();
            if *status == ProcessStatus::ExecutingControlCommand {
                *status = ProcessStatus::Connected;
            }
        }

        match result {
            Ok(reply) if reply.success => {
                info!("Requested clean circuits");
                Ok(true)
            }
            Ok(reply) => {
                let error = TorPoolError::ControlCommand(format!(
                    "SIGNAL NEWNYM rejected: {}",
                    reply.text()
                ));
                self.inner.record_error(error.to_string());
                Ok(false)
            }
            Err(e) => {
                self.inner.record_error(e.to_string());
                Ok(false)
            }
        }
    }

    /// Probe the status endpoint through this instance's SOCKS port
    pub async fn get_network_status(&self) -> NetworkProbeResult {
        let status = self.status();
        let config = match self.config() {
            Some(config) if status.is_running() => config,
            _ => return NetworkProbeResult::failed(format!("process is {}", status)),
        };

        probe_network(
            &config,
            &self.inner.service.status_url,
            self.inner.service.probe_timeout(),
        )
        .await
    }

    /// Stop the process and remove its data directory
    ///
    /// None when nothing was running.
    pub async fn stop(&self) -> Option<ExecutionResult> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return None;
        }

        self.inner.cancel.cancel();

        let handle = self.inner.task.lock().take();
        let result = match handle {
            Some(handle) => {
                info!("Stopping Tor process");
                match handle.await {
                    Ok(result) => Some(result),
                    Err(e) => {
                        warn!("Process task ended abnormally: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        self.inner.remove_data_directory().await;
        result
    }

    /// Stop, clean up and release waiters; safe to call more than once
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.stop().await;
        self.inner.remove_data_directory().await;
        self.inner.startup.close();
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        // kill_on_drop in the executor finishes the job once the task sees the cancel.
        self.inner.cancel.cancel();
        self.inner.startup.close();
        if let Some(dir) = self.config().and_then(|c| c.data_directory) {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}

impl SupervisorInner {
    fn set_status(&self, status: ProcessStatus) {
        let mut current = self.status.write();
        if *current != status {
            debug!("Process status: {} -> {}", *current, status);
            *current = status;
        }
    }

    fn record_error(&self, error: String) {
        warn!("{}", error);
        *self.last_error.write() = Some(error);
    }

    fn fail(&self, error: String) {
        self.record_error(error);
        self.set_status(ProcessStatus::FailedToConnect);
    }

    fn handle_output_line(&self, line: &str) {
        let outcome = {
            let mut status = self.status.write();
            let outcome = scan_line(*status, line);
            if outcome.status != *status {
                debug!("Process status: {} -> {}", *status, outcome.status);
                *status = outcome.status;
            }
            outcome
        };

        match outcome.release {
            Some(Ok(())) => {
                info!("Tor finished bootstrapping");
                self.startup.set();
            }
            Some(Err(line)) => {
                self.record_error(format!("Tor failed to start: {}", line));
                self.startup.set();
            }
            None => {}
        }
    }

    fn handle_exit(&self, result: &ExecutionResult) {
        let previous = *self.status.read();
        match previous {
            ProcessStatus::FailedToConnect => {}
            ProcessStatus::Starting if !result.killed => {
                let reason = result
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("exit code {:?}", result.exit_code));
                self.fail(format!("process exited before bootstrapping ({})", reason));
            }
            _ => self.set_status(ProcessStatus::Stopped),
        }

        info!(
            "Tor process ended (code: {:?}, killed: {})",
            result.exit_code, result.killed
        );
        self.startup.set();
    }

    async fn remove_data_directory(&self) {
        let Some(dir) = self.config.read().as_ref().and_then(|c| c.data_directory.clone()) else {
            return;
        };

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!("Removed data directory {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!("Could not remove data directory {}: {}", dir.display(), e),
        }
    }
}

/// Expand the argument template for one instance
///
/// The template is split on whitespace first so substituted paths may contain spaces.
pub fn build_arguments(
    template: &str,
    working_dir: &Path,
    config: &ProcessInstanceConfig,
) -> Vec<String> {
    let cwd = working_dir.to_string_lossy();
    let socks = config.socks_port.to_string();
    let control = config.control_port.to_string();

    let mut args: Vec<String> = template
        .split_whitespace()
        .map(|token| {
            token
                .replace("{cwd}", &cwd)
                .replace("{socksPort}", &socks)
                .replace("{controlPort}", &control)
        })
        .collect();

    if let Some(ref dir) = config.data_directory {
        args.push("--DataDirectory".to_string());
        args.push(dir.to_string_lossy().into_owned());
    }

    args
}
