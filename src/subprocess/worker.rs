//! The long-lived worker process and the request/response protocol spoken
//! over its stdio.
//!
//! A request is a JSON array of string tokens followed by one NUL byte. The
//! worker answers with UTF-8 text and marks the end of the response by making
//! NUL the last byte of a stdout chunk. stderr is a free-form log side channel.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::ToolConfig;

use super::cancel::kill_process_tree_off_runtime;
use super::command::{encode_request, ToolCommand};
use super::error::ProcessError;
use super::failure::{translate, ExitStatus};
use super::stderr::{drain_stderr, StderrCapture};

const STDOUT_CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Unstarted,
    Launching,
    Ready,
    Busy,
    Failed,
}

/// Everything the dispatch loop learns about the worker arrives as one of
/// these, in the order the pumps observed it.
#[derive(Debug)]
pub enum WorkerEvent {
    Data(Vec<u8>),
    Closed(ExitStatus),
    Errored(std::io::Error),
}

/// Collects stdout chunks until one ends with the NUL terminator.
#[derive(Debug, Default)]
pub struct ResponseAccumulator {
    buffer: Vec<u8>,
    terminated: bool,
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only the last byte of the most recent chunk decides termination.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        self.terminated = chunk.last() == Some(&0);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn into_text(mut self) -> String {
        if self.terminated {
            self.buffer.pop();
        }
        String::from_utf8_lossy(&self.buffer).into_owned()
    }
}

/// The stdio and lifecycle hooks of a launched worker.
pub struct WorkerProcess {
    pub pid: Option<u32>,
    pub stdin: Pin<Box<dyn AsyncWrite + Send>>,
    pub stdout: Pin<Box<dyn AsyncRead + Send>>,
    pub stderr: Pin<Box<dyn AsyncRead + Send>>,
    /// Resolves once the process has exited.
    pub exited: BoxFuture<'static, ExitStatus>,
    /// Kill the process and everything it spawned.
    pub kill: Box<dyn FnOnce() + Send>,
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self) -> Result<WorkerProcess, ProcessError>;
}

/// Launches the real tool in worker mode.
#[derive(Debug, Clone)]
pub struct ToolWorkerLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ToolWorkerLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `<worker command> <worker args> [debug args] <logging flags>`
    pub fn from_config(config: &ToolConfig) -> Self {
        let mut args = config.worker_command.clone();
        args.extend(config.worker_args.iter().cloned());
        if config.worker_debug_enabled() {
            args.extend(config.debug_worker_args.iter().cloned());
        }
        args.extend(config.logging_flags.iter().cloned());
        Self::new(&config.tool_path, args)
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[async_trait]
impl WorkerLauncher for ToolWorkerLauncher {
    async fn launch(&self) -> Result<WorkerProcess, ProcessError> {
        let program = self.program.display().to_string();
        tracing::info!("Starting worker: {} {}", program, self.args.join(" "));

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| ProcessError::launch(e, &program))?;
        let pid = child.id();

        let missing = |stream: &str| ProcessError::InternalError {
            message: format!("worker {stream} was not captured"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel::<ExitStatus>();

        // Owns the child. A dropped kill sender counts as a kill request.
        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    if let Some(pid) = pid {
                        kill_process_tree_off_runtime(pid).await;
                    }
                    if let Err(e) = child.start_kill() {
                        tracing::trace!("start_kill after tree kill: {e}");
                    }
                    child.wait().await
                }
            };
            let status = match status {
                Ok(status) => ExitStatus::from_std(status),
                Err(e) => {
                    tracing::warn!("Failed to wait for worker: {e}");
                    ExitStatus::Error(-1)
                }
            };
            let _ = exit_tx.send(status);
        });

        Ok(WorkerProcess {
            pid,
            stdin: Box::pin(stdin),
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            exited: Box::pin(async move { exit_rx.await.unwrap_or(ExitStatus::Error(-1)) }),
            kill: Box::new(move || {
                let _ = kill_tx.send(());
            }),
        })
    }
}

/// A running worker with its pumps attached.
struct WorkerHandle {
    pid: Option<u32>,
    stdin: Option<Pin<Box<dyn AsyncWrite + Send>>>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    capture: StderrCapture,
    stdout_pump: JoinHandle<()>,
    exit_watcher: JoinHandle<()>,
    stderr_drain: Option<JoinHandle<()>>,
    expected_exit: Arc<AtomicBool>,
    kill: Option<Box<dyn FnOnce() + Send>>,
}

impl WorkerHandle {
    fn start(process: WorkerProcess) -> Self {
        let WorkerProcess {
            pid,
            stdin,
            mut stdout,
            stderr,
            exited,
            kill,
        } = process;

        let (tx, events) = mpsc::unbounded_channel();

        let data_tx = tx.clone();
        let stdout_pump = tokio::spawn(async move {
            let mut buf = vec![0u8; STDOUT_CHUNK_SIZE];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if data_tx.send(WorkerEvent::Data(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = data_tx.send(WorkerEvent::Errored(e));
                        break;
                    }
                }
            }
        });

        let expected_exit = Arc::new(AtomicBool::new(false));
        let expected = Arc::clone(&expected_exit);
        let exit_watcher = tokio::spawn(async move {
            let status = exited.await;
            if expected.load(Ordering::SeqCst) {
                tracing::info!("Worker stopped ({status})");
            } else if status.success() {
                tracing::info!("Worker exited ({status})");
            } else {
                tracing::warn!("Worker {status}");
            }
            let _ = tx.send(WorkerEvent::Closed(status));
        });

        let capture = StderrCapture::new();
        let stderr_drain = drain_stderr(stderr, "worker".to_string(), capture.clone());

        Self {
            pid,
            stdin: Some(stdin),
            events,
            capture,
            stdout_pump,
            exit_watcher,
            stderr_drain: Some(stderr_drain),
            expected_exit,
            kill: Some(kill),
        }
    }

    /// Drain events left over from idle time; false if the worker went away.
    fn is_alive(&mut self) -> bool {
        loop {
            match self.events.try_recv() {
                Ok(WorkerEvent::Data(chunk)) => {
                    tracing::warn!("Discarding {} unexpected bytes from idle worker", chunk.len());
                }
                Ok(WorkerEvent::Closed(_)) | Ok(WorkerEvent::Errored(_)) => return false,
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
    }

    async fn exchange(
        &mut self,
        request: &[u8],
        command: &ToolCommand,
        command_line: &[String],
        stderr_grace: Duration,
    ) -> Result<String, ProcessError> {
        let scope = self.capture.scope();

        let write = match self.stdin.as_mut() {
            Some(stdin) => write_request(stdin, request).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "worker stdin is closed",
            )),
        };
        if let Err(e) = write {
            return Err(ProcessError::ProtocolViolation(Box::new(translate(
                None,
                &scope.bytes(),
                &command.description,
                command_line,
                Some(e.to_string()),
            ))));
        }

        let mut response = ResponseAccumulator::new();
        loop {
            match self.events.recv().await {
                Some(WorkerEvent::Data(chunk)) => {
                    response.push(&chunk);
                    if response.is_terminated() {
                        return Ok(response.into_text());
                    }
                }
                Some(WorkerEvent::Closed(status)) => {
                    self.wait_for_stderr(stderr_grace).await;
                    let failure = Box::new(translate(
                        Some(status),
                        &scope.bytes(),
                        &command.description,
                        command_line,
                        None,
                    ));
                    return Err(if status.success() {
                        ProcessError::ProtocolViolation(failure)
                    } else {
                        ProcessError::NonZeroExit(failure)
                    });
                }
                Some(WorkerEvent::Errored(e)) => {
                    return Err(ProcessError::ProtocolViolation(Box::new(translate(
                        None,
                        &scope.bytes(),
                        &command.description,
                        command_line,
                        Some(e.to_string()),
                    ))));
                }
                None => {
                    return Err(ProcessError::ProtocolViolation(Box::new(translate(
                        None,
                        &scope.bytes(),
                        &command.description,
                        command_line,
                        Some("worker output closed".to_string()),
                    ))));
                }
            }
        }
    }

    async fn wait_for_stderr(&mut self, grace: Duration) {
        if let Some(drain) = self.stderr_drain.take() {
            if tokio::time::timeout(grace, drain).await.is_err() {
                tracing::debug!("stderr still open {grace:?} after worker exit");
            }
        }
    }

    async fn shutdown(&mut self, shutdown_command: &[String], grace: Duration) {
        self.expected_exit.store(true, Ordering::SeqCst);
        if let Some(mut stdin) = self.stdin.take() {
            if let Ok(request) = encode_request(shutdown_command) {
                let polite = async {
                    write_request(&mut stdin, &request).await?;
                    stdin.shutdown().await
                };
                match tokio::time::timeout(grace, polite).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::debug!("Shutdown request not delivered: {e}"),
                    Err(_) => tracing::debug!("Shutdown request timed out"),
                }
            }
        }
        self.stop();
    }

    fn stop(&mut self) {
        self.expected_exit.store(true, Ordering::SeqCst);
        self.stdin = None;
        if let Some(kill) = self.kill.take() {
            tracing::debug!("Killing worker {:?}", self.pid);
            kill();
        }
        self.stdout_pump.abort();
        self.exit_watcher.abort();
        if let Some(drain) = self.stderr_drain.take() {
            drain.abort();
        }
    }
}

async fn write_request(
    stdin: &mut Pin<Box<dyn AsyncWrite + Send>>,
    request: &[u8],
) -> std::io::Result<()> {
    stdin.write_all(request).await?;
    stdin.flush().await
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Protocol knobs for the worker channel.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub logging_flags: Vec<String>,
    pub shutdown_command: Vec<String>,
    pub stderr_grace: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&ToolConfig::default())
    }
}

impl WorkerSettings {
    pub fn from_config(config: &ToolConfig) -> Self {
        Self {
            logging_flags: config.logging_flags.clone(),
            shutdown_command: config.shutdown_command.clone(),
            stderr_grace: config.stderr_grace,
        }
    }
}

/// Owns at most one worker and runs commands against it one at a time.
pub struct WorkerChannel {
    launcher: Arc<dyn WorkerLauncher>,
    settings: WorkerSettings,
    handle: Option<WorkerHandle>,
    state: WorkerState,
}

impl WorkerChannel {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, settings: WorkerSettings) -> Self {
        Self {
            launcher,
            settings,
            handle: None,
            state: WorkerState::Unstarted,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Run one command, launching the worker first if needed.
    pub async fn dispatch(&mut self, command: &ToolCommand) -> Result<String, ProcessError> {
        if self.state == WorkerState::Failed {
            self.teardown().await;
        }
        if let Some(handle) = self.handle.as_mut() {
            if !handle.is_alive() {
                tracing::info!("Worker went away while idle, relaunching");
                self.teardown().await;
            }
        }

        if self.handle.is_none() {
            self.state = WorkerState::Launching;
            match self.launcher.launch().await {
                Ok(process) => self.handle = Some(WorkerHandle::start(process)),
                Err(e) => {
                    self.state = WorkerState::Failed;
                    return Err(e);
                }
            }
            self.state = WorkerState::Ready;
        }

        let tokens = command.tokens(&self.settings.logging_flags);
        let request = encode_request(&tokens)?;
        let handle = self.handle.as_mut().ok_or_else(|| ProcessError::InternalError {
            message: "worker handle missing after launch".to_string(),
        })?;

        self.state = WorkerState::Busy;
        if !command.silent {
            tracing::debug!("{}: {}", command.description, tokens.join(" "));
        }

        match handle
            .exchange(&request, command, &tokens, self.settings.stderr_grace)
            .await
        {
            Ok(text) => {
                self.state = WorkerState::Ready;
                if !command.silent {
                    tracing::debug!("{} succeeded", command.description);
                }
                Ok(text)
            }
            Err(e) => {
                self.state = WorkerState::Failed;
                Err(e)
            }
        }
    }

    /// Stop the worker if one is running. The next dispatch relaunches.
    pub async fn teardown(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle
                .shutdown(&self.settings.shutdown_command, self.settings.stderr_grace)
                .await;
        }
        self.state = WorkerState::Unstarted;
    }
}
