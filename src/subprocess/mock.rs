//! In-process fake worker for exercising the worker protocol without
//! spawning the real tool.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, oneshot, Notify};

use super::error::ProcessError;
use super::failure::ExitStatus;
use super::worker::{WorkerLauncher, WorkerProcess};

const PIPE_CAPACITY: usize = 64 * 1024;

/// How the fake worker answers one request.
#[derive(Clone)]
pub enum FakeReply {
    /// Write the text followed by the NUL terminator in one write.
    Respond(String),
    /// Write each chunk separately, verbatim. The caller supplies the NUL.
    Chunks(Vec<Vec<u8>>),
    /// Write to stderr, then exit with the code without answering.
    Crash { stderr: String, code: i32 },
    /// Wait for the gate before responding.
    Gated { gate: Arc<Notify>, response: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Launched(usize),
    Request(usize, Vec<String>),
    Shutdown(usize),
    Killed(usize),
}

type Handler = dyn Fn(&[String]) -> FakeReply + Send + Sync;

struct MockState {
    handler: Box<Handler>,
    shutdown_command: Vec<String>,
    events: Mutex<Vec<MockEvent>>,
    launches: AtomicUsize,
    outstanding: AtomicUsize,
    max_outstanding: AtomicUsize,
    fail_next_launch: AtomicBool,
}

impl MockState {
    fn record(&self, event: MockEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }

    fn begin_request(&self) {
        let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_outstanding.fetch_max(now, Ordering::SeqCst);
    }

    fn end_request(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct MockWorkerLauncher {
    state: Arc<MockState>,
}

impl MockWorkerLauncher {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&[String]) -> FakeReply + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(MockState {
                handler: Box::new(handler),
                shutdown_command: vec!["shutdown".to_string()],
                events: Mutex::new(Vec::new()),
                launches: AtomicUsize::new(0),
                outstanding: AtomicUsize::new(0),
                max_outstanding: AtomicUsize::new(0),
                fail_next_launch: AtomicBool::new(false),
            }),
        }
    }

    /// Answers every request with its tokens joined by spaces.
    pub fn echo() -> Self {
        Self::new(|tokens| FakeReply::Respond(tokens.join(" ")))
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.state
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Every recorded request, without the shutdown requests.
    pub fn requests(&self) -> Vec<(usize, Vec<String>)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                MockEvent::Request(n, tokens) => Some((n, tokens)),
                _ => None,
            })
            .collect()
    }

    pub fn launch_count(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }

    pub fn max_outstanding(&self) -> usize {
        self.state.max_outstanding.load(Ordering::SeqCst)
    }

    pub fn fail_next_launch(&self) {
        self.state.fail_next_launch.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkerLauncher for MockWorkerLauncher {
    async fn launch(&self) -> Result<WorkerProcess, ProcessError> {
        if self.state.fail_next_launch.swap(false, Ordering::SeqCst) {
            return Err(ProcessError::LaunchFailed {
                program: "mock-worker".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "launch refused"),
            });
        }

        let instance = self.state.launches.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.record(MockEvent::Launched(instance));

        let (client_stdin, worker_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (worker_stdout, client_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (worker_stderr, client_stderr) = tokio::io::duplex(PIPE_CAPACITY);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel::<ExitStatus>();

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let status = serve(
                state,
                instance,
                worker_stdin,
                worker_stdout,
                worker_stderr,
                kill_rx,
            )
            .await;
            let _ = exit_tx.send(status);
        });

        let state = Arc::clone(&self.state);
        Ok(WorkerProcess {
            pid: None,
            stdin: Box::pin(client_stdin),
            stdout: Box::pin(client_stdout),
            stderr: Box::pin(client_stderr),
            exited: Box::pin(async move { exit_rx.await.unwrap_or(ExitStatus::Signal(9)) }),
            kill: Box::new(move || {
                state.record(MockEvent::Killed(instance));
                let _ = kill_tx.send(());
            }),
        })
    }
}

enum Inbound {
    Request(Vec<String>),
    Malformed(String),
}

/// Reads framed requests as soon as they arrive, independently of the
/// replies, so a request sent before the previous answer counts as
/// outstanding.
async fn read_requests(
    state: Arc<MockState>,
    stdin: DuplexStream,
    requests: mpsc::UnboundedSender<Inbound>,
) {
    let mut reader = BufReader::new(stdin);
    loop {
        let mut request = Vec::new();
        match reader.read_until(0, &mut request).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        if request.last() == Some(&0) {
            request.pop();
        }

        let inbound = match serde_json::from_slice::<Vec<String>>(&request) {
            Ok(tokens) => {
                if tokens != state.shutdown_command {
                    state.begin_request();
                }
                Inbound::Request(tokens)
            }
            Err(e) => Inbound::Malformed(e.to_string()),
        };
        if requests.send(inbound).is_err() {
            return;
        }
    }
}

async fn serve(
    state: Arc<MockState>,
    instance: usize,
    stdin: DuplexStream,
    stdout: DuplexStream,
    stderr: DuplexStream,
    mut kill_rx: oneshot::Receiver<()>,
) -> ExitStatus {
    let (tx, mut requests) = mpsc::unbounded_channel();
    let reader = tokio::spawn(read_requests(Arc::clone(&state), stdin, tx));
    let status = answer(&state, instance, &mut requests, stdout, stderr, &mut kill_rx).await;
    reader.abort();
    status
}

async fn answer(
    state: &MockState,
    instance: usize,
    requests: &mut mpsc::UnboundedReceiver<Inbound>,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
    kill_rx: &mut oneshot::Receiver<()>,
) -> ExitStatus {
    loop {
        let inbound = tokio::select! {
            inbound = requests.recv() => inbound,
            _ = &mut *kill_rx => return ExitStatus::Signal(9),
        };
        let tokens = match inbound {
            Some(Inbound::Request(tokens)) => tokens,
            Some(Inbound::Malformed(message)) => {
                let _ = stderr
                    .write_all(format!("bad request: {message}\n").as_bytes())
                    .await;
                return ExitStatus::Error(2);
            }
            None => return ExitStatus::Success,
        };

        if tokens == state.shutdown_command {
            state.record(MockEvent::Shutdown(instance));
            return ExitStatus::Success;
        }

        state.record(MockEvent::Request(instance, tokens.clone()));

        let written = match (state.handler)(tokens.as_slice()) {
            FakeReply::Respond(text) => {
                state.end_request();
                respond(&mut stdout, &text).await
            }
            FakeReply::Chunks(chunks) => {
                state.end_request();
                let mut result = Ok(());
                for chunk in chunks {
                    result = stdout.write_all(&chunk).await;
                    if result.is_err() {
                        break;
                    }
                    let _ = stdout.flush().await;
                    tokio::task::yield_now().await;
                }
                result
            }
            FakeReply::Crash { stderr: text, code } => {
                let _ = stderr.write_all(text.as_bytes()).await;
                drop(stderr);
                drop(stdout);
                state.end_request();
                return if code == 0 {
                    ExitStatus::Success
                } else {
                    ExitStatus::Error(code)
                };
            }
            FakeReply::Gated { gate, response } => {
                tokio::select! {
                    _ = gate.notified() => {}
                    _ = &mut *kill_rx => {
                        state.end_request();
                        return ExitStatus::Signal(9);
                    }
                }
                state.end_request();
                respond(&mut stdout, &response).await
            }
        };

        if written.is_err() {
            return ExitStatus::Error(1);
        }
    }
}

async fn respond(stdout: &mut DuplexStream, text: &str) -> std::io::Result<()> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(0);
    stdout.write_all(&bytes).await?;
    stdout.flush().await
}
