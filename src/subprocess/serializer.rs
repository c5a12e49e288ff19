//! Single-flight command dispatch to the persistent worker
//!
//! One task owns the [`WorkerChannel`] and a [`CommandQueue`]. Callers talk to
//! it through a [`CommandSerializer`]; submissions are ordered by the time
//! `submit` is called, and at most one command is in flight at any moment.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::cancel::{cancelled, classify_failure};
use super::command::ToolCommand;
use super::error::ProcessError;
use super::worker::WorkerChannel;

/// FIFO of jobs with a single busy flag.
#[derive(Debug)]
pub struct CommandQueue<T> {
    pending: VecDeque<T>,
    busy: bool,
}

impl<T> Default for CommandQueue<T> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            busy: false,
        }
    }
}

impl<T> CommandQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, job: T) {
        self.pending.push_back(job);
    }

    /// Place a job ahead of everything queued, but not ahead of the job in
    /// flight.
    pub fn prioritize(&mut self, job: T) {
        self.pending.push_front(job);
    }

    /// Hand out the next job, unless one is already in flight.
    pub fn begin(&mut self) -> Option<T> {
        if self.busy {
            return None;
        }
        let job = self.pending.pop_front()?;
        self.busy = true;
        Some(job)
    }

    pub fn complete(&mut self) {
        self.busy = false;
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.pending.drain(..)
    }
}

type Reply = oneshot::Sender<Result<String, ProcessError>>;

/// Runs after the worker is torn down by a restart.
pub type RestartHook = Box<dyn Fn() + Send + Sync>;

enum Job {
    Command {
        command: ToolCommand,
        cancellation: Option<CancellationToken>,
        reply: Reply,
    },
    Restart,
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Resolves to the worker's response for one submitted command.
pub struct PendingCommand {
    reply: oneshot::Receiver<Result<String, ProcessError>>,
}

impl Future for PendingCommand {
    type Output = Result<String, ProcessError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.reply)
            .poll(cx)
            .map(|reply| reply.unwrap_or_else(|_| Err(ProcessError::ServerClosed)))
    }
}

/// Handle to the task that owns the worker.
///
/// Dropping every handle lets the task finish the in-flight command and then
/// tear the worker down.
pub struct CommandSerializer {
    jobs: mpsc::UnboundedSender<Job>,
}

impl CommandSerializer {
    pub fn new(channel: WorkerChannel) -> Self {
        Self::spawn(channel, None)
    }

    pub fn with_restart_hook(channel: WorkerChannel, hook: RestartHook) -> Self {
        Self::spawn(channel, Some(hook))
    }

    fn spawn(channel: WorkerChannel, hook: Option<RestartHook>) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_serializer(channel, rx, hook));
        Self { jobs }
    }

    pub fn submit(&self, command: ToolCommand) -> PendingCommand {
        self.submit_job(command, None)
    }

    /// Like [`submit`](Self::submit); a cancelled token stops the command
    /// from being dispatched and turns a later failure into `Cancelled`.
    pub fn submit_cancellable(
        &self,
        command: ToolCommand,
        cancellation: CancellationToken,
    ) -> PendingCommand {
        self.submit_job(command, Some(cancellation))
    }

    fn submit_job(
        &self,
        command: ToolCommand,
        cancellation: Option<CancellationToken>,
    ) -> PendingCommand {
        let (reply, rx) = oneshot::channel();
        // On failure the job, and with it the reply sender, is dropped and
        // the pending command resolves to ServerClosed.
        let _ = self.jobs.send(Job::Command {
            command,
            cancellation,
            reply,
        });
        PendingCommand { reply: rx }
    }

    /// Restart the worker before any queued command runs.
    pub fn restart(&self) -> Result<(), ProcessError> {
        self.jobs
            .send(Job::Restart)
            .map_err(|_| ProcessError::ServerClosed)
    }

    /// Stop after the in-flight command. Queued commands fail with
    /// `ServerClosed`.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.jobs.send(Job::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.jobs.is_closed()
    }
}

fn admit(queue: &mut CommandQueue<Job>, job: Job) {
    match job {
        Job::Command { .. } => queue.enqueue(job),
        Job::Restart | Job::Shutdown { .. } => queue.prioritize(job),
    }
}

async fn run_serializer(
    mut channel: WorkerChannel,
    mut rx: mpsc::UnboundedReceiver<Job>,
    restart_hook: Option<RestartHook>,
) {
    let mut queue = CommandQueue::new();

    loop {
        while let Ok(job) = rx.try_recv() {
            admit(&mut queue, job);
        }

        let Some(job) = queue.begin() else {
            match rx.recv().await {
                Some(job) => {
                    admit(&mut queue, job);
                    continue;
                }
                None => break,
            }
        };

        match job {
            Job::Command {
                command,
                cancellation,
                reply,
            } => {
                let result = execute(&mut channel, &command, cancellation.as_ref()).await;
                let _ = reply.send(result);
            }
            Job::Restart => {
                tracing::info!("Restarting worker");
                channel.teardown().await;
                if let Some(hook) = &restart_hook {
                    hook();
                }
            }
            Job::Shutdown { done } => {
                channel.teardown().await;
                rx.close();
                for job in queue.drain() {
                    fail_unstarted(job);
                }
                while let Ok(job) = rx.try_recv() {
                    fail_unstarted(job);
                }
                let _ = done.send(());
                return;
            }
        }
        queue.complete();
    }

    channel.teardown().await;
}

async fn execute(
    channel: &mut WorkerChannel,
    command: &ToolCommand,
    cancellation: Option<&CancellationToken>,
) -> Result<String, ProcessError> {
    if cancellation.is_some_and(CancellationToken::is_cancelled) {
        return Err(cancelled(false));
    }

    match channel.dispatch(command).await {
        Ok(text) => Ok(text),
        Err(e) => {
            // Whatever went wrong, the next command gets a fresh worker.
            channel.teardown().await;
            Err(classify_failure(e, cancellation, false))
        }
    }
}

fn fail_unstarted(job: Job) {
    match job {
        Job::Command { reply, .. } => {
            let _ = reply.send(Err(ProcessError::ServerClosed));
        }
        Job::Restart => {}
        Job::Shutdown { done } => {
            let _ = done.send(());
        }
    }
}
