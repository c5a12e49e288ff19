//! One-shot invocations of the tool, with optional cancellation and an
//! optional line-triggered responder on stdin.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio_util::sync::CancellationToken;

use crate::config::ToolConfig;

use super::cancel::{cancelled, classify_failure, CancelHook};
use super::command::ToolCommand;
use super::error::ProcessError;
use super::failure::{translate, ExitStatus};
use super::split::{Record, SeparatorSet, StreamSplitter};
use super::stderr::{drain_stderr, StderrCapture};

const STDOUT_CHUNK_SIZE: usize = 8192;

/// Answers lines the process prints. `None` means "not a prompt".
#[async_trait]
pub trait LineResponder: Send + Sync {
    async fn respond(&self, line: &str) -> Option<String>;
}

#[async_trait]
impl<F> LineResponder for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    async fn respond(&self, line: &str) -> Option<String> {
        self(line)
    }
}

#[derive(Clone, Default)]
pub struct RunOptions {
    pub on_line: Option<Arc<dyn LineResponder>>,
    pub cancellation: Option<CancellationToken>,
    pub silent_cancellation: bool,
}

impl RunOptions {
    pub fn with_responder(mut self, responder: Arc<dyn LineResponder>) -> Self {
        self.on_line = Some(responder);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn silent_cancellation(mut self, silent: bool) -> Self {
        self.silent_cancellation = silent;
        self
    }
}

/// Completes once `token` is cancelled; never without one.
pub(crate) async fn wait_cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

#[derive(Debug, Clone)]
pub struct EphemeralRunner {
    program: PathBuf,
    logging_flags: Vec<String>,
    stderr_grace: Duration,
}

impl EphemeralRunner {
    pub fn new(program: impl Into<PathBuf>, logging_flags: Vec<String>) -> Self {
        Self {
            program: program.into(),
            logging_flags,
            stderr_grace: Duration::from_millis(500),
        }
    }

    pub fn from_config(config: &ToolConfig) -> Self {
        Self::new(&config.tool_path, config.logging_flags.clone())
            .with_stderr_grace(config.stderr_grace)
    }

    pub fn with_stderr_grace(mut self, grace: Duration) -> Self {
        self.stderr_grace = grace;
        self
    }

    /// Run `command` in a fresh process and return its stdout.
    pub async fn run(
        &self,
        command: &ToolCommand,
        options: RunOptions,
    ) -> Result<String, ProcessError> {
        let token = options.cancellation.as_ref();
        if token.is_some_and(CancellationToken::is_cancelled) {
            return Err(cancelled(options.silent_cancellation));
        }

        self.run_process(command, &options)
            .await
            .map_err(|e| classify_failure(e, token, options.silent_cancellation))
    }

    async fn run_process(
        &self,
        command: &ToolCommand,
        options: &RunOptions,
    ) -> Result<String, ProcessError> {
        let tokens = command.tokens(&self.logging_flags);
        let program = self.program.display().to_string();
        if !command.silent {
            tracing::debug!("{}: {} {}", command.description, program, tokens.join(" "));
        }

        let stdin_mode = if options.on_line.is_some() {
            std::process::Stdio::piped()
        } else {
            std::process::Stdio::null()
        };
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&tokens)
            .stdin(stdin_mode)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| ProcessError::launch(e, &program))?;
        let _hook = CancelHook::arm(options.cancellation.as_ref(), child.id());

        let capture = StderrCapture::new();
        let stderr = child.stderr.take().ok_or_else(|| ProcessError::InternalError {
            message: "stderr was not captured".to_string(),
        })?;
        let stderr_drain = drain_stderr(stderr, command.description.clone(), capture.clone());
        let mut stdout = child.stdout.take().ok_or_else(|| ProcessError::InternalError {
            message: "stdout was not captured".to_string(),
        })?;
        let mut stdin = child.stdin.take();

        let mut raw = Vec::new();
        let mut kept = String::new();
        let mut lines = options
            .on_line
            .as_ref()
            .map(|_| StreamSplitter::new(SeparatorSet::line_endings()));
        let mut buf = vec![0u8; STDOUT_CHUNK_SIZE];

        loop {
            let read = tokio::select! {
                _ = wait_cancelled(options.cancellation.as_ref()), if stdin.is_some() => {
                    stdin = None;
                    continue;
                }
                read = stdout.read(&mut buf) => read?,
            };
            if read == 0 {
                break;
            }

            match (options.on_line.as_ref(), lines.as_mut()) {
                (Some(responder), Some(splitter)) => {
                    splitter.push(&buf[..read]);
                    while let Some(record) = splitter.next_record() {
                        offer_line(responder.as_ref(), record, &mut stdin, &mut kept).await?;
                    }
                    offer_pending(responder.as_ref(), splitter, &mut stdin).await?;
                }
                _ => raw.extend_from_slice(&buf[..read]),
            }
        }

        if let (Some(responder), Some(splitter)) = (options.on_line.as_ref(), lines.as_mut()) {
            splitter.end();
            while let Some(record) = splitter.next_record() {
                offer_line(responder.as_ref(), record, &mut stdin, &mut kept).await?;
            }
        }
        drop(stdin);

        let status = ExitStatus::from_std(child.wait().await?);
        if tokio::time::timeout(self.stderr_grace, stderr_drain)
            .await
            .is_err()
        {
            tracing::debug!("{}: stderr still open after exit", command.description);
        }

        if !status.success() {
            return Err(ProcessError::NonZeroExit(Box::new(translate(
                Some(status),
                &capture.take(),
                &command.description,
                &tokens,
                None,
            ))));
        }

        if !command.silent {
            tracing::debug!("{} succeeded", command.description);
        }
        Ok(match lines {
            Some(_) => kept,
            None => String::from_utf8_lossy(&raw).into_owned(),
        })
    }
}

/// Give one line to the responder. Answered lines are dropped from the
/// output; everything else is kept with its terminator.
async fn offer_line(
    responder: &dyn LineResponder,
    record: Record,
    stdin: &mut Option<ChildStdin>,
    kept: &mut String,
) -> Result<(), ProcessError> {
    match responder.respond(&record.text).await {
        Some(answer) => write_answer(stdin, &answer).await?,
        None => kept.push_str(&record.to_raw()),
    }
    Ok(())
}

/// Prompts are often printed without a line ending while the process blocks
/// on stdin, so the unterminated tail is offered too. An answered tail is
/// dropped; an unanswered one stays buffered and is offered again as it grows.
async fn offer_pending(
    responder: &dyn LineResponder,
    splitter: &mut StreamSplitter,
    stdin: &mut Option<ChildStdin>,
) -> Result<(), ProcessError> {
    if splitter.pending_text().is_empty() {
        return Ok(());
    }
    if let Some(answer) = responder.respond(splitter.pending_text()).await {
        splitter.discard_pending();
        write_answer(stdin, &answer).await?;
    }
    Ok(())
}

async fn write_answer(stdin: &mut Option<ChildStdin>, answer: &str) -> Result<(), ProcessError> {
    match stdin.as_mut() {
        Some(stdin) => {
            stdin.write_all(format!("{answer}\n").as_bytes()).await?;
            stdin.flush().await?;
        }
        None => tracing::debug!("Dropping answer to prompt, stdin already closed"),
    }
    Ok(())
}
