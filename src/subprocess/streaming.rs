//! Lazily parsed NUL-delimited JSON records from a one-shot process

use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use futures::stream::{self, Stream};
use serde::de::DeserializeOwned;
use tokio::process::{Child, ChildStdout};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ToolConfig;

use super::cancel::{cancelled, classify_failure, CancelHook};
use super::command::ToolCommand;
use super::error::ProcessError;
use super::failure::{translate, ExitStatus};
use super::split::{RecordReader, SeparatorSet};
use super::stderr::{drain_stderr, StderrCapture};

pub type EventStream<T> = Pin<Box<dyn Stream<Item = Result<T, ProcessError>> + Send>>;

#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub cancellation: Option<CancellationToken>,
    pub silent: bool,
}

#[derive(Debug, Clone)]
pub struct StreamingEventReader {
    program: PathBuf,
    format_args: Vec<String>,
    stderr_grace: Duration,
}

impl StreamingEventReader {
    pub fn new(program: impl Into<PathBuf>, format_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            format_args,
            stderr_grace: Duration::from_millis(500),
        }
    }

    pub fn from_config(config: &ToolConfig) -> Self {
        let mut reader = Self::new(&config.tool_path, config.streaming_format_args.clone());
        reader.stderr_grace = config.stderr_grace;
        reader
    }

    /// Start `command` and yield each record as soon as its terminator
    /// arrives. The stream ends cleanly only after the process exits with 0.
    pub async fn run<T>(
        &self,
        command: &ToolCommand,
        options: StreamOptions,
    ) -> Result<EventStream<T>, ProcessError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if options
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return Err(cancelled(options.silent));
        }

        let tokens = command.tokens(&self.format_args);
        let program = self.program.display().to_string();
        if !command.silent {
            tracing::debug!("{}: {} {}", command.description, program, tokens.join(" "));
        }

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&tokens)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| ProcessError::launch(e, &program))?;
        let hook = CancelHook::arm(options.cancellation.as_ref(), child.id());

        let capture = StderrCapture::new();
        let stderr = child.stderr.take().ok_or_else(|| ProcessError::InternalError {
            message: "stderr was not captured".to_string(),
        })?;
        let stderr_drain = drain_stderr(stderr, command.description.clone(), capture.clone());
        let stdout = child.stdout.take().ok_or_else(|| ProcessError::InternalError {
            message: "stdout was not captured".to_string(),
        })?;

        let state = EventSource {
            records: RecordReader::new(stdout, SeparatorSet::nul()),
            child,
            _hook: hook,
            capture,
            stderr_drain: Some(stderr_drain),
            description: command.description.clone(),
            tokens,
            options,
            stderr_grace: self.stderr_grace,
            finished: false,
        };

        Ok(Box::pin(stream::unfold(state, |mut state| async move {
            if state.finished {
                return None;
            }
            let item = state.next_event::<T>().await?;
            Some((item, state))
        })))
    }
}

struct EventSource {
    records: RecordReader<ChildStdout>,
    child: Child,
    _hook: CancelHook,
    capture: StderrCapture,
    stderr_drain: Option<JoinHandle<()>>,
    description: String,
    tokens: Vec<String>,
    options: StreamOptions,
    stderr_grace: Duration,
    finished: bool,
}

impl EventSource {
    async fn next_event<T: DeserializeOwned>(&mut self) -> Option<Result<T, ProcessError>> {
        loop {
            let record = match self.records.next_record().await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    self.finished = true;
                    return self.finish().await.err().map(Err);
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(self.classify(ProcessError::Io(e))));
                }
            };

            // A trailing separator may be followed by nothing but whitespace.
            if record.text.trim().is_empty() {
                continue;
            }

            return match serde_json::from_str::<T>(&record.text) {
                Ok(event) => Some(Ok(event)),
                Err(e) => {
                    self.finished = true;
                    Some(Err(self.classify(ProcessError::OutputParse {
                        description: self.description.clone(),
                        message: e.to_string(),
                    })))
                }
            };
        }
    }

    async fn finish(&mut self) -> Result<(), ProcessError> {
        let status = match self.child.wait().await {
            Ok(status) => ExitStatus::from_std(status),
            Err(e) => return Err(self.classify(ProcessError::Io(e))),
        };
        if let Some(drain) = self.stderr_drain.take() {
            let _ = tokio::time::timeout(self.stderr_grace, drain).await;
        }

        if status.success() {
            return Ok(());
        }
        let failure = translate(
            Some(status),
            &self.capture.take(),
            &self.description,
            &self.tokens,
            None,
        );
        Err(self.classify(ProcessError::NonZeroExit(Box::new(failure))))
    }

    fn classify(&self, error: ProcessError) -> ProcessError {
        classify_failure(
            error,
            self.options.cancellation.as_ref(),
            self.options.silent,
        )
    }
}
