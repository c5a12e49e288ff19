//! High-level entry point tying the execution paths together
//!
//! [`ToolClient`] owns the persistent worker (through a [`CommandSerializer`]),
//! the one-shot runners and a cache of the tool's version.

use std::sync::Arc;

use async_trait::async_trait;
use semver::Version;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::ToolConfig;
use crate::subprocess::{
    CommandSerializer, EphemeralRunner, EventStream, LineResponder, ProcessError, RunOptions,
    StreamOptions, StreamingEventReader, ToolCommand, ToolCommandBuilder, ToolWorkerLauncher,
    WorkerChannel, WorkerLauncher, WorkerSettings,
};

/// Source of access tokens for commands that may need to authenticate.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// A token the user already has, without prompting.
    async fn existing_token(&self) -> Option<String>;

    /// A token, prompting the user if necessary.
    async fn token(&self) -> anyhow::Result<String>;
}

/// Answers the tool's auth prompt with a token from the provider.
struct AuthResponder {
    prompt: String,
    existing: Option<String>,
    credentials: Arc<dyn CredentialProvider>,
}

#[async_trait]
impl LineResponder for AuthResponder {
    async fn respond(&self, line: &str) -> Option<String> {
        if !line.starts_with(&self.prompt) {
            return None;
        }
        match self.credentials.token().await {
            Ok(token) => Some(token),
            Err(e) => {
                // The tool is blocked on stdin, so it must get some answer.
                // A stale or empty token surfaces later as an auth failure.
                tracing::debug!("Fetching a fresh token failed, using existing one: {e}");
                Some(self.existing.clone().unwrap_or_default())
            }
        }
    }
}

pub struct ToolClient {
    config: ToolConfig,
    serializer: CommandSerializer,
    ephemeral: EphemeralRunner,
    streaming: StreamingEventReader,
    version: Arc<watch::Sender<Option<Version>>>,
}

impl ToolClient {
    pub fn new(config: ToolConfig) -> Self {
        let launcher = Arc::new(ToolWorkerLauncher::from_config(&config));
        Self::with_launcher(config, launcher)
    }

    /// Build a client whose persistent worker comes from `launcher`.
    pub fn with_launcher(config: ToolConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let (version, _) = watch::channel(None);
        let version = Arc::new(version);

        let channel = WorkerChannel::new(launcher, WorkerSettings::from_config(&config));
        let cache = Arc::clone(&version);
        let serializer = CommandSerializer::with_restart_hook(
            channel,
            Box::new(move || {
                cache.send_replace(None);
            }),
        );

        Self {
            ephemeral: EphemeralRunner::from_config(&config),
            streaming: StreamingEventReader::from_config(&config),
            config,
            serializer,
            version,
        }
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    /// Run a command on the persistent worker.
    pub async fn run(&self, command: ToolCommand) -> Result<String, ProcessError> {
        self.serializer.submit(command).await
    }

    pub async fn run_cancellable(
        &self,
        command: ToolCommand,
        cancellation: CancellationToken,
    ) -> Result<String, ProcessError> {
        self.serializer
            .submit_cancellable(command, cancellation)
            .await
    }

    /// Run a command on the persistent worker and parse its JSON output.
    pub async fn run_json<T: DeserializeOwned>(
        &self,
        command: ToolCommand,
    ) -> Result<T, ProcessError> {
        let command = command.with_leading_args(&self.config.json_format_args);
        let output = self.serializer.submit(command.clone()).await?;
        parse_json(&command, &output)
    }

    /// Run a command in its own process.
    pub async fn run_ephemeral(
        &self,
        command: &ToolCommand,
        options: RunOptions,
    ) -> Result<String, ProcessError> {
        self.ephemeral.run(command, options).await
    }

    /// Run a JSON command in its own process, answering the tool's token
    /// prompt on stdin.
    ///
    /// The auth flag is only passed when the user already has a token, so
    /// the tool never prompts anonymous users.
    pub async fn run_json_with_authentication<T: DeserializeOwned>(
        &self,
        command: ToolCommand,
        credentials: Arc<dyn CredentialProvider>,
        options: RunOptions,
    ) -> Result<T, ProcessError> {
        let existing = credentials.existing_token().await;

        let mut leading = self.config.json_format_args.clone();
        if existing.is_some() {
            leading.push(self.config.auth_flag.clone());
        }
        let command = command.with_leading_args(&leading);

        let responder = AuthResponder {
            prompt: self.config.auth_prompt.clone(),
            existing,
            credentials,
        };
        let output = self
            .ephemeral
            .run(&command, options.with_responder(Arc::new(responder)))
            .await?;
        parse_json(&command, &output)
    }

    /// Run a command in its own process and yield its NUL-delimited JSON
    /// records as they arrive.
    pub async fn stream<T>(
        &self,
        command: &ToolCommand,
        options: StreamOptions,
    ) -> Result<EventStream<T>, ProcessError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.streaming.run(command, options).await
    }

    /// The tool's version, asked once per worker lifetime.
    pub async fn version(&self) -> Result<Version, ProcessError> {
        let cached = self.version.borrow().clone();
        if let Some(version) = cached {
            return Ok(version);
        }

        let command = ToolCommandBuilder::new(&self.config.version_command)
            .args(&self.config.version_args)
            .description("Checking tool version")
            .silent(true)
            .build();
        let output = self.serializer.submit(command.clone()).await?;
        let version = parse_version(&output).map_err(|message| ProcessError::OutputParse {
            description: command.description.clone(),
            message,
        })?;

        tracing::info!("Tool version {version}");
        self.version.send_replace(Some(version.clone()));
        Ok(version)
    }

    /// Observe the cached version. `None` means it has not been asked for
    /// since the last restart.
    pub fn subscribe_version(&self) -> watch::Receiver<Option<Version>> {
        self.version.subscribe()
    }

    pub async fn is_version_at_least(&self, minimum: &Version) -> Result<bool, ProcessError> {
        Ok(self.version().await? >= *minimum)
    }

    /// Restart the worker before any queued command runs.
    pub fn restart(&self) -> Result<(), ProcessError> {
        self.version.send_replace(None);
        self.serializer.restart()
    }

    pub async fn shutdown(&self) {
        self.serializer.shutdown().await;
    }
}

fn parse_json<T: DeserializeOwned>(command: &ToolCommand, output: &str) -> Result<T, ProcessError> {
    serde_json::from_str(output).map_err(|e| ProcessError::OutputParse {
        description: command.description.clone(),
        message: e.to_string(),
    })
}

fn parse_version(output: &str) -> Result<Version, String> {
    let text = output.trim();
    let text = text.strip_prefix('v').unwrap_or(text);
    Version::parse(text).map_err(|e| format!("invalid version {text:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::{FakeReply, MockWorkerLauncher};
    use serde::Deserialize;

    fn client(mock: &MockWorkerLauncher) -> ToolClient {
        ToolClient::with_launcher(ToolConfig::default(), Arc::new(mock.clone()))
    }

    fn versioned_mock() -> MockWorkerLauncher {
        MockWorkerLauncher::new(|tokens| match tokens[0].as_str() {
            "version" => FakeReply::Respond("2.15.1\n".to_string()),
            "resolve" => FakeReply::Respond(r#"{"byKind":{"query":3}}"#.to_string()),
            _ => FakeReply::Respond("not json".to_string()),
        })
    }

    fn version_requests(mock: &MockWorkerLauncher) -> usize {
        mock.requests()
            .iter()
            .filter(|(_, tokens)| tokens[0] == "version")
            .count()
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("2.15.1\n").unwrap(), Version::new(2, 15, 1));
        assert_eq!(parse_version("v2.16.0").unwrap(), Version::new(2, 16, 0));
        assert!(parse_version("banana").is_err());
    }

    #[tokio::test]
    async fn test_version_is_cached_until_restart() {
        let mock = versioned_mock();
        let client = client(&mock);
        let updates = client.subscribe_version();

        assert_eq!(client.version().await.unwrap(), Version::new(2, 15, 1));
        assert_eq!(client.version().await.unwrap(), Version::new(2, 15, 1));
        assert_eq!(version_requests(&mock), 1);
        assert_eq!(*updates.borrow(), Some(Version::new(2, 15, 1)));

        client.restart().unwrap();
        assert_eq!(*updates.borrow(), None);

        client.version().await.unwrap();
        assert_eq!(version_requests(&mock), 2);
        assert_eq!(mock.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_version_request_uses_terse_format() {
        let mock = versioned_mock();
        let client = client(&mock);
        client.version().await.unwrap();

        let (_, tokens) = mock.requests().remove(0);
        assert_eq!(tokens, ["version", "-v", "--log-to-stderr", "--format=terse"]);
    }

    #[tokio::test]
    async fn test_is_version_at_least() {
        let client = client(&versioned_mock());
        assert!(client
            .is_version_at_least(&Version::new(2, 15, 0))
            .await
            .unwrap());
        assert!(!client
            .is_version_at_least(&Version::new(2, 16, 0))
            .await
            .unwrap());
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Resolved {
        by_kind: std::collections::HashMap<String, u32>,
    }

    #[tokio::test]
    async fn test_run_json_adds_format_args() {
        let mock = versioned_mock();
        let client = client(&mock);

        let command = ToolCommandBuilder::new(["resolve", "metadata"]).arg("q.ql").build();
        let resolved: Resolved = client.run_json(command).await.unwrap();
        assert_eq!(resolved.by_kind["query"], 3);

        let (_, tokens) = mock.requests().remove(0);
        assert_eq!(
            tokens,
            [
                "resolve",
                "metadata",
                "-v",
                "--log-to-stderr",
                "--format",
                "json",
                "q.ql"
            ]
        );
    }

    #[tokio::test]
    async fn test_run_json_reports_parse_failure() {
        let client = client(&versioned_mock());
        let command = ToolCommandBuilder::new(["other"])
            .description("Reading other")
            .build();
        let err = client.run_json::<Resolved>(command).await.unwrap_err();
        match err {
            ProcessError::OutputParse { description, .. } => {
                assert_eq!(description, "Reading other")
            }
            other => panic!("expected OutputParse, got {other:?}"),
        }
    }

    struct FailingCredentials;

    #[async_trait]
    impl CredentialProvider for FailingCredentials {
        async fn existing_token(&self) -> Option<String> {
            Some("old-token".to_string())
        }

        async fn token(&self) -> anyhow::Result<String> {
            anyhow::bail!("sign-in cancelled")
        }
    }

    #[tokio::test]
    async fn test_auth_responder_falls_back_to_existing_token() {
        let responder = AuthResponder {
            prompt: ToolConfig::default().auth_prompt,
            existing: Some("old-token".to_string()),
            credentials: Arc::new(FailingCredentials),
        };
        assert_eq!(
            responder
                .respond("Enter value for --github-auth-stdin: ")
                .await,
            Some("old-token".to_string())
        );
        assert_eq!(responder.respond("Downloading pack").await, None);
    }
}
