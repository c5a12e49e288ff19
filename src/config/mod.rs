use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ErrorCode;

pub mod loader;

pub use loader::{default_config_path, load_config};

/// Overrides `tool_path`.
pub const TOOL_PATH_ENV: &str = "TOOLBRIDGE_TOOL_PATH";
/// When set (and not `0`/`false`), the worker is launched with the debugger
/// agent arguments.
pub const WORKER_DEBUG_ENV: &str = "TOOLBRIDGE_WORKER_DEBUG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn code(&self) -> u16 {
        match self {
            ConfigError::NotFound(_) => ErrorCode::CONFIG_NOT_FOUND,
            ConfigError::Parse { .. } => ErrorCode::CONFIG_PARSE_ERROR,
            ConfigError::Invalid(_) => ErrorCode::CONFIG_VALIDATION_FAILED,
            ConfigError::Io(_) => ErrorCode::CONFIG_GENERIC,
        }
    }
}

/// How to reach and talk to the external tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub tool_path: PathBuf,
    /// Words that put the tool into persistent worker mode.
    pub worker_command: Vec<String>,
    pub worker_args: Vec<String>,
    pub debug_worker_args: Vec<String>,
    pub worker_debug: bool,
    pub logging_flags: Vec<String>,
    pub json_format_args: Vec<String>,
    pub streaming_format_args: Vec<String>,
    pub shutdown_command: Vec<String>,
    pub version_command: Vec<String>,
    pub version_args: Vec<String>,
    pub auth_flag: String,
    pub auth_prompt: String,
    /// How long to keep reading stderr after a process has exited.
    #[serde(with = "humantime_serde")]
    pub stderr_grace: Duration,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            tool_path: PathBuf::from("codeql"),
            worker_command: strings(&["execute", "cli-server"]),
            worker_args: Vec::new(),
            debug_worker_args: strings(&[
                "-J=-agentlib:jdwp=transport=dt_socket,address=localhost:9012,server=n,suspend=y,quiet=y",
            ]),
            worker_debug: false,
            logging_flags: strings(&["-v", "--log-to-stderr"]),
            json_format_args: strings(&["--format", "json"]),
            streaming_format_args: strings(&["--format", "jsonz"]),
            shutdown_command: strings(&["shutdown"]),
            version_command: strings(&["version"]),
            version_args: strings(&["--format=terse"]),
            auth_flag: "--github-auth-stdin".to_string(),
            auth_prompt: "Enter value for --github-auth-stdin".to_string(),
            stderr_grace: Duration::from_millis(500),
        }
    }
}

/// A flag variable counts as enabled unless it is `0` or `false`.
pub fn env_flag_enabled(value: &str) -> bool {
    let value = value.trim();
    value != "0" && !value.eq_ignore_ascii_case("false")
}

impl ToolConfig {
    pub fn merge_env_vars(&mut self) {
        self.merge_env_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn merge_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup(TOOL_PATH_ENV) {
            if !path.is_empty() {
                self.tool_path = PathBuf::from(path);
            }
        }

        if let Some(value) = lookup(WORKER_DEBUG_ENV) {
            self.worker_debug = env_flag_enabled(&value);
        }
    }

    pub fn worker_debug_enabled(&self) -> bool {
        self.worker_debug
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tool_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("tool_path must not be empty".into()));
        }
        if self.worker_command.is_empty() {
            return Err(ConfigError::Invalid(
                "worker_command must name at least one word".into(),
            ));
        }
        if self.auth_prompt.is_empty() {
            return Err(ConfigError::Invalid("auth_prompt must not be empty".into()));
        }
        Ok(())
    }
}
