use anyhow::Result;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::{ConfigError, ToolConfig};

/// `<config dir>/toolbridge/config.toml` for the current user.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "toolbridge").map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Defaults, then the TOML file, then environment overrides.
///
/// An explicit `path` must exist; the default location is optional.
pub async fn load_config(path: Option<&Path>) -> Result<ToolConfig> {
    let mut config = match path {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()).into());
            }
            read_config_file(path).await?
        }
        None => match default_config_path() {
            Some(path) if path.exists() => read_config_file(&path).await?,
            _ => ToolConfig::default(),
        },
    };

    config.merge_env_vars();
    config.validate()?;
    tracing::debug!("Using tool at {}", config.tool_path.display());
    Ok(config)
}

async fn read_config_file(path: &Path) -> Result<ToolConfig, ConfigError> {
    let content = fs::read_to_string(path).await?;
    let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!("Loaded configuration from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_explicit_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "worker_args = [\"--ram=2048\"]\n").unwrap();

        let config = read_config_file(&path).await.unwrap();
        assert_eq!(config.worker_args, vec!["--ram=2048".to_string()]);
        assert_eq!(config.worker_command, ToolConfig::default().worker_command);
    }

    #[tokio::test]
    async fn test_missing_explicit_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = load_config(Some(&dir.path().join("absent.toml")))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_file_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "tool_path = [").unwrap();

        let err = read_config_file(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
