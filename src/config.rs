//! Configuration loader and validator for the notification client.
use crate::reconciler::DEFAULT_FETCH_LIMIT;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub notifications: Notifications,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Defaults to `sqlite://<data_dir>/notify.db`.
    #[serde(default)]
    pub database_url: Option<String>,
    /// How often the change feed checks for new broadcasts.
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notifications {
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: u32,
    #[serde(default = "default_chime")]
    pub chime: bool,
}

fn default_fetch_limit() -> u32 {
    DEFAULT_FETCH_LIMIT
}

fn default_chime() -> bool {
    true
}

impl Default for Notifications {
    fn default() -> Self {
        Self {
            fetch_limit: default_fetch_limit(),
            chime: default_chime(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins over the config file.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .or_else(|| self.app.database_url.clone())
            .unwrap_or_else(|| {
                format!(
                    "sqlite://{}/notify.db",
                    self.app.data_dir.trim_end_matches('/')
                )
            })
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg
        .app
        .database_url
        .as_deref()
        .is_some_and(|url| url.trim().is_empty())
    {
        return Err(ConfigError::Invalid(
            "app.database_url must be non-empty when set",
        ));
    }
    if cfg.notifications.fetch_limit == 0 {
        return Err(ConfigError::Invalid("notifications.fetch_limit must be > 0"));
    }
    Ok(())
}

/// Returns the example YAML shipped with the binary.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500

notifications:
  fetch_limit: 50
  chime: true
"#
}
