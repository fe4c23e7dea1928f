use super::paths::{default_state_root_path, state_root_override};
use super::ConfigError;
use crate::dispatch::queue::{
    QueueConfig, DEFAULT_ARCHIVE_RETENTION_SECS, DEFAULT_DISPATCH_INTERVAL_MS,
    DEFAULT_MAX_CONCURRENCY, DEFAULT_SHUTDOWN_TIMEOUT_MS,
};
use crate::scheduling::DEFAULT_POLL_INTERVAL_SECS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAX_DISPATCH_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    Sqlite,
}

impl StoreKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            _ => Err("store must be one of: memory, sqlite".to_string()),
        }
    }
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Falls back to `TASKING_STATE_ROOT`, then `$HOME/.tasking`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_root: Option<PathBuf>,
    pub store: StoreKind,
    pub max_concurrency: u32,
    pub dispatch_interval_ms: u64,
    pub archive_retention_secs: u64,
    pub schedule_poll_interval_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_reply_timeout_secs: Option<u64>,
    pub shutdown_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_root: None,
            store: StoreKind::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            dispatch_interval_ms: DEFAULT_DISPATCH_INTERVAL_MS,
            archive_retention_secs: DEFAULT_ARCHIVE_RETENTION_SECS,
            schedule_poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            agent_reply_timeout_secs: None,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "`max_concurrency` must be >= 1".to_string(),
            ));
        }
        if self.dispatch_interval_ms == 0 || self.dispatch_interval_ms > MAX_DISPATCH_INTERVAL_MS {
            return Err(ConfigError::Invalid(format!(
                "`dispatch_interval_ms` must be between 1 and {MAX_DISPATCH_INTERVAL_MS}"
            )));
        }
        if self.schedule_poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "`schedule_poll_interval_secs` must be >= 1".to_string(),
            ));
        }
        if self.agent_reply_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "`agent_reply_timeout_secs` must be >= 1 when set".to_string(),
            ));
        }
        if let Some(root) = &self.state_root {
            if !root.is_absolute() {
                return Err(ConfigError::Invalid(
                    "`state_root` must be an absolute path".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn resolve_state_root(&self) -> Result<PathBuf, ConfigError> {
        if let Some(root) = state_root_override() {
            return Ok(root);
        }
        match &self.state_root {
            Some(root) => Ok(root.clone()),
            None => default_state_root_path(),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_concurrency: self.max_concurrency,
            dispatch_interval: Duration::from_millis(self.dispatch_interval_ms),
            archive_retention: Duration::from_secs(self.archive_retention_secs),
            default_reply_timeout: self.agent_reply_timeout_secs.map(Duration::from_secs),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
        }
    }

    pub fn schedule_poll_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_poll_interval_secs)
    }
}
