//! Service configuration.
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. CLI flags
//! 2. Environment variables (REPOSITORIES_*), resolved by clap
//! 3. Config file (TOML)
//! 4. Default values
//!
//! The resulting `Config` is built once in `main` and shared with every task.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid cache root {0}: {1}")]
    CacheRoot(PathBuf, String),

    #[error("Missing configuration: {0}")]
    Missing(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    pub addr: String,
    pub port: u16,
    /// Public URL advertised to the orchestrator
    pub url: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1".to_string(),
            port: 8085,
            url: "http://localhost:8085".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VacuumConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for VacuumConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Orchestrator API; heartbeat is disabled when unset
    pub api_url: Option<String>,
    pub token: String,
    pub name: String,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub max_failures: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            token: String::new(),
            name: "repositories".to_string(),
            interval: Duration::from_secs(30),
            max_failures: 10,
        }
    }
}

impl std::fmt::Debug for HeartbeatConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatConfig")
            .field("api_url", &self.api_url)
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("max_failures", &self.max_failures)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CommitConfig {
    pub name: String,
    pub email: String,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            name: "cds".to_string(),
            email: "cds@localhost".to_string(),
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub http: HttpConfig,

    /// Cache root holding one working tree per repository
    pub basedir: PathBuf,

    /// SQLite database backing the operation store
    pub database: PathBuf,

    pub operation_retention_days: u32,
    pub repositories_retention_days: u32,

    #[serde(with = "humantime_serde")]
    pub lock_ttl: Duration,
    /// How long the processor waits for a repository lock
    #[serde(with = "humantime_serde")]
    pub lock_wait: Duration,
    /// Unacknowledged queue entries are redelivered after this delay
    #[serde(with = "humantime_serde")]
    pub queue_visibility_timeout: Duration,

    pub vacuum: VacuumConfig,
    pub heartbeat: HeartbeatConfig,
    pub commit: CommitConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            basedir: PathBuf::new(),
            database: PathBuf::from("repositories.db"),
            operation_retention_days: 5,
            repositories_retention_days: 10,
            lock_ttl: Duration::from_secs(30 * 60),
            lock_wait: Duration::from_secs(10),
            queue_visibility_timeout: Duration::from_secs(30 * 60),
            vacuum: VacuumConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            commit: CommitConfig::default(),
        }
    }
}

const DAY: u64 = 24 * 60 * 60;

impl Config {
    /// Load configuration from a file, or defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn operation_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.operation_retention_days) * DAY)
    }

    pub fn repositories_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.repositories_retention_days) * DAY)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.basedir.as_os_str().is_empty() {
            return Err(ConfigError::Missing("basedir"));
        }
        if self.database.as_os_str().is_empty() {
            return Err(ConfigError::Missing("database"));
        }
        if self.vacuum.interval.is_zero() {
            return Err(ConfigError::Invalid("vacuum.interval must be positive"));
        }
        if self.heartbeat.interval.is_zero() {
            return Err(ConfigError::Invalid("heartbeat.interval must be positive"));
        }
        Ok(())
    }
}
