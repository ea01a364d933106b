//! Sync configuration module
//!
//! Configuration is resolved in three layers: built-in defaults, an optional
//! TOML file, and `XFSYNC_*` environment variables. Every path ends in
//! [`SyncConfigBuilder::build`], which validates the result.
//!
//! ```toml
//! database_path = "/var/lib/app/local.db"
//! sync_interval_secs = 60
//!
//! [retry]
//! base_delay_ms = 500
//! max_attempts = 5
//! ```

use crate::offline::retry::{BackoffStrategy, RetryPolicy};
use crate::shared::event::DEFAULT_EVENT_CAPACITY;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Retry settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds
    pub max_delay_ms: u64,
    /// Failed attempts after which an operation is parked
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            max_attempts: 3,
        }
    }
}

/// Sync engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Local SQLite database file
    pub database_path: PathBuf,
    /// Periodic sync interval in seconds
    pub sync_interval_secs: u64,
    /// Run passes from the background service
    pub auto_sync: bool,
    /// Retry policy settings
    pub retry: RetryConfig,
    /// Acknowledged tombstones older than this are purged
    pub tombstone_retention_days: u32,
    /// Observer channel capacity
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            sync_interval_secs: 30,
            auto_sync: true,
            retry: RetryConfig::default(),
            tombstone_retention_days: 30,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SyncConfig {
    /// Create a new SyncConfigBuilder
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Parse TOML, apply environment overrides and validate
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        SyncConfigBuilder::from(config).with_env().build()
    }

    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        SyncConfigBuilder::default().with_env().build()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid("retry.base_delay_ms exceeds retry.max_delay_ms"));
        }
        if self.sync_interval_secs == 0 {
            return Err(ConfigError::Invalid("sync_interval_secs must be non-zero"));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be non-zero"));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Retry policy described by this configuration
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            BackoffStrategy::Exponential {
                base: Duration::from_millis(self.retry.base_delay_ms),
                max: Duration::from_millis(self.retry.max_delay_ms),
            },
            self.retry.max_attempts,
        )
    }

    pub fn tombstone_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.tombstone_retention_days))
    }
}

/// Builder for SyncConfig
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl From<SyncConfig> for SyncConfigBuilder {
    fn from(config: SyncConfig) -> Self {
        Self { config }
    }
}

impl SyncConfigBuilder {
    /// Set the database path
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.database_path = path.into();
        self
    }

    /// Set the periodic sync interval
    pub fn sync_interval_secs(mut self, secs: u64) -> Self {
        self.config.sync_interval_secs = secs;
        self
    }

    pub fn auto_sync(mut self, enabled: bool) -> Self {
        self.config.auto_sync = enabled;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    pub fn retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.config.retry.base_delay_ms = base.as_millis() as u64;
        self.config.retry.max_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Apply `XFSYNC_*` environment overrides
    pub fn with_env(mut self) -> Self {
        if let Ok(path) = std::env::var("XFSYNC_DATABASE_PATH") {
            self.config.database_path = PathBuf::from(path);
        }
        if let Some(secs) = env_parse("XFSYNC_SYNC_INTERVAL_SECS") {
            self.config.sync_interval_secs = secs;
        }
        if let Some(attempts) = env_parse("XFSYNC_MAX_ATTEMPTS") {
            self.config.retry.max_attempts = attempts;
        }
        if let Ok(flag) = std::env::var("XFSYNC_AUTO_SYNC") {
            self.config.auto_sync = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<SyncConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring unparsable {}={}", key, raw);
            None
        }
    }
}

/// Platform data directory for the local database
fn default_database_path() -> PathBuf {
    let mut path = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
    path.push("xfsync");
    path.push("local.db");
    path
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config file: {0}")]
    Parse(String),
    #[error("invalid value: {0}")]
    Invalid(&'static str),
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
}
