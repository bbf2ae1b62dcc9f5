//! Engine configuration.
//!
//! Every numeric policy of the pipeline (buffer size, batching, retries,
//! backoff) lives here. Configuration can come from code, from JSON (the
//! FFI layer passes it that way) or from `APPROVER_*` environment
//! variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default collection endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://api.approver.io/v1/batches";

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// URL batches are posted to
    pub endpoint: String,
    /// Directory for the journal and dead letters; in-memory when unset
    pub storage_dir: Option<PathBuf>,
    /// Device ID for a fresh journal; a random UUID when unset
    pub device_id: Option<String>,
    /// Maximum unacknowledged records before the oldest is evicted
    pub buffer_capacity: usize,
    /// Maximum records per batch
    pub max_batch_records: usize,
    /// Maximum encoded bytes per batch
    pub max_batch_bytes: usize,
    /// Regular send interval
    pub flush_interval_ms: u64,
    /// Timeout of one send attempt
    pub request_timeout_ms: u64,
    /// Failed attempts a record may have before it is dead-lettered
    pub max_retries: u32,
    /// First backoff delay
    pub backoff_base_ms: u64,
    /// Backoff ceiling
    pub backoff_max_ms: u64,
    /// Removals between journal compactions
    pub compact_after: usize,
    /// `fsync` every journal write
    pub sync_writes: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            storage_dir: None,
            device_id: None,
            buffer_capacity: 10_000,
            max_batch_records: 100,
            max_batch_bytes: 512 * 1024,
            flush_interval_ms: 30_000,
            request_timeout_ms: 10_000,
            max_retries: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            compact_after: 1_000,
            sync_writes: true,
        }
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(default),
    }
}

impl EngineConfig {
    /// Load configuration from `APPROVER_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            endpoint: env::var("APPROVER_ENDPOINT").unwrap_or(defaults.endpoint),
            storage_dir: env::var("APPROVER_STORAGE_DIR").ok().map(PathBuf::from),
            device_id: env::var("APPROVER_DEVICE_ID").ok(),
            buffer_capacity: parse_var("APPROVER_BUFFER_CAPACITY", defaults.buffer_capacity)?,
            max_batch_records: parse_var(
                "APPROVER_MAX_BATCH_RECORDS",
                defaults.max_batch_records,
            )?,
            max_batch_bytes: parse_var("APPROVER_MAX_BATCH_BYTES", defaults.max_batch_bytes)?,
            flush_interval_ms: parse_var(
                "APPROVER_FLUSH_INTERVAL_MS",
                defaults.flush_interval_ms,
            )?,
            request_timeout_ms: parse_var(
                "APPROVER_REQUEST_TIMEOUT_MS",
                defaults.request_timeout_ms,
            )?,
            max_retries: parse_var("APPROVER_MAX_RETRIES", defaults.max_retries)?,
            backoff_base_ms: parse_var("APPROVER_BACKOFF_BASE_MS", defaults.backoff_base_ms)?,
            backoff_max_ms: parse_var("APPROVER_BACKOFF_MAX_MS", defaults.backoff_max_ms)?,
            compact_after: parse_var("APPROVER_COMPACT_AFTER", defaults.compact_after)?,
            sync_writes: parse_var("APPROVER_SYNC_WRITES", defaults.sync_writes)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check that the values make sense together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("endpoint must not be empty".into()));
        }
        if self.buffer_capacity == 0 {
            return Err(ConfigError::Invalid("buffer capacity must be positive".into()));
        }
        if self.max_batch_records == 0 || self.max_batch_bytes == 0 {
            return Err(ConfigError::Invalid("batch limits must be positive".into()));
        }
        if self.flush_interval_ms == 0 || self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "flush interval and request timeout must be positive".into(),
            ));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ConfigError::Invalid(
                "backoff max must not be below backoff base".into(),
            ));
        }
        Ok(())
    }

    /// Regular send interval.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Timeout of one send attempt.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// First backoff delay.
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Backoff ceiling.
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::Error {
    fn from(err: ConfigError) -> Self {
        crate::Error::Config(err.to_string())
    }
}
