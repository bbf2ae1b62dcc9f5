//! Configuration management for the collector.

use std::collections::HashSet;
use std::env;

/// Collector configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Maximum pooled database connections
    pub max_connections: u32,
    /// App IDs allowed to upload; any app when unset
    pub allowed_app_ids: Option<HashSet<String>>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;

        let max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidMaxConnections)?;

        let allowed_app_ids = env::var("ALLOWED_APP_IDS")
            .ok()
            .map(|ids| parse_app_ids(&ids))
            .filter(|ids| !ids.is_empty());

        Ok(Self {
            host,
            port,
            database_url,
            max_connections,
            allowed_app_ids,
        })
    }

    /// Check whether an app may upload.
    pub fn is_app_allowed(&self, app_id: &str) -> bool {
        self.allowed_app_ids
            .as_ref()
            .map_or(true, |allowed| allowed.contains(app_id))
    }
}

/// Parse a comma-separated list of app IDs.
fn parse_app_ids(value: &str) -> HashSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid DATABASE_MAX_CONNECTIONS value")]
    InvalidMaxConnections,
}
