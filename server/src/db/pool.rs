//! Database connection pool management.

use crate::config::Config;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// Type alias for the database pool.
pub type Pool = PgPool;

/// How long a request waits for a free connection.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

fn pool_options(config: &Config) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
}

/// Create a new database connection pool.
pub async fn create_pool(config: &Config) -> Result<Pool, sqlx::Error> {
    pool_options(config).connect(&config.database_url).await
}

/// Create a pool that connects on first use.
#[cfg(test)]
pub fn create_lazy_pool(config: &Config) -> Result<Pool, sqlx::Error> {
    pool_options(config).connect_lazy(&config.database_url)
}

/// Run database migrations.
pub async fn run_migrations(pool: &Pool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
