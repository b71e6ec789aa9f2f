use std::str::FromStr;
use std::time::Duration;

use crmgate_core::config::DatabaseConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::migrations;

pub type DbPool = sqlx::SqlitePool;

pub async fn connect(database_url: &str) -> Result<DbPool, sqlx::Error> {
    connect_with_settings(database_url, 5, 30).await
}

/// Opens a pool with WAL journaling and a busy timeout so that `BEGIN IMMEDIATE`
/// writers queue instead of failing. File databases are created on first use.
pub async fn connect_with_settings(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)))
        .connect_with(options)
        .await
}

/// Connects using the `[database]` section and brings the schema up to date.
pub async fn open_store(config: &DatabaseConfig) -> Result<DbPool, OpenStoreError> {
    let pool = connect_with_settings(&config.url, config.max_connections, config.timeout_secs).await?;
    migrations::run_pending(&pool).await?;
    tracing::debug!(event_name = "store.opened", database_url = %config.url, "sqlite store ready");
    Ok(pool)
}

#[derive(Debug, thiserror::Error)]
pub enum OpenStoreError {
    #[error("database connection failed: {0}")]
    Connect(#[from] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}
