//! Database connection pool management
//!
//! Wraps SQLx's `SqlitePool` with:
//! - Directory creation for the database file
//! - WAL journal mode so observers can read while the executor writes
//! - Foreign keys enabled, needed for cascading subtree deletes
//! - Schema migration on open
//! - In-memory mode for tests

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::CacheError;

/// Pool of SQLite connections to one sync database
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Opens (creating if needed) the sync database at `db_path`
    ///
    /// # Errors
    ///
    /// Returns `CacheError::ConnectionFailed` if the file cannot be opened,
    /// or `CacheError::MigrationFailed` if the schema cannot be applied.
    pub async fn new(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "Failed to open sync database at {}: {}",
                    db_path.display(),
                    e
                ))
            })?;

        Self::migrate(&pool).await?;

        tracing::info!(path = %db_path.display(), "Sync database opened");

        Ok(Self { pool })
    }

    /// Creates an in-memory sync database
    ///
    /// A single connection is used: each SQLite in-memory database lives
    /// and dies with its connection.
    pub async fn in_memory() -> Result<Self, CacheError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| CacheError::ConnectionFailed(e.to_string()))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!("Failed to create in-memory database: {}", e))
            })?;

        Self::migrate(&pool).await?;

        tracing::debug!("In-memory sync database initialized");

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying SQLite connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), CacheError> {
        sqlx::raw_sql(include_str!("migrations/0001_sync_db.sql"))
            .execute(pool)
            .await
            .map_err(|e| CacheError::MigrationFailed(format!("sync_db schema: {}", e)))?;
        Ok(())
    }
}
