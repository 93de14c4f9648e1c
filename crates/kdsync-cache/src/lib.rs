//! kdsync Cache - Sync database persistence
//!
//! SQLite-based storage for:
//! - The last state both replicas agreed on (one row per synchronized item)
//! - Per-profile node-id lists (blacklist, whitelist, undecided, temporary)
//! - The remote listing cursor
//!
//! ## Architecture
//!
//! This crate implements the `ISyncDb` port from `kdsync-core` using SQLite
//! as the storage backend. It is a driven (secondary) adapter.
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use kdsync_cache::{DatabasePool, SqliteSyncDb};
//! use kdsync_core::domain::NodeId;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = DatabasePool::new(Path::new("/home/user/.local/share/kdsync/1.db")).await?;
//! let db = SqliteSyncDb::new(pool.pool().clone());
//! db.init_root(&NodeId::new("2"), &NodeId::new("1")).await?;
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod sync_db;

pub use pool::DatabasePool;
pub use sync_db::SqliteSyncDb;

/// Errors that can occur during sync database operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A stored value could not be mapped back to a domain type
    #[error("Corrupted row: {0}")]
    CorruptedRow(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}
