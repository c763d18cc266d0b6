//! Lockstep Cache - Local state persistence
//!
//! SQLite-based storage for the engine snapshot:
//! - Per-file sync records
//! - Upload and download queues
//! - Engine mode, server lock flag and recovery progress
//! - An advisory instance lock that keeps a second writer away
//!
//! ## Architecture
//!
//! This crate implements the `IStateStore` port from `lockstep-core`
//! using SQLite as the storage backend. It is a driven (secondary) adapter
//! in the hexagonal architecture.
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use lockstep_cache::{DatabasePool, SqliteStateStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = DatabasePool::new(Path::new("/home/user/.local/share/lockstep/lockstep.db")).await?;
//! let store = SqliteStateStore::new(pool.pool().clone());
//! // Use store as IStateStore...
//! # Ok(())
//! # }
//! ```

pub mod instance;
pub mod pool;
pub mod store;

pub use instance::InstanceLock;
pub use pool::DatabasePool;
pub use store::SqliteStateStore;

/// Errors that can occur during cache operations
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

    /// Serialization or deserialization of domain types failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Another process (by pid) is writing to the database
    #[error("Database is in use by process {0}")]
    Locked(u32),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}
