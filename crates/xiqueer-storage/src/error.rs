//! Storage error types.

use thiserror::Error;

/// Errors raised by the snapshot store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// SQLite failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Course list or config value could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem failure while preparing the database location.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The store could not be located or locked.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The database file cannot be brought to this build's schema.
    #[error("Migration error: {0}")]
    Migration(String),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
