//! Storage error types.

use thiserror::Error;

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested row was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Serialization or deserialization of a stored value failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Opening or preparing a database directory failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A value read back from storage violated an invariant (e.g. an
    /// unrecognised lifecycle state string).
    #[error("invalid stored value in {column}: {value}")]
    InvalidValue {
        /// Column the value came from.
        column: String,
        /// The value, as read.
        value: String,
    },
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
