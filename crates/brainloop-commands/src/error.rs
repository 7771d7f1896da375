//! Command-layer error types.

use thiserror::Error;

/// Errors raised by the idempotency ledger, validator, registry, or policy
/// engine.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The underlying storage layer failed.
    #[error(transparent)]
    Storage(#[from] brainloop_storage::StorageError),

    /// The command text failed validation outright (empty, too long).
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

/// Result type for command-layer operations.
pub type CommandResult<T> = Result<T, CommandError>;
