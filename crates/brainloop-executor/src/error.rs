//! Executor and governor error types.

use thiserror::Error;

/// Errors raised by the sandboxed executor or the command governor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The command exceeded its timeout and was killed.
    #[error("command timed out after {0}s")]
    Timeout(u64),

    /// Spawning or waiting on the child process failed.
    #[error("failed to run command: {0}")]
    Spawn(#[from] std::io::Error),

    /// The command registry/ledger layer failed.
    #[error(transparent)]
    Command(#[from] brainloop_commands::CommandError),

    /// The storage layer failed.
    #[error(transparent)]
    Storage(#[from] brainloop_storage::StorageError),

    /// The command was rejected before it ever reached the sandbox: a
    /// dangerous-pattern match, a permanent block, or an operator override
    /// of `never`. Never resolved by retrying with `force`.
    #[error("rejected: {reason}")]
    Rejected {
        /// Human-readable rejection reason.
        reason: String,
    },

    /// The command is not yet auto-approved and the caller did not pass
    /// `force`; distinct from [`Self::Rejected`] because retrying the same
    /// request with `force: true` can succeed.
    #[error("command is not auto-approved; retry with an explicit override")]
    PendingValidation,
}

/// Result type for executor/governor operations.
pub type ExecutorResult<T> = Result<T, ExecutorError>;
