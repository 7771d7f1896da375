//! Error type for the session manager.

use brainloop_core::BlockId;
use brainloop_core::SessionId;
use thiserror::Error;

/// Errors the session manager can return.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No session exists with this id.
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    /// No block `block_id` exists within `session_id`.
    #[error("block {block_id} not found in session {session_id}")]
    BlockNotFound {
        /// Owning session.
        session_id: SessionId,
        /// Missing block.
        block_id: BlockId,
    },

    /// A block type string stored in `session_blocks` could not be parsed.
    #[error("invalid block type: {0}")]
    InvalidBlockType(String),

    /// A row has no `target`, which every block needs at commit time.
    #[error("block {block_id} in session {session_id} has no commit target")]
    MissingTarget {
        /// Owning session.
        session_id: SessionId,
        /// Block missing its target.
        block_id: BlockId,
    },

    /// `refine` or `commit` was called on a block that has already
    /// committed.
    #[error("block {block_id} in session {session_id} is already committed")]
    AlreadyCommitted {
        /// Owning session.
        session_id: SessionId,
        /// Already-committed block.
        block_id: BlockId,
    },

    /// `propose` was called with an empty block list.
    #[error("a session must propose at least one block")]
    EmptyProposal,

    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] brainloop_storage::StorageError),

    /// Underlying idempotency-ledger failure.
    #[error(transparent)]
    Commands(#[from] brainloop_commands::CommandError),

    /// Underlying generation-gateway failure.
    #[error(transparent)]
    Llm(#[from] brainloop_llm::LlmError),

    /// Failure writing a generated file to the workspace.
    #[error("failed to write generated file: {0}")]
    Io(#[from] std::io::Error),

    /// Failure executing generated SQL against a target database.
    #[error("failed to execute generated SQL: {0}")]
    Sql(#[from] rusqlite::Error),

    /// Failure (de)serializing a stored commit outcome.
    #[error("failed to (de)serialize commit outcome: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Convenience alias for session manager results.
pub type SessionResult<T> = Result<T, SessionError>;
