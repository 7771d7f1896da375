//! Top-level error type for failures not owned by a single downstream crate.

use thiserror::Error;

/// Errors raised by `brainloop-core` itself (identifier parsing, hashing).
#[derive(Debug, Error)]
pub enum CoreError {
    /// An identifier string was not a well-formed UUID.
    #[error("invalid identifier {value:?}: {source}")]
    InvalidId {
        /// The string that failed to parse.
        value: String,
        /// Underlying UUID parse error.
        #[source]
        source: uuid::Error,
    },

    /// A command hash string was not 64 hex characters.
    #[error("invalid command hash {0:?}: expected 64 hex characters")]
    InvalidCommandHash(String),
}

/// Result type for `brainloop-core` operations.
pub type CoreResult<T> = Result<T, CoreError>;
