//! Error type for the daemon binary: startup validation, lock handling,
//! and the JSON-RPC dispatch loop.

use thiserror::Error;

/// Errors the daemon can raise. Everything here is a §7 `Fatal` condition
/// (causes the process to abort at or before startup) except
/// [`DaemonError::Rpc`], which is caught at the dispatch loop and turned
/// into a JSON-RPC error response rather than crashing the process.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// A required schema file was missing from the working directory.
    #[error("missing required file in working directory: {0}")]
    MissingSchemaFile(String),

    /// The working directory's name does not contain the expected project
    /// identifier.
    #[error("working directory name does not contain project identifier {0:?}")]
    ProjectNameMismatch(String),

    /// `brainloop.lock` is held by another live process.
    #[error("worker already running with pid {0}")]
    AlreadyRunning(i32),

    /// Failure reading or writing the lock file itself.
    #[error("lock file error: {0}")]
    Lock(String),

    /// Storage layer failure.
    #[error(transparent)]
    Storage(#[from] brainloop_storage::StorageError),

    /// Config layer failure.
    #[error(transparent)]
    Config(#[from] brainloop_config::ConfigError),

    /// I/O failure outside the lock file (reading stdin, writing stdout).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A per-request failure that should be reported as a JSON-RPC error
    /// response rather than propagated to the caller of the dispatch loop.
    #[error("{0}")]
    Rpc(String),
}

/// Result type for daemon-level operations.
pub type DaemonResult<T> = Result<T, DaemonError>;
