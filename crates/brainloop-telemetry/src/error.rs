//! Telemetry error types.

use thiserror::Error;

/// Errors that can occur with telemetry operations.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The requested logging configuration was invalid.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Installing the global subscriber failed (e.g. one was already set).
    #[error("initialization error: {0}")]
    InitError(String),

    /// A log file target could not be opened.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
