//! Generation gateway and rate limiter error types.

use thiserror::Error;

/// Errors raised by the generation gateway, the rate limiter, or the
/// latency histogram.
#[derive(Debug, Error)]
pub enum LlmError {
    /// No API key resolved for the configured provider.
    #[error("API key not configured for provider {provider}")]
    ApiKeyNotConfigured {
        /// Provider name.
        provider: String,
    },

    /// The HTTP request itself failed (network error, TLS, etc).
    #[error("request to completion API failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The completion API returned a non-success status.
    #[error("completion API returned {status}: {body}")]
    ApiStatus {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The completion API's response body could not be parsed.
    #[error("invalid completion API response: {0}")]
    InvalidResponse(String),

    /// The rate limiter is in its backoff window after consecutive errors.
    #[error("rate limiter backoff active, retry after {retry_after_secs}s")]
    BackoffActive {
        /// Seconds remaining in the backoff window.
        retry_after_secs: u64,
    },

    /// `wait` did not acquire a token before its deadline elapsed.
    #[error("rate limiter wait exceeded its deadline")]
    WaitTimedOut,

    /// The retry loop exhausted its configured attempt budget.
    #[error("retry budget exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Attempts made, including the first.
        attempts: u32,
        /// The last error encountered.
        #[source]
        source: Box<LlmError>,
    },

    /// The storage layer failed while persisting gateway telemetry.
    #[error(transparent)]
    Storage(#[from] brainloop_storage::StorageError),
}

/// Result type for generation-gateway and rate-limiter operations.
pub type LlmResult<T> = Result<T, LlmError>;
