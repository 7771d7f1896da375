//! Logging and tracing for the brainloop worker.
//!
//! This crate provides:
//! - Configurable logging setup with multiple formats
//! - Request context for correlation across operations
//! - Structured security-event emission shared by the validator and policy
//!   engine
//!
//! # Example
//!
//! ```rust,no_run
//! use brainloop_telemetry::{LogConfig, LogFormat, setup_logging, RequestContext};
//!
//! # fn main() -> Result<(), brainloop_telemetry::TelemetryError> {
//! let config = LogConfig::new("debug")
//!     .with_format(LogFormat::Pretty)
//!     .with_directive("brainloop_commands=trace");
//!
//! setup_logging(&config)?;
//!
//! let ctx = RequestContext::new("execute_bash").with_operation("governor");
//! let span = ctx.span();
//! let _guard = span.enter();
//! tracing::info!("processing request");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod context;
mod error;
mod logging;
mod security;

pub use context::{RequestContext, RequestGuard};
pub use error::{TelemetryError, TelemetryResult};
pub use logging::{LogConfig, LogFormat, LogTarget, setup_default_logging, setup_logging};
pub use security::{SecurityEvent, log_security_rejection};
