//! Commonly used types for convenient import.
//!
//! Use `use brainloop_telemetry::prelude::*;` to import all essential types.

// Errors
pub use crate::{TelemetryError, TelemetryResult};

// Logging configuration
pub use crate::{LogConfig, LogFormat, LogTarget};

// Setup functions
pub use crate::{setup_default_logging, setup_logging};

// Request context
pub use crate::{RequestContext, RequestGuard};

// Security events
pub use crate::{SecurityEvent, log_security_rejection};
