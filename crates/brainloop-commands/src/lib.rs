//! Idempotency ledger, command validator, registry, and policy engine for
//! the brainloop worker's command governor.

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod error;
pub mod ledger;
pub mod policy;
pub mod registry;
pub mod validator;

pub use error::{CommandError, CommandResult};
pub use ledger::IdempotencyLedger;
pub use registry::CommandRegistry;
pub use validator::{DANGEROUS_PATTERNS, INJECTION_PATTERNS, Rejection, RejectionKind, ValidationOutcome, validate};
