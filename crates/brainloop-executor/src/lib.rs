//! Sandboxed command execution and the command governor that orchestrates
//! validation, policy evaluation, execution, and auto-evolution for a
//! single `execute_bash` request.

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod error;
pub mod governor;
pub mod sandbox;

pub use error::{ExecutorError, ExecutorResult};
pub use governor::{CommandGovernor, ExecuteBashRequest, ExecuteBashResponse};
pub use sandbox::{ExecutionOutcome, run_sandboxed};
