//! Foundation types shared by every brainloop worker crate.
//!
//! This crate provides:
//! - Identifiers used across the storage, command, session and daemon layers
//! - The command risk/policy vocabulary shared by the validator and the
//!   policy engine
//! - The environment allow-list enforced by the sandboxed executor
//! - A small top-level error type for failures that do not belong to any
//!   single downstream crate

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod env_policy;
pub mod error;
pub mod ids;
pub mod risk;
pub mod time;

pub use error::{CoreError, CoreResult};
pub use ids::{BlockId, CommandHash, SessionId, WorkerId};
pub use risk::{CommandState, PolicyDecision, RiskLevel};
pub use time::Timestamp;
