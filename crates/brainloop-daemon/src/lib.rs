//! Library surface of the `brainloop-daemon` worker, split out from the
//! binary so the end-to-end suite under `tests/` can drive the dispatcher
//! and lifecycle coordinator directly instead of through a subprocess.

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod reader_cache;

pub use dispatcher::Dispatcher;
pub use error::{DaemonError, DaemonResult};
pub use lifecycle::{LockHandle, WorkerLifecycle, acquire_lock, validate_working_directory};
pub use reader_cache::ReaderCache;
