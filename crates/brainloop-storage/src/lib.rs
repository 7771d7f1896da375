//! Embedded SQLite storage layer for the brainloop worker.
//!
//! Five independent SQLite databases, one per concern, each opened with the
//! worker's standard WAL pragma set ([`pragma::apply_standard_pragmas`]).
//! No query ever joins across database boundaries; callers that need data
//! from two databases combine typed Rust values after two separate reads.

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod command_security;
pub mod error;
pub mod input;
pub mod lifecycle;
pub mod metadata;
pub mod output;
pub mod pragma;

pub use command_security::{CommandRecord, CommandSecurityDb, RegistryStats};
pub use error::{StorageError, StorageResult};
pub use input::{CachedDigest, InputDb};
pub use lifecycle::{LedgerEntry, LifecycleDb, SessionBlockRow};
pub use metadata::MetadataDb;
pub use output::{LlmMetricRow, OutputDb};

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Owns all five of the worker's databases, opened under one data
/// directory. Each handle is `Arc`-wrapped so components that need their
/// own shared reference (the idempotency ledger, the command registry, the
/// session manager, ...) can clone it out independently of the bundle.
pub struct Databases {
    /// `lifecycle.db` — idempotency ledger, session blocks, heartbeat.
    pub lifecycle: Arc<LifecycleDb>,
    /// `output.db` — generated files, SQL executions, LLM metrics.
    pub output: Arc<OutputDb>,
    /// `metadata.db` — security event log.
    pub metadata: Arc<MetadataDb>,
    /// `command_security.db` — command registry.
    pub command_security: Arc<CommandSecurityDb>,
    /// `input.db` — reserved for the (out-of-scope) extraction component.
    pub input: Arc<InputDb>,
}

impl Databases {
    /// Open all five databases under `data_dir`, creating the directory and
    /// schema on first run.
    pub fn open(data_dir: &Path) -> StorageResult<Self> {
        Ok(Self {
            lifecycle: Arc::new(LifecycleDb::open(data_dir)?),
            output: Arc::new(OutputDb::open(data_dir)?),
            metadata: Arc::new(MetadataDb::open(data_dir)?),
            command_security: Arc::new(CommandSecurityDb::open(data_dir)?),
            input: Arc::new(InputDb::open(data_dir)?),
        })
    }

    /// Open all five databases in-memory, for tests.
    pub fn open_in_memory() -> StorageResult<Self> {
        Ok(Self {
            lifecycle: Arc::new(LifecycleDb::open_in_memory()?),
            output: Arc::new(OutputDb::open_in_memory()?),
            metadata: Arc::new(MetadataDb::open_in_memory()?),
            command_security: Arc::new(CommandSecurityDb::open_in_memory()?),
            input: Arc::new(InputDb::open_in_memory()?),
        })
    }

    /// Flush the WAL for every on-disk database, called during shutdown
    /// phase 1.
    pub fn checkpoint_all(&self) -> StorageResult<()> {
        self.lifecycle.checkpoint()?;
        self.output.checkpoint()?;
        self.metadata.checkpoint()?;
        self.command_security.checkpoint()?;
        Ok(())
    }
}

/// Default data directory name, relative to the workspace root.
#[must_use]
pub fn default_data_dir_name() -> PathBuf {
    PathBuf::from(".brainloop")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_all_five_databases_in_memory() {
        Databases::open_in_memory().unwrap();
    }

    #[test]
    fn opens_all_five_databases_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let dbs = Databases::open(dir.path()).unwrap();
        dbs.checkpoint_all().unwrap();
        assert!(dir.path().join("lifecycle.db").exists());
        assert!(dir.path().join("output.db").exists());
        assert!(dir.path().join("metadata.db").exists());
        assert!(dir.path().join("command_security.db").exists());
        assert!(dir.path().join("input.db").exists());
    }
}
