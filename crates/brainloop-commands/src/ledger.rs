//! Idempotency ledger: a flat `(hash, operation) -> result` table that lets
//! the governor and the session manager safely re-process a retried
//! request without repeating its side effect.
//!
//! Unlike a hash-chained audit log, entries here carry no link to their
//! predecessor; the only property this ledger guarantees is "the same key
//! never produces two different recorded results."

use std::sync::Arc;

use brainloop_core::{CommandHash, Timestamp};
use brainloop_storage::LifecycleDb;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CommandResult;

/// A handle onto the idempotency ledger, backed by `lifecycle.db`.
#[derive(Clone)]
pub struct IdempotencyLedger {
    db: Arc<LifecycleDb>,
}

impl IdempotencyLedger {
    /// Wrap a shared [`LifecycleDb`] handle.
    #[must_use]
    pub fn new(db: Arc<LifecycleDb>) -> Self {
        Self { db }
    }

    /// `true` if `hash` has already recorded a result for `operation`.
    pub fn is_processed(&self, hash: &CommandHash, operation: &str) -> CommandResult<bool> {
        Ok(self.db.is_processed(hash.as_str(), operation)?)
    }

    /// Fetch and deserialize a previously recorded result, if any.
    pub fn get_processed<T: DeserializeOwned>(
        &self,
        hash: &CommandHash,
        operation: &str,
    ) -> CommandResult<Option<T>> {
        let Some(entry) = self.db.get_processed(hash.as_str(), operation)? else {
            return Ok(None);
        };
        let value = serde_json::from_str(&entry.result_json)
            .map_err(brainloop_storage::StorageError::from)?;
        Ok(Some(value))
    }

    /// Serialize and record `result` for `hash`/`operation`. A second call
    /// with the same key is a no-op; the first recorded result always wins.
    pub fn mark_processed<T: Serialize>(
        &self,
        hash: &CommandHash,
        operation: &str,
        result: &T,
    ) -> CommandResult<()> {
        let result_json = serde_json::to_string(result).map_err(brainloop_storage::StorageError::from)?;
        self.db
            .mark_processed(hash.as_str(), operation, &result_json, Timestamp::now().epoch_seconds())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Outcome {
        exit_code: i32,
    }

    #[test]
    fn duplicate_mark_processed_keeps_first_result() {
        let ledger = IdempotencyLedger::new(Arc::new(LifecycleDb::open_in_memory().unwrap()));
        let hash = CommandHash::of("echo hi");

        ledger.mark_processed(&hash, "execute_bash", &Outcome { exit_code: 0 }).unwrap();
        ledger.mark_processed(&hash, "execute_bash", &Outcome { exit_code: 1 }).unwrap();

        assert!(ledger.is_processed(&hash, "execute_bash").unwrap());
        let stored: Outcome = ledger.get_processed(&hash, "execute_bash").unwrap().unwrap();
        assert_eq!(stored, Outcome { exit_code: 0 });
    }

    #[test]
    fn different_operations_are_independent() {
        let ledger = IdempotencyLedger::new(Arc::new(LifecycleDb::open_in_memory().unwrap()));
        let hash = CommandHash::of("echo hi");
        ledger.mark_processed(&hash, "execute_bash", &Outcome { exit_code: 0 }).unwrap();
        assert!(!ledger.is_processed(&hash, "commit_block").unwrap());
    }
}
