//! Command registry: the durable record of every command ever executed,
//! its risk score, its lifecycle state, and its execution history.

use std::sync::Arc;

use brainloop_core::{CommandHash, RiskLevel, Timestamp};
use brainloop_storage::{CommandRecord, CommandSecurityDb, RegistryStats};

use crate::error::CommandResult;

/// A handle onto the command registry, backed by `command_security.db`.
#[derive(Clone)]
pub struct CommandRegistry {
    db: Arc<CommandSecurityDb>,
}

impl CommandRegistry {
    /// Wrap a shared [`CommandSecurityDb`] handle.
    #[must_use]
    pub fn new(db: Arc<CommandSecurityDb>) -> Self {
        Self { db }
    }

    /// Fetch or create the registry row for `hash`.
    pub fn get_or_create(
        &self,
        hash: &CommandHash,
        command_text: &str,
        risk_score: u32,
        risk_level: RiskLevel,
    ) -> CommandResult<CommandRecord> {
        Ok(self.db.get_or_create(
            hash.as_str(),
            command_text,
            risk_score,
            &format!("{risk_level:?}"),
            Timestamp::now().epoch_seconds(),
        )?)
    }

    /// Fetch the current row, if any.
    pub fn get(&self, hash: &CommandHash) -> CommandResult<Option<CommandRecord>> {
        Ok(self.db.get(hash.as_str())?)
    }

    /// Record one execution outcome against `hash`.
    pub fn record_execution(&self, hash: &CommandHash, success: bool, duration_ms: i64, exit_code: i32) -> CommandResult<CommandRecord> {
        Ok(self.db.record_execution(hash.as_str(), success, duration_ms, exit_code, Timestamp::now().epoch_seconds())?)
    }

    /// Promote `hash` to `AutoApproved`, recording why.
    pub fn promote(&self, hash: &CommandHash, reason: &str) -> CommandResult<()> {
        Ok(self.db.promote(hash.as_str(), Timestamp::now().epoch_seconds(), reason)?)
    }

    /// Move `hash` into `Monitoring`.
    pub fn set_monitoring(&self, hash: &CommandHash) -> CommandResult<()> {
        Ok(self.db.set_monitoring(hash.as_str(), Timestamp::now().epoch_seconds())?)
    }

    /// Permanently block `hash`.
    pub fn block(&self, hash: &CommandHash) -> CommandResult<()> {
        Ok(self.db.block(hash.as_str())?)
    }

    /// Disable duplicate detection for `hash` (monitoring rule: this
    /// command is genuinely a polling loop).
    pub fn disable_duplicate_check(&self, hash: &CommandHash) -> CommandResult<()> {
        Ok(self.db.disable_duplicate_check(hash.as_str(), Timestamp::now().epoch_seconds())?)
    }

    /// Raise `hash`'s duplicate-detection threshold (rarity rule: this
    /// command is rarely repeated, so a wider gap is still suspicious).
    pub fn raise_duplicate_threshold(&self, hash: &CommandHash, threshold_ms: i64) -> CommandResult<()> {
        Ok(self.db.set_duplicate_threshold(hash.as_str(), threshold_ms, Timestamp::now().epoch_seconds())?)
    }

    /// Set (or clear) the operator override on `hash`.
    pub fn set_user_override(&self, hash: &CommandHash, value: Option<&str>, reason: Option<&str>) -> CommandResult<()> {
        Ok(self.db.set_user_override(hash.as_str(), value, reason, Timestamp::now().epoch_seconds())?)
    }

    /// `true` if duplicate detection is enabled for `record` and its most
    /// recent recorded timestamp is within `record.duplicate_threshold_ms`
    /// of `now` — i.e. this exact command was just run again, almost
    /// certainly by a retry rather than deliberate repetition.
    #[must_use]
    pub fn is_recent_duplicate(record: &CommandRecord, now: i64) -> bool {
        if !record.duplicate_check_enabled {
            return false;
        }
        record
            .last_100_timestamps
            .last()
            .is_some_and(|&last| (now - last) * 1000 < record.duplicate_threshold_ms)
    }

    /// Registry-wide counts, for `get_stats`.
    pub fn stats(&self) -> CommandResult<RegistryStats> {
        Ok(self.db.registry_stats()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CommandRegistry {
        CommandRegistry::new(Arc::new(CommandSecurityDb::open_in_memory().unwrap()))
    }

    #[test]
    fn get_or_create_then_get_round_trips() {
        let reg = registry();
        let hash = CommandHash::of("cargo build");
        reg.get_or_create(&hash, "cargo build", 10, RiskLevel::Low).unwrap();
        let fetched = reg.get(&hash).unwrap().unwrap();
        assert_eq!(fetched.command_text, "cargo build");
        assert_eq!(fetched.risk_level, "Low");
    }

    #[test]
    fn is_recent_duplicate_detects_back_to_back_runs() {
        let record = brainloop_storage::CommandRecord {
            hash: "h".into(),
            command_text: "ls".into(),
            last_100_timestamps: vec![100],
            first_seen_at: 100,
            last_seen_at: 100,
            duplicate_check_enabled: true,
            duplicate_threshold_ms: 2000,
            ..Default::default()
        };
        assert!(CommandRegistry::is_recent_duplicate(&record, 101));
        assert!(!CommandRegistry::is_recent_duplicate(&record, 200));
    }

    #[test]
    fn is_recent_duplicate_respects_the_disabled_flag() {
        let record = brainloop_storage::CommandRecord {
            hash: "h".into(),
            last_100_timestamps: vec![100],
            duplicate_check_enabled: false,
            duplicate_threshold_ms: 2000,
            ..Default::default()
        };
        assert!(!CommandRegistry::is_recent_duplicate(&record, 101));
    }
}
