//! `command_security.db` — the command registry the policy engine promotes
//! and demotes commands against.

use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{StorageError, StorageResult};
use crate::pragma::apply_standard_pragmas;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS commands_registry (
    hash                     TEXT PRIMARY KEY,
    command_text             TEXT NOT NULL,
    risk_score               INTEGER NOT NULL,
    risk_level               TEXT NOT NULL,
    state                    TEXT NOT NULL,
    execution_count          INTEGER NOT NULL DEFAULT 0,
    success_count            INTEGER NOT NULL DEFAULT 0,
    failure_count            INTEGER NOT NULL DEFAULT 0,
    avg_duration_ms          INTEGER NOT NULL DEFAULT 0,
    min_duration_ms          INTEGER,
    max_duration_ms          INTEGER,
    total_duration_ms        INTEGER NOT NULL DEFAULT 0,
    last_100_timestamps      TEXT NOT NULL DEFAULT '',
    first_seen_at            INTEGER NOT NULL,
    last_seen_at             INTEGER NOT NULL,
    promoted_at              INTEGER,
    policy_reason            TEXT,
    policy_last_updated      INTEGER,
    user_override            TEXT,
    user_override_reason     TEXT,
    user_override_at         INTEGER,
    duplicate_threshold_ms   INTEGER NOT NULL DEFAULT 2000,
    duplicate_check_enabled  INTEGER NOT NULL DEFAULT 1,
    tags                     TEXT NOT NULL DEFAULT '[]',
    typical_exit_codes       TEXT NOT NULL DEFAULT '{}',
    common_errors            TEXT NOT NULL DEFAULT '{}'
);
";

/// Maximum number of timestamps retained in `last_100_timestamps`.
const TIMESTAMP_WINDOW: usize = 100;

/// Default minimum gap, in milliseconds, between two invocations of the
/// same command before the second is flagged as a duplicate.
pub const DEFAULT_DUPLICATE_THRESHOLD_MS: i64 = 2000;

/// One row of the command registry.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandRecord {
    /// Primary key: `CommandHash::as_str()`.
    pub hash: String,
    /// The literal command text, kept for operator inspection.
    pub command_text: String,
    /// 0-100 risk score from the validator.
    pub risk_score: u32,
    /// Risk bucket, as `RiskLevel`'s `Debug` name (`"Safe"`, `"Low"`, ...).
    pub risk_level: String,
    /// Lifecycle state, as `CommandState`'s `Debug` name.
    pub state: String,
    /// Total executions observed (successes + failures).
    pub execution_count: u32,
    /// Successful executions observed.
    pub success_count: u32,
    /// Failed executions observed.
    pub failure_count: u32,
    /// `round(total_duration_ms / execution_count)`, or 0 with no executions.
    pub avg_duration_ms: i64,
    /// Shortest observed execution, if any have run.
    pub min_duration_ms: Option<i64>,
    /// Longest observed execution, if any have run.
    pub max_duration_ms: Option<i64>,
    /// Sum of every observed execution's duration.
    pub total_duration_ms: i64,
    /// Epoch-second timestamps of the most recent (at most
    /// [`TIMESTAMP_WINDOW`]) executions, oldest first.
    pub last_100_timestamps: Vec<i64>,
    /// When this command was first observed.
    pub first_seen_at: i64,
    /// When this command was last observed.
    pub last_seen_at: i64,
    /// When this command was promoted to `AutoApproved`, if ever.
    pub promoted_at: Option<i64>,
    /// Human-readable reason for the current policy state, if the policy
    /// engine has ever set or reaffirmed one.
    pub policy_reason: Option<String>,
    /// When `policy_reason`/`state` was last updated by the policy engine.
    pub policy_last_updated: Option<i64>,
    /// Operator override, one of `always_allow` / `always_ask` / `never`,
    /// dominating every other policy signal when set.
    pub user_override: Option<String>,
    /// Why an operator set `user_override`.
    pub user_override_reason: Option<String>,
    /// When `user_override` was set.
    pub user_override_at: Option<i64>,
    /// Minimum gap, in milliseconds, between invocations before the second
    /// is flagged as a duplicate.
    pub duplicate_threshold_ms: i64,
    /// Whether duplicate detection applies to this command at all; the
    /// policy engine disables it for commands that are genuinely polling
    /// loops.
    pub duplicate_check_enabled: bool,
    /// Free-form operator classification tags.
    pub tags: Vec<String>,
    /// Exit code to observed-count map.
    pub typical_exit_codes: BTreeMap<String, i64>,
    /// Exit code (of a failing run) to observed-count map.
    pub common_errors: BTreeMap<String, i64>,
}

fn parse_timestamps(raw: &str) -> Vec<i64> {
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split(';').filter_map(|s| s.trim().parse().ok()).collect()
}

fn serialize_timestamps(timestamps: &[i64]) -> String {
    timestamps
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(";")
}

fn push_timestamp(timestamps: &mut Vec<i64>, now: i64) {
    timestamps.push(now);
    if timestamps.len() > TIMESTAMP_WINDOW {
        let drop = timestamps.len() - TIMESTAMP_WINDOW;
        timestamps.drain(0..drop);
    }
}

fn parse_tags(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn serialize_tags(tags: &[String]) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

fn parse_counts(raw: &str) -> BTreeMap<String, i64> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn serialize_counts(counts: &BTreeMap<String, i64>) -> String {
    serde_json::to_string(counts).unwrap_or_else(|_| "{}".to_string())
}

fn bump_count(counts: &mut BTreeMap<String, i64>, key: String) {
    *counts.entry(key).or_insert(0) += 1;
}

/// Handle onto `command_security.db`.
pub struct CommandSecurityDb {
    conn: Connection,
}

impl CommandSecurityDb {
    /// Open (creating if needed) `command_security.db` under `dir`.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join("command_security.db"))?;
        apply_standard_pragmas(&conn)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Open an in-memory instance, for tests.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        apply_standard_pragmas(&conn)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Fetch a registry row, if it exists.
    pub fn get(&self, hash: &str) -> StorageResult<Option<CommandRecord>> {
        self.conn
            .query_row(
                "SELECT hash, command_text, risk_score, risk_level, state, \
                        execution_count, success_count, failure_count, \
                        avg_duration_ms, min_duration_ms, max_duration_ms, total_duration_ms, \
                        last_100_timestamps, first_seen_at, last_seen_at, promoted_at, \
                        policy_reason, policy_last_updated, \
                        user_override, user_override_reason, user_override_at, \
                        duplicate_threshold_ms, duplicate_check_enabled, \
                        tags, typical_exit_codes, common_errors \
                 FROM commands_registry WHERE hash = ?1",
                params![hash],
                Self::row_to_record,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Fetch a row, inserting a fresh `New` record first if it does not
    /// exist yet.
    pub fn get_or_create(
        &self,
        hash: &str,
        command_text: &str,
        risk_score: u32,
        risk_level: &str,
        now: i64,
    ) -> StorageResult<CommandRecord> {
        self.conn.execute(
            "INSERT OR IGNORE INTO commands_registry \
                (hash, command_text, risk_score, risk_level, state, first_seen_at, last_seen_at) \
             VALUES (?1, ?2, ?3, ?4, 'New', ?5, ?5)",
            params![hash, command_text, risk_score, risk_level, now],
        )?;
        self.get(hash)?.ok_or_else(|| StorageError::NotFound(hash.to_string()))
    }

    /// Record one execution outcome: bumps the execution/success/failure
    /// counters, folds `duration_ms` into the running avg/min/max/total,
    /// appends `now` to the rolling timestamp window, tallies `exit_code`
    /// into `typical_exit_codes` (and into `common_errors` too when the run
    /// failed), and refreshes `last_seen_at`.
    pub fn record_execution(&self, hash: &str, success: bool, duration_ms: i64, exit_code: i32, now: i64) -> StorageResult<CommandRecord> {
        let mut record = self
            .get(hash)?
            .ok_or_else(|| StorageError::NotFound(hash.to_string()))?;

        record.execution_count += 1;
        if success {
            record.success_count += 1;
        } else {
            record.failure_count += 1;
        }
        record.total_duration_ms += duration_ms;
        record.avg_duration_ms = record.total_duration_ms / i64::from(record.execution_count);
        record.min_duration_ms = Some(record.min_duration_ms.map_or(duration_ms, |min| min.min(duration_ms)));
        record.max_duration_ms = Some(record.max_duration_ms.map_or(duration_ms, |max| max.max(duration_ms)));
        push_timestamp(&mut record.last_100_timestamps, now);
        record.last_seen_at = now;

        let exit_code_key = exit_code.to_string();
        bump_count(&mut record.typical_exit_codes, exit_code_key.clone());
        if !success {
            bump_count(&mut record.common_errors, exit_code_key);
        }

        self.conn.execute(
            "UPDATE commands_registry SET execution_count = ?2, success_count = ?3, failure_count = ?4, \
                avg_duration_ms = ?5, min_duration_ms = ?6, max_duration_ms = ?7, total_duration_ms = ?8, \
                last_100_timestamps = ?9, last_seen_at = ?10, typical_exit_codes = ?11, common_errors = ?12 \
             WHERE hash = ?1",
            params![
                hash,
                record.execution_count,
                record.success_count,
                record.failure_count,
                record.avg_duration_ms,
                record.min_duration_ms,
                record.max_duration_ms,
                record.total_duration_ms,
                serialize_timestamps(&record.last_100_timestamps),
                record.last_seen_at,
                serialize_counts(&record.typical_exit_codes),
                serialize_counts(&record.common_errors),
            ],
        )?;
        Ok(record)
    }

    /// Transition `hash` to `AutoApproved`, recording the promotion time and
    /// the reason the policy engine promoted it. Intended to run inside the
    /// same transaction as the policy engine's mandatory dangerous-pattern
    /// re-check.
    pub fn promote(&self, hash: &str, now: i64, reason: &str) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE commands_registry SET state = 'AutoApproved', promoted_at = ?2, \
                policy_reason = ?3, policy_last_updated = ?2 WHERE hash = ?1",
            params![hash, now, reason],
        )?;
        Ok(())
    }

    /// Transition `hash` to `Monitoring` (enough observations to consider
    /// promotion, but not yet promoted).
    pub fn set_monitoring(&self, hash: &str, now: i64) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE commands_registry SET state = 'Monitoring', policy_last_updated = ?2 WHERE hash = ?1",
            params![hash, now],
        )?;
        Ok(())
    }

    /// Permanently block `hash`; the governor will refuse it regardless of
    /// an override flag.
    pub fn block(&self, hash: &str) -> StorageResult<()> {
        self.conn
            .execute("UPDATE commands_registry SET state = 'Blocked' WHERE hash = ?1", params![hash])?;
        Ok(())
    }

    /// Disable duplicate detection for `hash` (the "genuinely a polling
    /// loop" monitoring rule).
    pub fn disable_duplicate_check(&self, hash: &str, now: i64) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE commands_registry SET duplicate_check_enabled = 0, policy_last_updated = ?2 WHERE hash = ?1",
            params![hash, now],
        )?;
        Ok(())
    }

    /// Raise the duplicate-detection window for `hash` (the "rarely
    /// repeated, so a wider gap is still suspicious" rarity rule).
    pub fn set_duplicate_threshold(&self, hash: &str, threshold_ms: i64, now: i64) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE commands_registry SET duplicate_threshold_ms = ?2, policy_last_updated = ?3 WHERE hash = ?1",
            params![hash, threshold_ms, now],
        )?;
        Ok(())
    }

    /// Set (or clear, with `None`) the operator override on `hash`. When set
    /// to `never`, the governor must refuse to launch the command regardless
    /// of any other state.
    pub fn set_user_override(&self, hash: &str, value: Option<&str>, reason: Option<&str>, now: i64) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE commands_registry SET user_override = ?2, user_override_reason = ?3, user_override_at = ?4 WHERE hash = ?1",
            params![hash, value, reason, now],
        )?;
        Ok(())
    }

    /// Force a WAL checkpoint, flushing the write-ahead log into the main
    /// database file.
    pub fn checkpoint(&self) -> StorageResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    /// Registry-wide counts, for `get_stats`.
    pub fn registry_stats(&self) -> StorageResult<RegistryStats> {
        let (total, auto_approved, blocked): (i64, i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), \
                    SUM(CASE WHEN state = 'AutoApproved' THEN 1 ELSE 0 END), \
                    SUM(CASE WHEN state = 'Blocked' THEN 1 ELSE 0 END) \
             FROM commands_registry",
            [],
            |row| Ok((row.get(0)?, row.get::<_, Option<i64>>(1)?.unwrap_or(0), row.get::<_, Option<i64>>(2)?.unwrap_or(0))),
        )?;
        Ok(RegistryStats {
            total_commands: total,
            auto_approved_commands: auto_approved,
            blocked_commands: blocked,
        })
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommandRecord> {
        let raw_timestamps: String = row.get(12)?;
        let raw_tags: String = row.get(23)?;
        let raw_typical_exit_codes: String = row.get(24)?;
        let raw_common_errors: String = row.get(25)?;
        Ok(CommandRecord {
            hash: row.get(0)?,
            command_text: row.get(1)?,
            risk_score: row.get::<_, i64>(2)? as u32,
            risk_level: row.get(3)?,
            state: row.get(4)?,
            execution_count: row.get::<_, i64>(5)? as u32,
            success_count: row.get::<_, i64>(6)? as u32,
            failure_count: row.get::<_, i64>(7)? as u32,
            avg_duration_ms: row.get(8)?,
            min_duration_ms: row.get(9)?,
            max_duration_ms: row.get(10)?,
            total_duration_ms: row.get(11)?,
            last_100_timestamps: parse_timestamps(&raw_timestamps),
            first_seen_at: row.get(13)?,
            last_seen_at: row.get(14)?,
            promoted_at: row.get(15)?,
            policy_reason: row.get(16)?,
            policy_last_updated: row.get(17)?,
            user_override: row.get(18)?,
            user_override_reason: row.get(19)?,
            user_override_at: row.get(20)?,
            duplicate_threshold_ms: row.get(21)?,
            duplicate_check_enabled: row.get::<_, i64>(22)? != 0,
            tags: parse_tags(&raw_tags),
            typical_exit_codes: parse_counts(&raw_typical_exit_codes),
            common_errors: parse_counts(&raw_common_errors),
        })
    }
}

/// Aggregate counts over the whole command registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Distinct commands ever observed.
    pub total_commands: i64,
    /// Commands currently in the `AutoApproved` state.
    pub auto_approved_commands: i64,
    /// Commands currently in the `Blocked` state.
    pub blocked_commands: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_idempotent() {
        let db = CommandSecurityDb::open_in_memory().unwrap();
        let first = db.get_or_create("h1", "ls -la", 10, "Safe", 100).unwrap();
        let second = db.get_or_create("h1", "ls -la", 99, "Critical", 200).unwrap();
        // Second call does not overwrite the original risk score/first_seen_at.
        assert_eq!(first, second);
        assert_eq!(second.risk_score, 10);
        assert_eq!(second.first_seen_at, 100);
        assert_eq!(second.duplicate_threshold_ms, DEFAULT_DUPLICATE_THRESHOLD_MS);
        assert!(second.duplicate_check_enabled);
    }

    #[test]
    fn record_execution_updates_counters_duration_and_window() {
        let db = CommandSecurityDb::open_in_memory().unwrap();
        db.get_or_create("h1", "ls -la", 10, "Safe", 1).unwrap();
        db.record_execution("h1", true, 100, 0, 2).unwrap();
        db.record_execution("h1", false, 300, 1, 3).unwrap();
        let record = db.get("h1").unwrap().unwrap();
        assert_eq!(record.execution_count, 2);
        assert_eq!(record.success_count, 1);
        assert_eq!(record.failure_count, 1);
        assert_eq!(record.last_100_timestamps, vec![2, 3]);
        assert_eq!(record.last_seen_at, 3);
        assert_eq!(record.total_duration_ms, 400);
        assert_eq!(record.avg_duration_ms, 200);
        assert_eq!(record.min_duration_ms, Some(100));
        assert_eq!(record.max_duration_ms, Some(300));
        assert_eq!(record.typical_exit_codes.get("0"), Some(&1));
        assert_eq!(record.typical_exit_codes.get("1"), Some(&1));
        assert_eq!(record.common_errors.get("1"), Some(&1));
        assert!(!record.common_errors.contains_key("0"));
    }

    #[test]
    fn timestamp_window_is_capped_at_100_entries() {
        let db = CommandSecurityDb::open_in_memory().unwrap();
        db.get_or_create("h1", "ls -la", 10, "Safe", 0).unwrap();
        for t in 1..=110 {
            db.record_execution("h1", true, 1, 0, t).unwrap();
        }
        let record = db.get("h1").unwrap().unwrap();
        assert_eq!(record.last_100_timestamps.len(), 100);
        assert_eq!(record.last_100_timestamps.first(), Some(&11));
        assert_eq!(record.last_100_timestamps.last(), Some(&110));
    }

    #[test]
    fn promote_sets_state_promoted_at_and_reason() {
        let db = CommandSecurityDb::open_in_memory().unwrap();
        db.get_or_create("h1", "cargo build", 20, "Low", 1).unwrap();
        db.promote("h1", 42, "20 clean executions, 95%+ success").unwrap();
        let record = db.get("h1").unwrap().unwrap();
        assert_eq!(record.state, "AutoApproved");
        assert_eq!(record.promoted_at, Some(42));
        assert_eq!(record.policy_reason.as_deref(), Some("20 clean executions, 95%+ success"));
    }

    #[test]
    fn user_override_never_is_recorded() {
        let db = CommandSecurityDb::open_in_memory().unwrap();
        db.get_or_create("h1", "cargo build", 20, "Low", 1).unwrap();
        db.set_user_override("h1", Some("never"), Some("operator blocked it"), 5).unwrap();
        let record = db.get("h1").unwrap().unwrap();
        assert_eq!(record.user_override.as_deref(), Some("never"));
        assert_eq!(record.user_override_reason.as_deref(), Some("operator blocked it"));
        assert_eq!(record.user_override_at, Some(5));
    }

    #[test]
    fn duplicate_check_can_be_disabled_and_threshold_raised() {
        let db = CommandSecurityDb::open_in_memory().unwrap();
        db.get_or_create("h1", "poll-status", 5, "Safe", 1).unwrap();
        db.disable_duplicate_check("h1", 10).unwrap();
        db.set_duplicate_threshold("h1", 30_000, 11).unwrap();
        let record = db.get("h1").unwrap().unwrap();
        assert!(!record.duplicate_check_enabled);
        assert_eq!(record.duplicate_threshold_ms, 30_000);
    }

    #[test]
    fn registry_stats_counts_by_state() {
        let db = CommandSecurityDb::open_in_memory().unwrap();
        db.get_or_create("h1", "ls", 5, "Safe", 1).unwrap();
        db.get_or_create("h2", "rm -rf /", 100, "Critical", 1).unwrap();
        db.promote("h1", 2, "manual test promotion").unwrap();
        db.block("h2").unwrap();
        let stats = db.registry_stats().unwrap();
        assert_eq!(stats.total_commands, 2);
        assert_eq!(stats.auto_approved_commands, 1);
        assert_eq!(stats.blocked_commands, 1);
    }
}
