//! `metadata.db` — durable security-event log.

use std::path::Path;

use rusqlite::{Connection, params};

use crate::error::StorageResult;
use crate::pragma::apply_standard_pragmas;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS telemetry_events (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    hash            TEXT NOT NULL,
    matched_pattern TEXT NOT NULL,
    source          TEXT NOT NULL,
    occurred_at     INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_telemetry_events_occurred_at
    ON telemetry_events (occurred_at);

CREATE TABLE IF NOT EXISTS worker_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type  TEXT NOT NULL,
    description TEXT NOT NULL,
    occurred_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_worker_events_type
    ON worker_events (event_type);
";

/// Handle onto `metadata.db`.
pub struct MetadataDb {
    conn: Connection,
}

impl MetadataDb {
    /// Open (creating if needed) `metadata.db` under `dir`.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join("metadata.db"))?;
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

    /// Persist a security event emitted by the validator or policy engine.
    pub fn record_security_event(
        &self,
        hash: &str,
        matched_pattern: &str,
        source: &str,
        occurred_at: i64,
    ) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO telemetry_events (hash, matched_pattern, source, occurred_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![hash, matched_pattern, source, occurred_at],
        )?;
        Ok(())
    }

    /// Force a WAL checkpoint, flushing the write-ahead log into the main
    /// database file.
    pub fn checkpoint(&self) -> StorageResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    /// Count of security events recorded, for `get_stats`.
    pub fn count_security_events(&self) -> StorageResult<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM telemetry_events", [], |row| row.get(0))
            .map_err(Into::into)
    }

    /// Record a worker-lifecycle or policy-engine event (`"policy_promoted"`,
    /// `"shutdown"`, ...).
    pub fn record_worker_event(&self, event_type: &str, description: &str, occurred_at: i64) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO worker_events (event_type, description, occurred_at) VALUES (?1, ?2, ?3)",
            params![event_type, description, occurred_at],
        )?;
        Ok(())
    }

    /// Count of worker events recorded with the given `event_type`.
    pub fn count_worker_events(&self, event_type: &str) -> StorageResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM worker_events WHERE event_type = ?1",
                params![event_type],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_counts_security_events() {
        let db = MetadataDb::open_in_memory().unwrap();
        db.record_security_event("h1", "rm -rf", "validator", 10).unwrap();
        db.record_security_event("h2", "curl | sh", "validator", 20).unwrap();
        assert_eq!(db.count_security_events().unwrap(), 2);
    }

    #[test]
    fn records_and_counts_worker_events_by_type() {
        let db = MetadataDb::open_in_memory().unwrap();
        db.record_worker_event("policy_promoted", "ls -la promoted", 10).unwrap();
        db.record_worker_event("shutdown", "worker w1 shutting down", 20).unwrap();
        db.record_worker_event("policy_promoted", "echo hi promoted", 30).unwrap();

        assert_eq!(db.count_worker_events("policy_promoted").unwrap(), 2);
        assert_eq!(db.count_worker_events("shutdown").unwrap(), 1);
        assert_eq!(db.count_worker_events("unknown").unwrap(), 0);
    }
}
