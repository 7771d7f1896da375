//! `lifecycle.db` — the idempotency ledger, session block state machine
//! rows, and worker heartbeat row.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::StorageResult;
use crate::pragma::apply_standard_pragmas;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS idempotency_ledger (
    hash        TEXT PRIMARY KEY,
    operation   TEXT NOT NULL,
    result_json TEXT NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS session_blocks (
    session_id      TEXT NOT NULL,
    block_id        TEXT NOT NULL,
    block_type      TEXT NOT NULL,
    target          TEXT,
    description     TEXT NOT NULL,
    phase           TEXT NOT NULL,
    temperature     REAL NOT NULL,
    code            TEXT NOT NULL,
    status          TEXT NOT NULL,
    iterations      INTEGER NOT NULL,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL,
    last_refined_at INTEGER,
    PRIMARY KEY (session_id, block_id)
);

CREATE TABLE IF NOT EXISTS block_refinements (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id  TEXT NOT NULL,
    block_id    TEXT NOT NULL,
    feedback    TEXT NOT NULL,
    refined_at  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_block_refinements_block
    ON block_refinements (session_id, block_id);

CREATE TABLE IF NOT EXISTS worker_heartbeat (
    worker_id         TEXT PRIMARY KEY,
    pid               INTEGER NOT NULL,
    started_at        INTEGER NOT NULL,
    last_heartbeat_at INTEGER NOT NULL,
    status            TEXT NOT NULL DEFAULT 'running'
);
";

/// A single durable idempotency-ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// The idempotency key (a `CommandHash` or block-identity hash).
    pub hash: String,
    /// Which operation produced the result (`"execute_bash"`,
    /// `"commit_block"`, ...).
    pub operation: String,
    /// The stored result, as JSON.
    pub result_json: String,
    /// When this entry was first written.
    pub created_at: i64,
}

/// A row tracking one code-generation block's propose/audit/refine/commit
/// progress.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionBlockRow {
    /// Owning session.
    pub session_id: String,
    /// Block within the session.
    pub block_id: String,
    /// Block type (`"sql"`, `"go"`, `"python"`, `"code"`).
    pub block_type: String,
    /// Commit target: a file path for go/python/code blocks, `None` for
    /// sql blocks (which execute against a database instead).
    pub target: Option<String>,
    /// The description the block was proposed from.
    pub description: String,
    /// Current phase name (`"propose"`, `"audit"`, `"refine"`, `"commit"`).
    pub phase: String,
    /// Temperature the current phase ran at.
    pub temperature: f64,
    /// The block's current code content.
    pub code: String,
    /// Current status (`"pending"`, `"committed"`, `"failed"`).
    pub status: String,
    /// Number of generation passes applied so far (starts at 1 on propose,
    /// incremented on each refine and on commit).
    pub iterations: u32,
    /// Row creation time.
    pub created_at: i64,
    /// Last update time.
    pub updated_at: i64,
    /// When this block was last refined, if ever.
    pub last_refined_at: Option<i64>,
}

/// Handle onto `lifecycle.db`.
pub struct LifecycleDb {
    conn: Connection,
}

impl LifecycleDb {
    /// Open (creating if needed) `lifecycle.db` under `dir`.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join("lifecycle.db"))?;
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

    /// `true` if `hash` has already been recorded for `operation`.
    pub fn is_processed(&self, hash: &str, operation: &str) -> StorageResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM idempotency_ledger WHERE hash = ?1 AND operation = ?2",
            params![hash, operation],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Fetch a previously recorded result for `hash`/`operation`, if any.
    pub fn get_processed(&self, hash: &str, operation: &str) -> StorageResult<Option<LedgerEntry>> {
        self.conn
            .query_row(
                "SELECT hash, operation, result_json, created_at FROM idempotency_ledger \
                 WHERE hash = ?1 AND operation = ?2",
                params![hash, operation],
                |row| {
                    Ok(LedgerEntry {
                        hash: row.get(0)?,
                        operation: row.get(1)?,
                        result_json: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    /// Record that `hash`/`operation` has been processed with `result_json`.
    /// A second call with the same key is a no-op (`INSERT OR IGNORE`),
    /// preserving the first result rather than overwriting it.
    pub fn mark_processed(
        &self,
        hash: &str,
        operation: &str,
        result_json: &str,
        created_at: i64,
    ) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO idempotency_ledger (hash, operation, result_json, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![hash, operation, result_json, created_at],
        )?;
        Ok(())
    }

    /// Insert or replace a session block row.
    pub fn upsert_session_block(&self, row: &SessionBlockRow) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO session_blocks \
                (session_id, block_id, block_type, target, description, phase, temperature, \
                 code, status, iterations, created_at, updated_at, last_refined_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
             ON CONFLICT(session_id, block_id) DO UPDATE SET \
                phase = excluded.phase, \
                temperature = excluded.temperature, \
                code = excluded.code, \
                status = excluded.status, \
                iterations = excluded.iterations, \
                updated_at = excluded.updated_at, \
                last_refined_at = excluded.last_refined_at",
            params![
                row.session_id,
                row.block_id,
                row.block_type,
                row.target,
                row.description,
                row.phase,
                row.temperature,
                row.code,
                row.status,
                row.iterations,
                row.created_at,
                row.updated_at,
                row.last_refined_at,
            ],
        )?;
        Ok(())
    }

    const SESSION_BLOCK_COLUMNS: &'static str = "session_id, block_id, block_type, target, description, \
         phase, temperature, code, status, iterations, created_at, updated_at, last_refined_at";

    /// Fetch a single session block row.
    pub fn get_session_block(
        &self,
        session_id: &str,
        block_id: &str,
    ) -> StorageResult<Option<SessionBlockRow>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM session_blocks WHERE session_id = ?1 AND block_id = ?2",
                    Self::SESSION_BLOCK_COLUMNS
                ),
                params![session_id, block_id],
                Self::row_to_block,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Fetch every block belonging to `session_id`, oldest first.
    pub fn list_session_blocks(&self, session_id: &str) -> StorageResult<Vec<SessionBlockRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM session_blocks WHERE session_id = ?1 ORDER BY created_at ASC",
            Self::SESSION_BLOCK_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![session_id], Self::row_to_block)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionBlockRow> {
        Ok(SessionBlockRow {
            session_id: row.get(0)?,
            block_id: row.get(1)?,
            block_type: row.get(2)?,
            target: row.get(3)?,
            description: row.get(4)?,
            phase: row.get(5)?,
            temperature: row.get(6)?,
            code: row.get(7)?,
            status: row.get(8)?,
            iterations: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
            last_refined_at: row.get(12)?,
        })
    }

    /// Append one refinement feedback record for a block.
    pub fn record_block_refinement(
        &self,
        session_id: &str,
        block_id: &str,
        feedback: &str,
        refined_at: i64,
    ) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO block_refinements (session_id, block_id, feedback, refined_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, block_id, feedback, refined_at],
        )?;
        Ok(())
    }

    /// Fetch refinement feedback history for a block, oldest first.
    pub fn list_block_refinements(&self, session_id: &str, block_id: &str) -> StorageResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT feedback FROM block_refinements \
             WHERE session_id = ?1 AND block_id = ?2 ORDER BY refined_at ASC",
        )?;
        let rows = stmt
            .query_map(params![session_id, block_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete every block (and refinement history) belonging to a session.
    /// Used to roll back a `propose` call that failed partway through.
    pub fn delete_session(&self, session_id: &str) -> StorageResult<()> {
        self.conn.execute("DELETE FROM session_blocks WHERE session_id = ?1", params![session_id])?;
        self.conn.execute("DELETE FROM block_refinements WHERE session_id = ?1", params![session_id])?;
        Ok(())
    }

    /// Record (or refresh) this worker's heartbeat row with status
    /// `"running"`.
    pub fn record_heartbeat(
        &self,
        worker_id: &str,
        pid: i64,
        started_at: i64,
        now: i64,
    ) -> StorageResult<()> {
        self.record_heartbeat_with_status(worker_id, pid, started_at, now, "running")
    }

    /// Record (or refresh) this worker's heartbeat row with an explicit
    /// status (`"running"` or `"shutting_down"`).
    pub fn record_heartbeat_with_status(
        &self,
        worker_id: &str,
        pid: i64,
        started_at: i64,
        now: i64,
        status: &str,
    ) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO worker_heartbeat (worker_id, pid, started_at, last_heartbeat_at, status) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(worker_id) DO UPDATE SET last_heartbeat_at = excluded.last_heartbeat_at, status = excluded.status",
            params![worker_id, pid, started_at, now, status],
        )?;
        Ok(())
    }

    /// List heartbeat rows whose `last_heartbeat_at` is older than
    /// `now - stale_after_secs` — candidates for zombie reaping.
    pub fn list_stale_heartbeats(
        &self,
        now: i64,
        stale_after_secs: i64,
    ) -> StorageResult<Vec<(String, i64)>> {
        let cutoff = now - stale_after_secs;
        let mut stmt = self
            .conn
            .prepare("SELECT worker_id, pid FROM worker_heartbeat WHERE last_heartbeat_at < ?1")?;
        let rows = stmt
            .query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Remove a heartbeat row (after reaping a zombie or on clean shutdown).
    pub fn remove_heartbeat(&self, worker_id: &str) -> StorageResult<()> {
        self.conn
            .execute("DELETE FROM worker_heartbeat WHERE worker_id = ?1", params![worker_id])?;
        Ok(())
    }

    /// Count of distinct sessions with at least one block not yet
    /// `"committed"` or `"failed"`, for the heartbeat's `sessions_active`.
    pub fn count_active_sessions(&self) -> StorageResult<i64> {
        self.conn.query_row(
            "SELECT COUNT(DISTINCT session_id) FROM session_blocks \
             WHERE session_id IN ( \
                SELECT session_id FROM session_blocks \
                WHERE status NOT IN ('committed', 'failed') \
             )",
            [],
            |row| row.get(0),
        ).map_err(Into::into)
    }

    /// Count of distinct sessions whose blocks are all `"committed"`, for
    /// the heartbeat's `sessions_completed`.
    pub fn count_completed_sessions(&self) -> StorageResult<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM ( \
                SELECT session_id FROM session_blocks \
                GROUP BY session_id \
                HAVING SUM(CASE WHEN status != 'committed' THEN 1 ELSE 0 END) = 0 \
             )",
            [],
            |row| row.get(0),
        ).map_err(Into::into)
    }

    /// Force a WAL checkpoint, flushing the write-ahead log into the main
    /// database file. Called during shutdown phase 1.
    pub fn checkpoint(&self) -> StorageResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_processed_is_idempotent() {
        let db = LifecycleDb::open_in_memory().unwrap();
        db.mark_processed("h1", "execute_bash", "{\"ok\":true}", 100).unwrap();
        db.mark_processed("h1", "execute_bash", "{\"ok\":false}", 200).unwrap();

        let entry = db.get_processed("h1", "execute_bash").unwrap().unwrap();
        assert_eq!(entry.result_json, "{\"ok\":true}");
        assert_eq!(entry.created_at, 100);
        assert!(db.is_processed("h1", "execute_bash").unwrap());
        assert!(!db.is_processed("h1", "commit_block").unwrap());
    }

    #[test]
    fn session_block_upsert_updates_in_place() {
        let db = LifecycleDb::open_in_memory().unwrap();
        let mut row = SessionBlockRow {
            session_id: "s1".into(),
            block_id: "b1".into(),
            block_type: "code".into(),
            target: Some("/workspace/main.rs".into()),
            description: "write a hello world".into(),
            phase: "propose".into(),
            temperature: 0.6,
            code: "fn main() {}".into(),
            status: "pending".into(),
            iterations: 1,
            created_at: 1,
            updated_at: 1,
            last_refined_at: None,
        };
        db.upsert_session_block(&row).unwrap();
        row.phase = "commit".into();
        row.status = "committed".into();
        row.iterations = 2;
        row.updated_at = 2;
        row.last_refined_at = Some(2);
        db.upsert_session_block(&row).unwrap();

        let fetched = db.get_session_block("s1", "b1").unwrap().unwrap();
        assert_eq!(fetched.phase, "commit");
        assert_eq!(fetched.status, "committed");
        assert_eq!(fetched.iterations, 2);
        assert_eq!(fetched.created_at, 1);
        assert_eq!(fetched.last_refined_at, Some(2));
    }

    #[test]
    fn block_refinements_accumulate_in_order() {
        let db = LifecycleDb::open_in_memory().unwrap();
        db.record_block_refinement("s1", "b1", "add error handling", 10).unwrap();
        db.record_block_refinement("s1", "b1", "use a buffered reader", 20).unwrap();

        let feedback = db.list_block_refinements("s1", "b1").unwrap();
        assert_eq!(feedback, vec!["add error handling", "use a buffered reader"]);
    }

    #[test]
    fn stale_heartbeats_are_found_by_cutoff() {
        let db = LifecycleDb::open_in_memory().unwrap();
        db.record_heartbeat("w1", 123, 0, 0).unwrap();
        db.record_heartbeat("w2", 456, 0, 1_000).unwrap();

        let stale = db.list_stale_heartbeats(1_000, 500).unwrap();
        assert_eq!(stale, vec![("w1".to_string(), 123)]);
    }

    #[test]
    fn record_heartbeat_with_status_updates_status_in_place() {
        let db = LifecycleDb::open_in_memory().unwrap();
        db.record_heartbeat("w1", 1, 0, 0).unwrap();
        db.record_heartbeat_with_status("w1", 1, 0, 5, "shutting_down").unwrap();

        let status: String = db
            .conn
            .query_row("SELECT status FROM worker_heartbeat WHERE worker_id = 'w1'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(status, "shutting_down");
    }

    fn block(session_id: &str, block_id: &str, status: &str) -> SessionBlockRow {
        SessionBlockRow {
            session_id: session_id.into(),
            block_id: block_id.into(),
            block_type: "sql".into(),
            target: None,
            description: "desc".into(),
            phase: "propose".into(),
            temperature: 0.6,
            code: "SELECT 1;".into(),
            status: status.into(),
            iterations: 1,
            created_at: 1,
            updated_at: 1,
            last_refined_at: None,
        }
    }

    #[test]
    fn active_and_completed_session_counts_reflect_block_status() {
        let db = LifecycleDb::open_in_memory().unwrap();
        db.upsert_session_block(&block("active", "b1", "pending")).unwrap();
        db.upsert_session_block(&block("done", "b1", "committed")).unwrap();
        db.upsert_session_block(&block("done", "b2", "committed")).unwrap();
        db.upsert_session_block(&block("mixed", "b1", "committed")).unwrap();
        db.upsert_session_block(&block("mixed", "b2", "pending")).unwrap();

        assert_eq!(db.count_active_sessions().unwrap(), 2);
        assert_eq!(db.count_completed_sessions().unwrap(), 1);
    }
}
