//! `output.db` — artifacts produced by `generate_file`/`generate_sql`, and
//! generation-gateway telemetry.

use std::path::Path;

use rusqlite::{Connection, params};

use crate::error::StorageResult;
use crate::pragma::apply_standard_pragmas;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS generated_files (
    session_id   TEXT NOT NULL,
    block_id     TEXT NOT NULL,
    path         TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    written_at   INTEGER NOT NULL,
    PRIMARY KEY (session_id, block_id)
);

CREATE TABLE IF NOT EXISTS sql_executions (
    session_id      TEXT NOT NULL,
    block_id        TEXT NOT NULL,
    statement_hash  TEXT NOT NULL,
    rows_affected   INTEGER NOT NULL,
    executed_at     INTEGER NOT NULL,
    PRIMARY KEY (session_id, block_id)
);

CREATE TABLE IF NOT EXISTS telemetry_llm_metrics (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp         INTEGER NOT NULL,
    provider          TEXT NOT NULL,
    model             TEXT NOT NULL,
    prompt_tokens     INTEGER NOT NULL,
    completion_tokens INTEGER NOT NULL,
    latency_ms        INTEGER NOT NULL,
    session_id        TEXT
);

CREATE INDEX IF NOT EXISTS idx_telemetry_llm_metrics_timestamp
    ON telemetry_llm_metrics (timestamp);

CREATE TABLE IF NOT EXISTS latency_histogram (
    operation  TEXT NOT NULL,
    bucket_ms  INTEGER NOT NULL,
    count      INTEGER NOT NULL,
    timestamp  INTEGER NOT NULL,
    PRIMARY KEY (operation, bucket_ms, timestamp)
);
";

/// One row recorded per generation-gateway completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmMetricRow {
    /// When the call completed.
    pub timestamp: i64,
    /// Provider name (`"anthropic"`, `"cerebras"`, ...).
    pub provider: String,
    /// Model identifier used for the call.
    pub model: String,
    /// Tokens in the prompt.
    pub prompt_tokens: u32,
    /// Tokens in the completion.
    pub completion_tokens: u32,
    /// Round-trip latency.
    pub latency_ms: u64,
    /// Owning session, if the call was made on behalf of one.
    pub session_id: Option<String>,
}

/// Handle onto `output.db`.
pub struct OutputDb {
    conn: Connection,
}

impl OutputDb {
    /// Open (creating if needed) `output.db` under `dir`.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join("output.db"))?;
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

    /// Record that a `generate_file` block wrote `path`.
    pub fn record_generated_file(
        &self,
        session_id: &str,
        block_id: &str,
        path: &str,
        content_hash: &str,
        written_at: i64,
    ) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO generated_files (session_id, block_id, path, content_hash, written_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(session_id, block_id) DO UPDATE SET \
                path = excluded.path, content_hash = excluded.content_hash, written_at = excluded.written_at",
            params![session_id, block_id, path, content_hash, written_at],
        )?;
        Ok(())
    }

    /// Record that a `generate_sql` block executed a statement.
    pub fn record_sql_execution(
        &self,
        session_id: &str,
        block_id: &str,
        statement_hash: &str,
        rows_affected: i64,
        executed_at: i64,
    ) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO sql_executions (session_id, block_id, statement_hash, rows_affected, executed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(session_id, block_id) DO UPDATE SET \
                statement_hash = excluded.statement_hash, \
                rows_affected = excluded.rows_affected, \
                executed_at = excluded.executed_at",
            params![session_id, block_id, statement_hash, rows_affected, executed_at],
        )?;
        Ok(())
    }

    /// Record one generation-gateway call.
    pub fn record_llm_metric(&self, row: &LlmMetricRow) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO telemetry_llm_metrics \
                (timestamp, provider, model, prompt_tokens, completion_tokens, latency_ms, session_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.timestamp,
                row.provider,
                row.model,
                row.prompt_tokens,
                row.completion_tokens,
                row.latency_ms,
                row.session_id,
            ],
        )?;
        Ok(())
    }

    /// Force a WAL checkpoint, flushing the write-ahead log into the main
    /// database file.
    pub fn checkpoint(&self) -> StorageResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    /// Total prompt + completion tokens recorded across all calls, for
    /// `get_stats`.
    pub fn total_tokens(&self) -> StorageResult<(i64, i64)> {
        self.conn
            .query_row(
                "SELECT COALESCE(SUM(prompt_tokens), 0), COALESCE(SUM(completion_tokens), 0) \
                 FROM telemetry_llm_metrics",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(Into::into)
    }

    /// Increment the sample count for `(operation, bucket_ms, window_timestamp)`.
    pub fn record_latency_sample(&self, operation: &str, bucket_ms: u32, window_timestamp: i64) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO latency_histogram (operation, bucket_ms, count, timestamp) \
             VALUES (?1, ?2, 1, ?3) \
             ON CONFLICT(operation, bucket_ms, timestamp) DO UPDATE SET count = count + 1",
            params![operation, bucket_ms, window_timestamp],
        )?;
        Ok(())
    }

    /// Per-bucket sample counts for `operation` over the trailing window,
    /// ordered by ascending `bucket_ms`.
    pub fn latency_buckets(&self, operation: &str, since: i64) -> StorageResult<Vec<(u32, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT bucket_ms, SUM(count) FROM latency_histogram \
             WHERE operation = ?1 AND timestamp >= ?2 \
             GROUP BY bucket_ms ORDER BY bucket_ms ASC",
        )?;
        let rows = stmt
            .query_map(params![operation, since], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete histogram rows older than `cutoff`, returning the count removed.
    pub fn cleanup_latency_histogram(&self, cutoff: i64) -> StorageResult<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM latency_histogram WHERE timestamp < ?1", params![cutoff])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_overwrites_generated_file_row() {
        let db = OutputDb::open_in_memory().unwrap();
        db.record_generated_file("s1", "b1", "/workspace/a.go", "hash1", 10).unwrap();
        db.record_generated_file("s1", "b1", "/workspace/a.go", "hash2", 20).unwrap();

        let hash: String = db
            .conn
            .query_row("SELECT content_hash FROM generated_files WHERE session_id='s1'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(hash, "hash2");
    }

    #[test]
    fn total_tokens_sums_across_rows() {
        let db = OutputDb::open_in_memory().unwrap();
        db.record_llm_metric(&LlmMetricRow {
            timestamp: 1,
            provider: "anthropic".into(),
            model: "claude".into(),
            prompt_tokens: 100,
            completion_tokens: 50,
            latency_ms: 200,
            session_id: None,
        })
        .unwrap();
        db.record_llm_metric(&LlmMetricRow {
            timestamp: 2,
            provider: "anthropic".into(),
            model: "claude".into(),
            prompt_tokens: 10,
            completion_tokens: 5,
            latency_ms: 50,
            session_id: Some("s1".into()),
        })
        .unwrap();

        assert_eq!(db.total_tokens().unwrap(), (110, 55));
    }

    #[test]
    fn latency_samples_accumulate_per_bucket_per_window() {
        let db = OutputDb::open_in_memory().unwrap();
        db.record_latency_sample("generate", 100, 60).unwrap();
        db.record_latency_sample("generate", 100, 60).unwrap();
        db.record_latency_sample("generate", 500, 60).unwrap();
        db.record_latency_sample("generate", 100, 120).unwrap();

        let buckets = db.latency_buckets("generate", 0).unwrap();
        assert_eq!(buckets, vec![(100, 3), (500, 1)]);
    }

    #[test]
    fn cleanup_latency_histogram_removes_rows_before_cutoff() {
        let db = OutputDb::open_in_memory().unwrap();
        db.record_latency_sample("generate", 100, 60).unwrap();
        db.record_latency_sample("generate", 100, 6_000_000).unwrap();

        let removed = db.cleanup_latency_histogram(1_000_000).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(db.latency_buckets("generate", 0).unwrap(), vec![(100, 1)]);
    }
}
