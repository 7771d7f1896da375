//! `input.db` — the reader cache's backing store.
//!
//! The file/DB digest extractors themselves (markdown, source code,
//! embedded-SQLite readers) are out of scope; this module owns only the
//! cache they sit behind: a file-mtime-keyed digest with a TTL, plus the
//! hit/miss counters the worker lifecycle heartbeat reports.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::StorageResult;
use crate::pragma::apply_standard_pragmas;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS reader_cache (
    cache_key   TEXT PRIMARY KEY,
    file_path   TEXT NOT NULL,
    source_type TEXT NOT NULL,
    digest      TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    expires_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS reader_cache_counters (
    name  TEXT PRIMARY KEY,
    count INTEGER NOT NULL
);
";

/// A cached digest, as stored under a `(file_path, mtime)` cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedDigest {
    /// Source type the digest was produced for (`"markdown"`, `"code"`,
    /// `"sqlite"`, ...).
    pub source_type: String,
    /// The cached digest content.
    pub digest: String,
}

/// Handle onto `input.db`.
pub struct InputDb {
    conn: Connection,
}

impl InputDb {
    /// Open (creating if needed) `input.db` under `dir`.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join("input.db"))?;
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

    /// Fetch a cache entry by key, only if it has not yet expired as of
    /// `now`. An expired row is left in place; it is reaped lazily on the
    /// next [`Self::put_digest`] call rather than here.
    pub fn get_digest(&self, cache_key: &str, now: i64) -> StorageResult<Option<CachedDigest>> {
        self.conn
            .query_row(
                "SELECT source_type, digest FROM reader_cache WHERE cache_key = ?1 AND expires_at > ?2",
                params![cache_key, now],
                |row| Ok(CachedDigest { source_type: row.get(0)?, digest: row.get(1)? }),
            )
            .optional()
            .map_err(Into::into)
    }

    /// Insert or replace a cache entry, then lazily evict every row that
    /// has already expired as of `now`.
    pub fn put_digest(
        &self,
        cache_key: &str,
        file_path: &str,
        source_type: &str,
        digest: &str,
        now: i64,
        expires_at: i64,
    ) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO reader_cache (cache_key, file_path, source_type, digest, created_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(cache_key) DO UPDATE SET \
                file_path = excluded.file_path, \
                source_type = excluded.source_type, \
                digest = excluded.digest, \
                created_at = excluded.created_at, \
                expires_at = excluded.expires_at",
            params![cache_key, file_path, source_type, digest, now, expires_at],
        )?;
        self.conn.execute("DELETE FROM reader_cache WHERE expires_at <= ?1", params![now])?;
        Ok(())
    }

    /// Increment a named counter (`reader_cache_hit` / `reader_cache_miss`).
    pub fn increment_counter(&self, name: &str) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO reader_cache_counters (name, count) VALUES (?1, 1) \
             ON CONFLICT(name) DO UPDATE SET count = count + 1",
            params![name],
        )?;
        Ok(())
    }

    /// Current value of a named counter, `0` if never incremented.
    pub fn counter(&self, name: &str) -> StorageResult<i64> {
        self.conn
            .query_row("SELECT count FROM reader_cache_counters WHERE name = ?1", params![name], |row| row.get(0))
            .optional()
            .map(|value| value.unwrap_or(0))
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_and_applies_schema_without_error() {
        InputDb::open_in_memory().unwrap();
    }

    #[test]
    fn put_then_get_round_trips_before_expiry() {
        let db = InputDb::open_in_memory().unwrap();
        db.put_digest("key1", "/a.md", "markdown", "# hi", 0, 3600).unwrap();
        let entry = db.get_digest("key1", 10).unwrap().unwrap();
        assert_eq!(entry.digest, "# hi");
        assert_eq!(entry.source_type, "markdown");
    }

    #[test]
    fn get_returns_none_past_expiry() {
        let db = InputDb::open_in_memory().unwrap();
        db.put_digest("key1", "/a.md", "markdown", "# hi", 0, 100).unwrap();
        assert!(db.get_digest("key1", 100).unwrap().is_none());
    }

    #[test]
    fn put_lazily_evicts_expired_rows() {
        let db = InputDb::open_in_memory().unwrap();
        db.put_digest("stale", "/a.md", "markdown", "old", 0, 50).unwrap();
        db.put_digest("fresh", "/b.md", "markdown", "new", 100, 200).unwrap();

        assert!(db.get_digest("stale", 100).unwrap().is_none());
        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM reader_cache", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn counters_increment_independently() {
        let db = InputDb::open_in_memory().unwrap();
        db.increment_counter("reader_cache_hit").unwrap();
        db.increment_counter("reader_cache_hit").unwrap();
        db.increment_counter("reader_cache_miss").unwrap();

        assert_eq!(db.counter("reader_cache_hit").unwrap(), 2);
        assert_eq!(db.counter("reader_cache_miss").unwrap(), 1);
        assert_eq!(db.counter("reader_cache_other").unwrap(), 0);
    }
}
