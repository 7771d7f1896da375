//! Standard PRAGMA tuning applied to every one of the five SQLite
//! databases.

use rusqlite::Connection;

use crate::error::StorageResult;

/// Apply the worker's standard pragma set to a freshly opened connection:
/// WAL journaling, relaxed-but-durable synchronous mode, foreign keys on,
/// a busy timeout so concurrent readers/writers back off instead of
/// erroring immediately, and a larger page cache than SQLite's default.
pub fn apply_standard_pragmas(conn: &Connection) -> StorageResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 5_000)?;
    conn.pragma_update(None, "cache_size", -64_000)?;
    Ok(())
}
