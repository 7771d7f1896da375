//! Reader cache: a file-mtime-keyed digest cache sitting in front of the
//! (out-of-scope) markdown/source/embedded-SQLite extractors.
//!
//! The extractors themselves are never implemented here; this module only
//! owns the cache contract described in §4.10: `get`/`put` keyed by
//! `SHA-256(file_path ‖ file_mtime_unix)`, a default 3600 s TTL, and the
//! hit/miss counters the worker lifecycle heartbeat reports.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use brainloop_core::CommandHash;
use brainloop_storage::InputDb;

use crate::error::{DaemonError, DaemonResult};

/// Default cache entry lifetime.
pub const DEFAULT_TTL_SECS: i64 = 3600;

const COUNTER_HIT: &str = "reader_cache_hit";
const COUNTER_MISS: &str = "reader_cache_miss";

/// Thin wrapper over [`InputDb`] implementing the reader cache contract.
pub struct ReaderCache {
    db: Arc<InputDb>,
}

impl ReaderCache {
    /// Wrap a shared [`InputDb`] handle.
    #[must_use]
    pub fn new(db: Arc<InputDb>) -> Self {
        Self { db }
    }

    /// Look up the cached digest for `file_path`, using its current mtime
    /// as part of the cache key so a modified file always misses.
    pub fn get(&self, file_path: &Path, now: i64) -> DaemonResult<Option<String>> {
        let mtime = file_mtime_unix(file_path)?;
        let key = cache_key(file_path, mtime);
        let hit = self.db.get_digest(key.as_str(), now)?;
        if let Some(entry) = hit {
            self.db.increment_counter(COUNTER_HIT)?;
            Ok(Some(entry.digest))
        } else {
            self.db.increment_counter(COUNTER_MISS)?;
            Ok(None)
        }
    }

    /// Store a digest for `file_path`, keyed on its current mtime, expiring
    /// after `ttl_secs` from `now`.
    pub fn put(&self, file_path: &Path, source_type: &str, digest: &str, ttl_secs: i64, now: i64) -> DaemonResult<()> {
        let mtime = file_mtime_unix(file_path)?;
        let key = cache_key(file_path, mtime);
        self.db.put_digest(
            key.as_str(),
            &file_path.to_string_lossy(),
            source_type,
            digest,
            now,
            now + ttl_secs,
        )?;
        Ok(())
    }

    /// Hit rate over all cache lookups ever made, for `get_stats` and the
    /// worker heartbeat. `0.0` if no lookups have occurred yet.
    pub fn hit_rate(&self) -> DaemonResult<f64> {
        let hits = self.db.counter(COUNTER_HIT)?;
        let misses = self.db.counter(COUNTER_MISS)?;
        let total = hits + misses;
        if total == 0 {
            Ok(0.0)
        } else {
            #[allow(clippy::cast_precision_loss)]
            Ok(hits as f64 / total as f64)
        }
    }
}

fn file_mtime_unix(path: &Path) -> DaemonResult<i64> {
    let metadata = std::fs::metadata(path)?;
    let mtime = metadata
        .modified()
        .map_err(DaemonError::Io)?
        .duration_since(UNIX_EPOCH)
        .map_err(|e| DaemonError::Lock(format!("file mtime predates the unix epoch: {e}")))?
        .as_secs();
    Ok(i64::try_from(mtime).unwrap_or(i64::MAX))
}

fn cache_key(file_path: &Path, mtime_unix: i64) -> CommandHash {
    CommandHash::of_fields(&[&file_path.to_string_lossy(), &mtime_unix.to_string()])
}
