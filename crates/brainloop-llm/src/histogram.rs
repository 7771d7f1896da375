//! Latency histogram: fixed millisecond buckets, persisted per one-minute
//! window in `output.db::latency_histogram`.

use std::sync::Arc;

use brainloop_storage::OutputDb;

use crate::error::LlmResult;

/// Upper bound, in milliseconds, of each histogram bucket. The last bucket
/// absorbs every sample above its bound.
pub const BUCKET_BOUNDS_MS: [u32; 7] = [10, 50, 100, 500, 1_000, 5_000, 10_000];

fn bucket_for(latency_ms: u64) -> u32 {
    BUCKET_BOUNDS_MS
        .iter()
        .copied()
        .find(|&bound| latency_ms <= u64::from(bound))
        .unwrap_or(*BUCKET_BOUNDS_MS.last().expect("non-empty"))
}

fn window_timestamp(now: i64) -> i64 {
    (now / 60) * 60
}

/// Records and queries per-operation latency distributions.
pub struct LatencyHistogram {
    db: Arc<OutputDb>,
}

impl LatencyHistogram {
    /// Wrap a shared [`OutputDb`] handle.
    #[must_use]
    pub fn new(db: Arc<OutputDb>) -> Self {
        Self { db }
    }

    /// Record one sample for `operation`, mapping `latency_ms` to its
    /// bucket and the current one-minute window.
    pub fn record(&self, operation: &str, latency_ms: u64, now: i64) -> LlmResult<()> {
        let bucket = bucket_for(latency_ms);
        self.db.record_latency_sample(operation, bucket, window_timestamp(now))?;
        Ok(())
    }

    /// The `p`-th percentile (0.0-1.0) latency for `operation` over the
    /// trailing `window_minutes` minutes, or `None` if no samples fall in
    /// that window.
    pub fn percentile(&self, operation: &str, p: f64, window_minutes: i64, now: i64) -> LlmResult<Option<f64>> {
        let since = now - window_minutes * 60;
        let buckets = self.db.latency_buckets(operation, since)?;
        let total: i64 = buckets.iter().map(|(_, count)| count).sum();
        if total == 0 {
            return Ok(None);
        }

        let target = ((p * total as f64).ceil() as i64).max(1);
        let mut cumulative = 0i64;
        let mut lower_bound = 0.0f64;
        for (bucket_ms, count) in buckets {
            let upper_bound = f64::from(bucket_ms);
            cumulative += count;
            if cumulative >= target {
                let position_in_bucket = target - (cumulative - count);
                let fraction = position_in_bucket as f64 / count as f64;
                return Ok(Some(lower_bound + fraction * (upper_bound - lower_bound)));
            }
            lower_bound = upper_bound;
        }
        Ok(Some(lower_bound))
    }

    /// Delete histogram rows older than `retention_days`, returning the
    /// count removed.
    pub fn cleanup(&self, retention_days: i64, now: i64) -> LlmResult<usize> {
        let cutoff = now - retention_days * 86_400;
        Ok(self.db.cleanup_latency_histogram(cutoff)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_for_maps_to_the_smallest_covering_bucket() {
        assert_eq!(bucket_for(5), 10);
        assert_eq!(bucket_for(10), 10);
        assert_eq!(bucket_for(11), 50);
        assert_eq!(bucket_for(499), 500);
        assert_eq!(bucket_for(1_000_000), 10_000);
    }

    #[test]
    fn percentile_is_none_with_no_samples() {
        let hist = LatencyHistogram::new(Arc::new(OutputDb::open_in_memory().unwrap()));
        assert_eq!(hist.percentile("generate", 0.95, 60, 1_000).unwrap(), None);
    }

    #[test]
    fn percentile_interpolates_within_the_matching_bucket() {
        let hist = LatencyHistogram::new(Arc::new(OutputDb::open_in_memory().unwrap()));
        for _ in 0..10 {
            hist.record("generate", 40, 1_000).unwrap();
        }
        // All ten samples land in the 50ms bucket (lower bound 10, upper 50).
        let p50 = hist.percentile("generate", 0.5, 60, 1_000).unwrap().unwrap();
        assert!(p50 > 10.0 && p50 <= 50.0);
    }

    #[test]
    fn cleanup_removes_only_rows_older_than_the_cutoff() {
        let hist = LatencyHistogram::new(Arc::new(OutputDb::open_in_memory().unwrap()));
        hist.record("generate", 20, 0).unwrap();
        hist.record("generate", 20, 10 * 86_400).unwrap();
        let removed = hist.cleanup(5, 10 * 86_400).unwrap();
        assert_eq!(removed, 1);
    }
}
