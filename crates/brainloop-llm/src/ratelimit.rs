//! Token-bucket rate limiter with consecutive-error backoff, and the
//! `retry_with_backoff` helper the generation gateway runs every call
//! through.
//!
//! Mirrors the snapshot/guard discipline of a budget tracker: all mutable
//! state lives behind one lock, acquired for the shortest possible
//! critical section, and poisoning is recovered from rather than
//! propagated.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use brainloop_config::RateLimiterConfig;

use crate::error::{LlmError, LlmResult};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    consecutive_errors: u32,
    backoff_until: Option<Instant>,
}

/// A token bucket limiting the rate of outbound generation-gateway calls,
/// with exponential backoff triggered by consecutive errors.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    max_backoff_secs: u64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Build a limiter from [`RateLimiterConfig`], starting with a full
    /// bucket and no backoff.
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_per_sec: config.refill_per_sec,
            max_backoff_secs: config.max_backoff_secs,
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
                consecutive_errors: 0,
                backoff_until: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn refill_locked(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();
    }

    /// Remaining backoff, if the limiter is currently in a backoff window.
    fn backoff_remaining_locked(state: &BucketState) -> Option<Duration> {
        state.backoff_until.and_then(|until| {
            let now = Instant::now();
            if until > now { Some(until - now) } else { None }
        })
    }

    /// Attempt to take one token immediately, without waiting.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        if Self::backoff_remaining_locked(&state).is_some() {
            return false;
        }
        self.refill_locked(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait up to `max_wait` for a token to become available.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::BackoffActive`] if a consecutive-error backoff
    /// window is active, or [`LlmError::WaitTimedOut`] if `max_wait`
    /// elapses without acquiring a token.
    pub async fn wait(&self, max_wait: Duration) -> LlmResult<()> {
        let deadline = Instant::now() + max_wait;
        loop {
            {
                let mut state = self.lock();
                if let Some(remaining) = Self::backoff_remaining_locked(&state) {
                    return Err(LlmError::BackoffActive {
                        retry_after_secs: remaining.as_secs(),
                    });
                }
                self.refill_locked(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(LlmError::WaitTimedOut);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Record a failed call: increments the consecutive-error count and
    /// opens a backoff window of `min(2^n, max_backoff_secs)` seconds.
    pub fn record_error(&self) {
        let mut state = self.lock();
        state.consecutive_errors += 1;
        let secs = 2u64.saturating_pow(state.consecutive_errors).min(self.max_backoff_secs);
        state.backoff_until = Some(Instant::now() + Duration::from_secs(secs));
    }

    /// Record a successful call: resets the consecutive-error count and
    /// clears any active backoff window.
    pub fn record_success(&self) {
        let mut state = self.lock();
        state.consecutive_errors = 0;
        state.backoff_until = None;
    }

    /// `true` if a backoff window is currently active.
    #[must_use]
    pub fn is_backing_off(&self) -> bool {
        Self::backoff_remaining_locked(&self.lock()).is_some()
    }
}

/// Run `operation` through `limiter`, retrying on failure with exponential
/// backoff bounded by `max_backoff`, up to `max_retries` additional
/// attempts beyond the first.
///
/// Records success/error into `limiter` each cycle so its own backoff
/// window tracks the same consecutive-failure signal.
pub async fn retry_with_backoff<F, Fut, T>(
    limiter: &RateLimiter,
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    wait_deadline: Duration,
    mut operation: F,
) -> LlmResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LlmResult<T>>,
{
    let mut attempt = 0u32;
    let mut backoff = initial_backoff;
    loop {
        limiter.wait(wait_deadline).await?;
        match operation().await {
            Ok(value) => {
                limiter.record_success();
                return Ok(value);
            }
            Err(err) => {
                limiter.record_error();
                attempt += 1;
                if attempt > max_retries {
                    return Err(LlmError::RetriesExhausted {
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: f64, refill_per_sec: f64) -> RateLimiterConfig {
        RateLimiterConfig {
            capacity,
            refill_per_sec,
            max_backoff_secs: 300,
        }
    }

    #[test]
    fn try_acquire_drains_the_bucket() {
        let limiter = RateLimiter::new(config(2.0, 0.0));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn wait_times_out_when_bucket_stays_empty() {
        let limiter = RateLimiter::new(config(1.0, 0.0));
        assert!(limiter.try_acquire());
        let result = limiter.wait(Duration::from_millis(120)).await;
        assert!(matches!(result, Err(LlmError::WaitTimedOut)));
    }

    #[test]
    fn record_error_opens_a_backoff_window() {
        let limiter = RateLimiter::new(config(5.0, 1.0));
        assert!(!limiter.is_backing_off());
        limiter.record_error();
        assert!(limiter.is_backing_off());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn record_success_clears_backoff() {
        let limiter = RateLimiter::new(config(5.0, 1.0));
        limiter.record_error();
        limiter.record_success();
        assert!(!limiter.is_backing_off());
    }

    #[test]
    fn backoff_window_is_capped_at_max_backoff_secs() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            capacity: 5.0,
            refill_per_sec: 1.0,
            max_backoff_secs: 10,
        });
        for _ in 0..10 {
            limiter.record_error();
        }
        let remaining = backoff_remaining(&limiter);
        assert!(remaining <= Duration::from_secs(10));
    }

    fn backoff_remaining(limiter: &RateLimiter) -> Duration {
        let state = limiter.lock();
        state
            .backoff_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn retry_with_backoff_succeeds_on_a_later_attempt() {
        let limiter = RateLimiter::new(config(5.0, 5.0));
        let mut calls = 0;
        let result = retry_with_backoff(
            &limiter,
            3,
            Duration::from_millis(1),
            Duration::from_millis(10),
            Duration::from_secs(1),
            || {
                calls += 1;
                let this_call = calls;
                async move {
                    if this_call < 2 {
                        Err(LlmError::InvalidResponse("transient".into()))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn retry_with_backoff_gives_up_after_max_retries() {
        let limiter = RateLimiter::new(config(5.0, 5.0));
        let result: LlmResult<i32> = retry_with_backoff(
            &limiter,
            2,
            Duration::from_millis(1),
            Duration::from_millis(5),
            Duration::from_secs(1),
            || async { Err(LlmError::InvalidResponse("always fails".into())) },
        )
        .await;
        assert!(matches!(result, Err(LlmError::RetriesExhausted { attempts: 3, .. })));
    }
}
