//! Scheduling policy for re-queued items: a per-item exponential backoff,
//! combined with a shared token bucket that defends the upstream against a
//! thundering herd of first-time items.

use exponential_backoff::Backoff;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Computes how long an item must wait before it is (re-)queued.
///
/// Item identity is by address, so failure counts track one specific queued
/// item rather than its value.
pub struct RateLimiter {
    backoff: Backoff,
    cap: Duration,
    bucket: TokenBucket,
    failures: HashMap<usize, u32>,
}

impl RateLimiter {
    pub fn new(min: Duration, max: Duration, qps: f64, burst: f64) -> Self {
        let mut backoff = Backoff::new(u32::MAX, min, Some(max));
        // The schedule is deterministic; spread comes from the bucket.
        backoff.set_jitter(0.0);
        Self {
            backoff,
            cap: max,
            bucket: TokenBucket::new(qps, burst),
            failures: HashMap::new(),
        }
    }

    /// The wait before the item identified by `id` may run: the larger of
    /// its per-item backoff and the shared bucket's reservation delay.
    pub(crate) fn when(&mut self, id: usize) -> Duration {
        let failures = self.failures.entry(id).or_default();
        *failures += 1;
        let backoff = self.backoff.next(*failures).unwrap_or(self.cap);
        backoff.max(self.bucket.reserve())
    }

    /// Reset the item's failure history after a success.
    pub(crate) fn forget(&mut self, id: usize) {
        self.failures.remove(&id);
    }

    #[cfg(test)]
    pub(crate) fn retries(&self, id: usize) -> u32 {
        self.failures.get(&id).copied().unwrap_or_default()
    }
}

impl Default for RateLimiter {
    /// Base 5ms doubling to a 1000s cap, over a 10 qps / 100 burst bucket.
    fn default() -> Self {
        Self::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
            10.0,
            100.0,
        )
    }
}

// A token bucket in the usual shape: tokens refill continuously at `qps` up
// to `burst`, reservations may overdraw, and the debt is the wait.
struct TokenBucket {
    qps: f64,
    burst: f64,
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    fn new(qps: f64, burst: f64) -> Self {
        Self {
            qps,
            burst,
            tokens: burst,
            refilled_at: Instant::now(),
        }
    }

    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        self.refilled_at = now;

        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }
}
