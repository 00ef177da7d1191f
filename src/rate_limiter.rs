//! Per-identity, per-lane token bucket rate limiter.
//!
//! Each `(api_key_id, lane)` pair owns an independent bucket:
//! - Capacity is `rate_limit_per_minute` tokens
//! - Tokens refill at `rate_limit_per_minute / 60` per second
//! - Each admitted request consumes one token
//! - An empty bucket rejects immediately; the caller never waits here
//!
//! Buckets are created lazily and dropped by [`RateLimiter::sweep_idle`]
//! once untouched for the configured idle period, so key churn cannot grow
//! the map without bound.

use crate::lane::Lane;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Bucket
// ============================================================================

/// Identity of one bucket. Lanes never share a bucket, even for one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// Upstream API key identifier
    pub api_key_id: String,
    /// Lane the request was classified into
    pub lane: Lane,
}

struct Bucket {
    /// Current number of tokens
    tokens: f64,
    /// Maximum tokens (bucket capacity)
    max_tokens: f64,
    /// Tokens added per second
    refill_rate: f64,
    /// Last time tokens were refilled
    last_refill: Instant,
}

impl Bucket {
    fn new(rate_per_minute: u32, now: Instant) -> Self {
        let capacity = f64::from(rate_per_minute);
        Self {
            tokens: capacity, // Start with full bucket
            max_tokens: capacity,
            refill_rate: capacity / 60.0,
            last_refill: now,
        }
    }

    /// Follow a config reload without resetting the current balance.
    fn resize(&mut self, rate_per_minute: u32) {
        let capacity = f64::from(rate_per_minute);
        if (capacity - self.max_tokens).abs() > f64::EPSILON {
            self.max_tokens = capacity;
            self.refill_rate = capacity / 60.0;
            self.tokens = self.tokens.min(capacity);
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens += elapsed.as_secs_f64() * self.refill_rate;
        self.tokens = self.tokens.min(self.max_tokens);
        self.last_refill = now;
    }

    /// Take one token, or report how long until one is available.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }

        let deficit = 1.0 - self.tokens;
        Err(Duration::from_secs_f64(deficit / self.refill_rate))
    }
}

// ============================================================================
// Rate Limiter
// ============================================================================

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// A token was consumed.
    Allowed,
    /// Bucket is empty.
    Denied {
        /// Time until the next token, derived from the refill rate
        retry_after: Duration,
    },
}

impl RateDecision {
    /// Returns `true` if the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

/// Sharded map of token buckets.
///
/// Locking is per shard of the underlying [`DashMap`]; unrelated keys do not
/// serialize on one lock.
pub struct RateLimiter {
    buckets: DashMap<BucketKey, Bucket>,
    idle_ttl: Duration,
}

impl RateLimiter {
    /// Create a limiter that forgets buckets idle for longer than `idle_ttl`.
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            idle_ttl,
        }
    }

    /// Try to consume one token from the `(api_key_id, lane)` bucket.
    pub fn check(&self, api_key_id: &str, lane: Lane, rate_per_minute: u32) -> RateDecision {
        let now = Instant::now();
        let key = BucketKey {
            api_key_id: api_key_id.to_string(),
            lane,
        };

        let mut bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| Bucket::new(rate_per_minute, now));
        bucket.resize(rate_per_minute);

        match bucket.try_take(now) {
            Ok(()) => RateDecision::Allowed,
            Err(retry_after) => RateDecision::Denied { retry_after },
        }
    }

    /// Boolean form of [`RateLimiter::check`].
    pub fn allow(&self, api_key_id: &str, lane: Lane, rate_per_minute: u32) -> bool {
        self.check(api_key_id, lane, rate_per_minute).is_allowed()
    }

    /// Drop buckets untouched for longer than the idle period.
    ///
    /// Returns the number of buckets removed.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < self.idle_ttl);
        before.saturating_sub(self.buckets.len())
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Duration::from_secs(600))
    }

    /// Tests that the limiter allows a burst up to the per-minute capacity.
    #[tokio::test(start_paused = true)]
    async fn test_allows_burst_up_to_capacity() {
        let limiter = limiter();

        for _ in 0..30 {
            assert!(limiter.allow("key", Lane::Free, 30));
        }
        assert!(!limiter.allow("key", Lane::Free, 30));
    }

    /// Tests that the retry hint is computed from the deficit, not a constant.
    #[tokio::test(start_paused = true)]
    async fn test_retry_after_tracks_refill_rate() {
        let limiter = limiter();

        // 60/min = one token per second.
        for _ in 0..60 {
            limiter.check("key", Lane::Priority, 60);
        }
        let RateDecision::Denied { retry_after } = limiter.check("key", Lane::Priority, 60) else {
            panic!("bucket should be empty");
        };
        assert!(retry_after <= Duration::from_secs(1));
        assert!(retry_after > Duration::from_millis(900));

        // Half a token later, the hint halves.
        tokio::time::advance(Duration::from_millis(500)).await;
        let RateDecision::Denied { retry_after } = limiter.check("key", Lane::Priority, 60) else {
            panic!("bucket should still be empty");
        };
        assert!(retry_after <= Duration::from_millis(500));
    }

    /// Tests token refill over time.
    #[tokio::test(start_paused = true)]
    async fn test_token_refill() {
        let limiter = limiter();

        for _ in 0..120 {
            limiter.check("key", Lane::Priority, 120);
        }
        assert!(!limiter.allow("key", Lane::Priority, 120));

        // 120/min = 2 tokens per second.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.allow("key", Lane::Priority, 120));
        assert!(limiter.allow("key", Lane::Priority, 120));
        assert!(!limiter.allow("key", Lane::Priority, 120));
    }

    /// Tests that identities and lanes never share a bucket.
    #[tokio::test(start_paused = true)]
    async fn test_buckets_isolated_by_key_and_lane() {
        let limiter = limiter();

        assert!(limiter.allow("alice", Lane::Free, 1));
        assert!(!limiter.allow("alice", Lane::Free, 1));

        // Same key, other lane.
        assert!(limiter.allow("alice", Lane::Priority, 1));
        // Other key, same lane.
        assert!(limiter.allow("bob", Lane::Free, 1));

        assert_eq!(limiter.bucket_count(), 3);
    }

    /// Tests idle buckets are garbage-collected.
    #[tokio::test(start_paused = true)]
    async fn test_sweep_idle_buckets() {
        let limiter = RateLimiter::new(Duration::from_secs(60));

        limiter.allow("stale", Lane::Free, 10);
        tokio::time::advance(Duration::from_secs(45)).await;
        limiter.allow("fresh", Lane::Free, 10);
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(limiter.sweep_idle(), 1);
        assert_eq!(limiter.bucket_count(), 1);
    }

    /// Tests a lowered limit clamps the existing balance.
    #[tokio::test(start_paused = true)]
    async fn test_resize_clamps_tokens() {
        let limiter = limiter();

        assert!(limiter.allow("key", Lane::Priority, 120));
        // Reload drops the limit to 2/min: at most 2 tokens remain.
        assert!(limiter.allow("key", Lane::Priority, 2));
        assert!(limiter.allow("key", Lane::Priority, 2));
        assert!(!limiter.allow("key", Lane::Priority, 2));
    }
}
