use crate::clock::{Clock, SystemClock};
use crate::decision::{Cause, Decision};
use crate::dynamic::DynamicConfig;
use crate::error::{ConfigError, LimiterError};
use crate::limiter::{lock, RateLimiter};
use crate::sweeper::Sweep;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
struct BucketParams {
    capacity: f64,
    refill_per_sec: f64,
}

impl BucketParams {
    /// Resize to `capacity`, keeping the time to refill an empty bucket unchanged.
    fn resized(&self, capacity: u32) -> Self {
        let capacity = f64::from(capacity.max(1));
        let ratio = capacity / self.capacity;
        Self { capacity, refill_per_sec: self.refill_per_sec * ratio }
    }

    fn millis_until(&self, tokens: f64, wanted: f64) -> u64 {
        if tokens >= wanted {
            return 0;
        }
        ((wanted - tokens) / self.refill_per_sec * 1_000.0).ceil() as u64
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill_millis: u64,
}

/// Per-key token bucket held in process memory.
///
/// Each key gets `burst` tokens on first sight and regains `refill_per_sec` tokens per
/// second up to `burst`. Clones share buckets.
#[derive(Clone)]
pub struct TokenBucket {
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
    params: DynamicConfig<BucketParams>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let params = self.params.load();
        f.debug_struct("TokenBucket")
            .field("capacity", &params.capacity)
            .field("refill_per_sec", &params.refill_per_sec)
            .field("keys", &self.len())
            .finish()
    }
}

impl TokenBucket {
    /// Create a bucket family refilling at `refill_per_sec` with room for `burst` tokens.
    ///
    /// # Examples
    /// ```
    /// use floodgate::limiter::token_bucket::TokenBucket;
    /// let limiter = TokenBucket::new(10.0, 20).unwrap();
    /// ```
    pub fn new(refill_per_sec: f64, burst: u32) -> Result<Self, ConfigError> {
        if !refill_per_sec.is_finite() || refill_per_sec <= 0.0 {
            return Err(ConfigError::InvalidRate(refill_per_sec));
        }
        if burst == 0 {
            return Err(ConfigError::InvalidBurst(burst));
        }
        Ok(Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            params: DynamicConfig::new(BucketParams {
                capacity: f64::from(burst),
                refill_per_sec,
            }),
            clock: Arc::new(SystemClock),
        })
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.params.load().refill_per_sec
    }

    /// Number of keys with live buckets.
    pub fn len(&self) -> usize {
        lock(&self.buckets).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop buckets nobody has touched for `max_idle`; returns how many were removed.
    ///
    /// A bucket idle long enough to refill completely is indistinguishable from a fresh one,
    /// so any `max_idle` at or above the full-refill time loses nothing.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let now = self.clock.now_millis();
        let max_idle = u64::try_from(max_idle.as_millis()).unwrap_or(u64::MAX);
        let mut buckets = lock(&self.buckets);
        let before = buckets.len();
        buckets.retain(|_, b| now.saturating_sub(b.last_refill_millis) < max_idle);
        before - buckets.len()
    }

    /// Time for an empty bucket to fill up.
    pub fn full_refill_time(&self) -> Duration {
        let params = self.params.load();
        Duration::try_from_secs_f64(params.capacity / params.refill_per_sec).unwrap_or(Duration::MAX)
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    async fn check(&self, key: &str) -> Decision {
        let now = self.clock.now_millis();
        let params = self.params.load();
        let limit = params.capacity as u32;

        let (admitted, tokens) = {
            let mut buckets = lock(&self.buckets);
            let bucket = buckets
                .entry(key.to_string())
                .or_insert(Bucket { tokens: params.capacity, last_refill_millis: now });

            let elapsed_secs = now.saturating_sub(bucket.last_refill_millis) as f64 / 1_000.0;
            bucket.tokens = (bucket.tokens + elapsed_secs * params.refill_per_sec)
                .min(params.capacity);
            bucket.last_refill_millis = now;

            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                (true, bucket.tokens)
            } else {
                (false, bucket.tokens)
            }
        };

        if admitted {
            let reset_at = now + params.millis_until(tokens, 1.0);
            Decision::admitted(limit, tokens.floor() as u32, reset_at)
        } else {
            let reset_at = now + params.millis_until(tokens, 1.0);
            tracing::trace!(target: "floodgate::token_bucket", key, tokens, "bucket empty");
            Decision::rejected(limit, reset_at, Cause::QuotaExhausted)
        }
    }

    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        lock(&self.buckets).remove(key);
        Ok(())
    }

    fn limit(&self) -> u32 {
        self.params.load().capacity as u32
    }

    fn set_limit(&self, limit: u32) {
        self.params.update(|p| p.resized(limit));
    }
}

impl Sweep for TokenBucket {
    fn sweep(&self) -> usize {
        self.sweep_idle(self.full_refill_time().saturating_mul(4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn bucket(rate: f64, burst: u32) -> (TokenBucket, ManualClock) {
        let clock = ManualClock::starting_at(1_000_000);
        let limiter = TokenBucket::new(rate, burst).unwrap().with_clock(clock.clone());
        (limiter, clock)
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert_eq!(TokenBucket::new(0.0, 1).unwrap_err(), ConfigError::InvalidRate(0.0));
        assert!(matches!(TokenBucket::new(f64::NAN, 1), Err(ConfigError::InvalidRate(_))));
        assert_eq!(TokenBucket::new(1.0, 0).unwrap_err(), ConfigError::InvalidBurst(0));
    }

    #[tokio::test]
    async fn burst_then_reject_then_refill() {
        let (limiter, clock) = bucket(1.0, 3);

        for _ in 0..3 {
            assert!(limiter.allow("k").await);
        }
        let denied = limiter.check("k").await;
        assert!(!denied.allowed);
        assert_eq!(denied.cause, Cause::QuotaExhausted);
        assert_eq!(denied.reset_at_millis, clock.now_millis() + 1_000);

        clock.advance(Duration::from_secs(1));
        assert!(limiter.allow("k").await);
        assert!(!limiter.allow("k").await);
    }

    #[tokio::test]
    async fn refills_to_capacity_after_full_refill_time() {
        let (limiter, clock) = bucket(2.0, 4);
        for _ in 0..4 {
            limiter.allow("k").await;
        }
        assert!(!limiter.allow("k").await);

        clock.advance(limiter.full_refill_time());
        for i in 0..4 {
            assert!(limiter.allow("k").await, "call {i} should be admitted");
        }
        assert!(!limiter.allow("k").await);
    }

    #[tokio::test]
    async fn idle_time_never_overfills() {
        let (limiter, clock) = bucket(10.0, 2);
        limiter.allow("k").await;
        clock.advance(Duration::from_secs(3600));
        let first = limiter.check("k").await;
        assert_eq!(first.remaining, 1);
        assert!(limiter.allow("k").await);
        assert!(!limiter.allow("k").await);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let (limiter, _clock) = bucket(1.0, 1);
        assert!(limiter.allow("a").await);
        assert!(!limiter.allow("a").await);
        assert!(limiter.allow("b").await);
    }

    #[tokio::test]
    async fn reset_restores_full_capacity() {
        let (limiter, _clock) = bucket(0.5, 2);
        assert!(limiter.allow("k").await);
        assert!(limiter.allow("k").await);
        assert!(!limiter.allow("k").await);

        limiter.reset("k").await.unwrap();
        assert!(limiter.is_empty());
        let fresh = limiter.check("k").await;
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 1);
    }

    #[tokio::test]
    async fn set_limit_scales_rate_and_clamps_tokens() {
        let (limiter, clock) = bucket(10.0, 10);
        assert!(limiter.allow("k").await);

        limiter.set_limit(5);
        assert_eq!(limiter.limit(), 5);
        assert!((limiter.refill_per_sec() - 5.0).abs() < f64::EPSILON);

        // 9 tokens left from the old capacity are clamped to 5 on the next refill.
        let d = limiter.check("k").await;
        assert_eq!(d.limit, 5);
        assert_eq!(d.remaining, 4);

        clock.advance(Duration::from_millis(200));
        let d = limiter.check("k").await;
        assert_eq!(d.remaining, 4);
    }

    #[tokio::test]
    async fn sweep_drops_only_idle_buckets() {
        let (limiter, clock) = bucket(1.0, 1);
        limiter.allow("old").await;
        clock.advance(Duration::from_secs(10));
        limiter.allow("new").await;

        assert_eq!(limiter.sweep_idle(Duration::from_secs(5)), 1);
        assert_eq!(limiter.len(), 1);
        assert!(!limiter.allow("new").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_overdraw() {
        for _ in 0..20 {
            let (limiter, _clock) = bucket(0.001, 7);
            let handles: Vec<_> = (0..50)
                .map(|_| {
                    let limiter = limiter.clone();
                    tokio::spawn(async move { limiter.allow("shared").await })
                })
                .collect();
            let admitted = futures::future::join_all(handles)
                .await
                .into_iter()
                .filter(|r| *r.as_ref().unwrap())
                .count();
            assert_eq!(admitted, 7);
        }
    }
}
