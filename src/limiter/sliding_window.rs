use crate::clock::{Clock, SystemClock};
use crate::decision::{Cause, Decision};
use crate::dynamic::DynamicConfig;
use crate::error::{ConfigError, LimiterError};
use crate::limiter::{FailurePolicy, RateLimiter};
use crate::store::{window_millis, WindowOutcome, WindowStore};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// Store timeout applied when none is configured.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(50);
/// Prefix put in front of every subject key before it reaches the store.
pub const DEFAULT_KEY_PREFIX: &str = "floodgate:sw:";

/// Sliding-window-log limiter.
///
/// Admits at most `limit` events per key in any trailing `window`, not just in
/// calendar-aligned windows, so a subject cannot double its rate across a boundary. State
/// lives in a [`WindowStore`], which may be shared by many processes.
///
/// Every store call is bounded by a timeout. When the store errors or times out the
/// decision comes from the configured [`FailurePolicy`].
pub struct SlidingWindow<S> {
    store: Arc<S>,
    limit: DynamicConfig<u32>,
    window: Duration,
    store_timeout: Duration,
    on_failure: FailurePolicy,
    key_prefix: String,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for SlidingWindow<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            limit: self.limit.clone(),
            window: self.window,
            store_timeout: self.store_timeout,
            on_failure: self.on_failure,
            key_prefix: self.key_prefix.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<S> std::fmt::Debug for SlidingWindow<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindow")
            .field("limit", &self.limit.load())
            .field("window", &self.window)
            .field("store_timeout", &self.store_timeout)
            .field("on_failure", &self.on_failure)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl<S> SlidingWindow<S>
where
    S: WindowStore + 'static,
{
    /// Admit `limit` events per `window` for each key, recorded in `store`.
    pub fn new(store: S, limit: u32, window: Duration) -> Result<Self, ConfigError> {
        if limit == 0 {
            return Err(ConfigError::InvalidLimit(limit));
        }
        if window < Duration::from_millis(1) {
            return Err(ConfigError::InvalidWindow(window));
        }
        Ok(Self {
            store: Arc::new(store),
            limit: DynamicConfig::new(limit),
            window,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            on_failure: FailurePolicy::default(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            clock: Arc::new(SystemClock),
        })
    }

    /// Bound every store round-trip by `timeout`.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Decide what a check answers when the store cannot.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    /// Namespace store keys, e.g. per route.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.on_failure
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn decide(&self, outcome: WindowOutcome, limit: u32, now: u64) -> Decision {
        let window = window_millis(self.window);
        let reset_at = outcome.oldest_millis.map_or(now, |oldest| oldest.saturating_add(window));
        if outcome.admitted {
            // The slot that frees first only matters once the window is full.
            let reset_at = if outcome.count < limit { now } else { reset_at };
            Decision::admitted(limit, limit.saturating_sub(outcome.count), reset_at)
        } else {
            Decision::rejected(limit, reset_at.max(now), Cause::QuotaExhausted)
        }
    }

    fn degraded(&self, key: &str, limit: u32, now: u64, error: &LimiterError) -> Decision {
        warn!(
            target: "floodgate::sliding_window",
            key,
            policy = ?self.on_failure,
            error = %error,
            "window store unavailable; deciding by failure policy"
        );
        let reset_at = now.saturating_add(window_millis(self.window));
        Decision {
            allowed: self.on_failure.admits(),
            limit,
            remaining: 0,
            reset_at_millis: reset_at,
            cause: Cause::StoreUnavailable,
        }
    }
}

#[async_trait]
impl<S> RateLimiter for SlidingWindow<S>
where
    S: WindowStore + 'static,
{
    async fn check(&self, key: &str) -> Decision {
        let now = self.clock.now_millis();
        let limit = self.limit.load();
        let store_key = self.store_key(key);

        let attempt = tokio::time::timeout(
            self.store_timeout,
            self.store.record_if_below(&store_key, now, self.window, limit),
        )
        .await;

        match attempt {
            Ok(Ok(outcome)) => {
                trace!(
                    target: "floodgate::sliding_window",
                    key,
                    admitted = outcome.admitted,
                    count = outcome.count,
                    limit,
                    "window evaluated"
                );
                self.decide(outcome, limit, now)
            }
            Ok(Err(e)) => self.degraded(key, limit, now, &LimiterError::store(e)),
            Err(_) => self.degraded(
                key,
                limit,
                now,
                &LimiterError::StoreTimeout { timeout: self.store_timeout },
            ),
        }
    }

    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        let store_key = self.store_key(key);
        match tokio::time::timeout(self.store_timeout, self.store.clear(&store_key)).await {
            Ok(result) => result.map_err(LimiterError::store),
            Err(_) => Err(LimiterError::StoreTimeout { timeout: self.store_timeout }),
        }
    }

    fn limit(&self) -> u32 {
        self.limit.load()
    }

    fn set_limit(&self, limit: u32) {
        self.limit.set(limit.max(1));
    }
}
