//! Rate limiting primitives.
//!
//! - [`RateLimiter`]: the admission contract every limiter and wrapper implements.
//! - [`token_bucket::TokenBucket`]: in-process per-key token bucket.
//! - [`sliding_window::SlidingWindow`]: trailing-window log over a shared [`WindowStore`].
//! - [`adaptive::Adaptive`]: scales a wrapped limiter's limit from a load signal.
//! - [`circuit_breaker::CircuitBreaker`]: stops consulting a wrapped limiter after repeated
//!   rejections and probes for recovery.
//!
//! Wrappers compose: `CircuitBreaker<Adaptive<SlidingWindow<S>>>` is a valid limiter.
//!
//! [`WindowStore`]: crate::store::WindowStore

use crate::decision::Decision;
use crate::error::LimiterError;
use async_trait::async_trait;
use std::sync::Arc;

pub mod adaptive;
pub mod circuit_breaker;
pub mod sliding_window;
pub mod token_bucket;

/// What a limiter answers when its backing store cannot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "config", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "config", serde(rename_all = "snake_case"))]
pub enum FailurePolicy {
    /// Admit the operation; availability over precision.
    #[default]
    FailOpen,
    /// Reject the operation; protection over availability.
    FailClosed,
}

impl FailurePolicy {
    pub fn admits(&self) -> bool {
        matches!(self, FailurePolicy::FailOpen)
    }
}

/// Core admission interface.
///
/// `check` never fails: store trouble is folded into the returned [`Decision`] according
/// to the limiter's [`FailurePolicy`]. Only `reset` surfaces infrastructure errors, since
/// there is no safe fallback for losing a reset.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Decide whether one event attributed to `key` may proceed, consuming quota if so.
    async fn check(&self, key: &str) -> Decision;

    /// Boolean form of [`check`](RateLimiter::check).
    async fn allow(&self, key: &str) -> bool {
        self.check(key).await.is_allowed()
    }

    /// Forget everything recorded for `key`; the next check behaves as a first sighting.
    async fn reset(&self, key: &str) -> Result<(), LimiterError>;

    /// Limit currently in force.
    fn limit(&self) -> u32;

    /// Change the limit for subsequent decisions. Used by [`adaptive::Adaptive`].
    fn set_limit(&self, limit: u32);
}

#[async_trait]
impl<L> RateLimiter for Arc<L>
where
    L: RateLimiter + ?Sized,
{
    async fn check(&self, key: &str) -> Decision {
        (**self).check(key).await
    }

    async fn allow(&self, key: &str) -> bool {
        (**self).allow(key).await
    }

    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        (**self).reset(key).await
    }

    fn limit(&self) -> u32 {
        (**self).limit()
    }

    fn set_limit(&self, limit: u32) {
        (**self).set_limit(limit)
    }
}

#[async_trait]
impl<L> RateLimiter for Box<L>
where
    L: RateLimiter + ?Sized,
{
    async fn check(&self, key: &str) -> Decision {
        (**self).check(key).await
    }

    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        (**self).reset(key).await
    }

    fn limit(&self) -> u32 {
        (**self).limit()
    }

    fn set_limit(&self, limit: u32) {
        (**self).set_limit(limit)
    }
}

pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // State guarded here is updated in single synchronous steps, so a panic elsewhere
    // cannot leave it half-written.
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
