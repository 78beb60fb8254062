//! Shared storage for sliding-window event logs.
//!
//! A [`WindowStore`] owns, per key, an ordered log of event timestamps. The
//! [`SlidingWindow`](crate::limiter::sliding_window::SlidingWindow) limiter performs a
//! whole decision with one [`record_if_below`](WindowStore::record_if_below) call, so the
//! prune, count, and insert steps cannot interleave with another caller's. Backends must
//! keep that unit atomic: a count followed by a separate insert lets two callers both see
//! the last free slot.

use async_trait::async_trait;
use std::time::Duration;

mod memory;

pub use memory::InMemoryWindowStore;

/// Result of one atomic window evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Whether a new timestamp was recorded.
    pub admitted: bool,
    /// Live entries after the evaluation, including the one just recorded.
    pub count: u32,
    /// Oldest live timestamp, if any; the window frees a slot when it expires.
    pub oldest_millis: Option<u64>,
}

/// Storage backend for sliding-window logs.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Atomically evaluate the window for `key` at `now_millis`:
    ///
    /// 1. drop entries with timestamp `<= now_millis - window`;
    /// 2. count what is left;
    /// 3. if the count is below `limit`, record `now_millis` and extend the key's expiry to
    ///    `window`.
    async fn record_if_below(
        &self,
        key: &str,
        now_millis: u64,
        window: Duration,
        limit: u32,
    ) -> Result<WindowOutcome, Self::Error>;

    /// Delete every entry for `key`.
    async fn clear(&self, key: &str) -> Result<(), Self::Error>;
}

pub(crate) fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX)
}
