use super::{window_millis, WindowOutcome, WindowStore};
use crate::clock::{Clock, SystemClock};
use crate::limiter::lock;
use crate::sweeper::Sweep;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct Log {
    stamps: VecDeque<u64>,
    expires_at_millis: u64,
}

impl Log {
    fn prune(&mut self, now_millis: u64, window: u64) {
        // Nothing can have expired before one full window has elapsed.
        let Some(cutoff) = now_millis.checked_sub(window) else { return };
        while self.stamps.front().is_some_and(|&t| t <= cutoff) {
            self.stamps.pop_front();
        }
    }
}

/// Process-local window store.
///
/// Suitable for single-instance deployments and tests. Every evaluation runs under one
/// mutex acquisition. Clones share state.
#[derive(Clone, Debug)]
pub struct InMemoryWindowStore {
    logs: Arc<Mutex<HashMap<String, Log>>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryWindowStore {
    fn default() -> Self {
        Self { logs: Arc::new(Mutex::new(HashMap::new())), clock: Arc::new(SystemClock) }
    }
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock used to decide when whole logs have expired during [`Sweep::sweep`].
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Number of keys holding a log.
    pub fn len(&self) -> usize {
        lock(&self.logs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live entries recorded for `key` (expired entries included until the next evaluation).
    pub fn entries(&self, key: &str) -> usize {
        lock(&self.logs).get(key).map_or(0, |log| log.stamps.len())
    }

    /// Drop logs whose expiry has passed at `now_millis`.
    pub fn purge_expired(&self, now_millis: u64) -> usize {
        let mut logs = lock(&self.logs);
        let before = logs.len();
        logs.retain(|_, log| log.expires_at_millis > now_millis);
        before - logs.len()
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    type Error = std::convert::Infallible;

    async fn record_if_below(
        &self,
        key: &str,
        now_millis: u64,
        window: Duration,
        limit: u32,
    ) -> Result<WindowOutcome, Self::Error> {
        let window = window_millis(window);
        let mut logs = lock(&self.logs);
        let log = logs.entry(key.to_string()).or_default();

        log.prune(now_millis, window);
        let live = log.stamps.len();
        let admitted = live < limit as usize;
        if admitted {
            // Stamps arrive in clock order under the lock; a clock that steps back is
            // folded onto the newest entry to keep the log sorted.
            let stamp = log.stamps.back().map_or(now_millis, |&last| last.max(now_millis));
            log.stamps.push_back(stamp);
            log.expires_at_millis = now_millis.saturating_add(window);
        }

        let outcome = WindowOutcome {
            admitted,
            count: u32::try_from(log.stamps.len()).unwrap_or(u32::MAX),
            oldest_millis: log.stamps.front().copied(),
        };
        if log.stamps.is_empty() {
            logs.remove(key);
        }
        Ok(outcome)
    }

    async fn clear(&self, key: &str) -> Result<(), Self::Error> {
        lock(&self.logs).remove(key);
        Ok(())
    }
}

impl Sweep for InMemoryWindowStore {
    fn sweep(&self) -> usize {
        self.purge_expired(self.clock.now_millis())
    }
}
