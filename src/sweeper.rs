//! Background eviction of idle per-key state.
//!
//! In-process limiters keep one entry per subject they have seen. Anything implementing
//! [`Sweep`] can be handed to [`spawn_sweeper`], which calls it on a fixed interval until the
//! returned [`SweeperHandle`] is stopped or dropped.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// State that can forget entries which no longer affect decisions.
pub trait Sweep: Send + Sync {
    /// Remove stale entries; returns how many were removed.
    fn sweep(&self) -> usize;
}

impl<T: Sweep + ?Sized> Sweep for Arc<T> {
    fn sweep(&self) -> usize {
        (**self).sweep()
    }
}

/// Owns a running sweeper task. Dropping the handle stops the task.
#[derive(Debug)]
pub struct SweeperHandle {
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop sweeping and wait for the task to wind down.
    pub async fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Sweep `target` every `interval` on the current tokio runtime.
///
/// The first sweep runs one full interval after spawning. A zero interval is raised to one
/// millisecond.
pub fn spawn_sweeper<T>(target: T, interval: Duration) -> SweeperHandle
where
    T: Sweep + 'static,
{
    let interval = interval.max(Duration::from_millis(1));
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = target.sweep();
            if removed > 0 {
                tracing::debug!(target: "floodgate::sweeper", removed, "swept idle entries");
            }
        }
    });
    SweeperHandle { task: Some(task) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        sweeps: AtomicUsize,
    }

    impl Sweep for Counting {
        fn sweep(&self) -> usize {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            1
        }
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_on_every_interval() {
        let target = Arc::new(Counting::default());
        let handle = spawn_sweeper(target.clone(), Duration::from_secs(10));
        assert!(handle.is_running());

        settle().await;
        assert_eq!(target.sweeps.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(target.sweeps.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        settle().await;
        assert_eq!(target.sweeps.load(Ordering::SeqCst), 3);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_stops_sweeping() {
        let target = Arc::new(Counting::default());
        let handle = spawn_sweeper(target.clone(), Duration::from_secs(1));
        drop(handle);
        settle().await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(target.sweeps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_token_buckets() {
        use crate::clock::ManualClock;
        use crate::limiter::token_bucket::TokenBucket;
        use crate::limiter::RateLimiter;

        let clock = ManualClock::new();
        let limiter = TokenBucket::new(1.0, 1).unwrap().with_clock(clock.clone());
        limiter.allow("idle").await;
        assert_eq!(limiter.len(), 1);

        let _handle = spawn_sweeper(limiter.clone(), Duration::from_secs(1));
        clock.advance(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;
        assert!(limiter.is_empty());
    }
}
