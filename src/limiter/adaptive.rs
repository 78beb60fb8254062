//! Load-driven limit adjustment.
//!
//! [`Adaptive`] wraps any [`RateLimiter`] and, before admission checks, reads a
//! [`LoadSignal`] in `[0.0, 1.0]`:
//!
//! - above `high_watermark` the effective limit shrinks multiplicatively, down to `min_limit`;
//! - below `low_watermark` it grows multiplicatively (by at least one), up to `max_limit`;
//! - in between it holds, so a load hovering around one threshold does not flap.
//!
//! The new limit is pushed into the wrapped limiter through
//! [`RateLimiter::set_limit`]. When the signal is unavailable the limit falls back to
//! `base_limit` and admission carries on.

use crate::clock::{Clock, SystemClock};
use crate::decision::Decision;
use crate::error::{ConfigError, LimiterError};
use crate::limiter::{lock, RateLimiter};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Boxed error returned by a failing load signal.
pub type LoadError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Source of the current system load, as a fraction of capacity.
pub trait LoadSignal: Send + Sync {
    fn load(&self) -> Result<f64, LoadError>;
}

impl<F, E> LoadSignal for F
where
    F: Fn() -> Result<f64, E> + Send + Sync,
    E: Into<LoadError>,
{
    fn load(&self) -> Result<f64, LoadError> {
        self().map_err(Into::into)
    }
}

/// Constant load, mostly for tests and fixed deployments.
#[derive(Debug, Clone, Copy)]
pub struct FixedLoad(pub f64);

impl LoadSignal for FixedLoad {
    fn load(&self) -> Result<f64, LoadError> {
        Ok(self.0)
    }
}

/// Load gauge updated from elsewhere (a metrics poller, a health task). Clones share it.
#[derive(Debug, Clone, Default)]
pub struct SharedLoad {
    bits: Arc<AtomicU64>,
}

impl SharedLoad {
    pub fn new(initial: f64) -> Self {
        Self { bits: Arc::new(AtomicU64::new(initial.to_bits())) }
    }

    pub fn set(&self, load: f64) {
        self.bits.store(load.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

impl LoadSignal for SharedLoad {
    fn load(&self) -> Result<f64, LoadError> {
        Ok(self.get())
    }
}

/// Validated tuning for [`Adaptive`].
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveConfig {
    base_limit: u32,
    min_limit: u32,
    max_limit: u32,
    high_watermark: f64,
    low_watermark: f64,
    decrease_factor: f64,
    increase_factor: f64,
    adjust_interval: Duration,
}

impl AdaptiveConfig {
    /// Bounds with default watermarks (0.3 / 0.8) and factors (×0.9 / ×1.1).
    pub fn new(base_limit: u32, min_limit: u32, max_limit: u32) -> Result<Self, ConfigError> {
        let cfg = Self {
            base_limit,
            min_limit,
            max_limit,
            high_watermark: 0.8,
            low_watermark: 0.3,
            decrease_factor: 0.9,
            increase_factor: 1.1,
            adjust_interval: Duration::ZERO,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_watermarks(mut self, low: f64, high: f64) -> Result<Self, ConfigError> {
        self.low_watermark = low;
        self.high_watermark = high;
        self.validate()?;
        Ok(self)
    }

    pub fn with_factors(mut self, decrease: f64, increase: f64) -> Result<Self, ConfigError> {
        self.decrease_factor = decrease;
        self.increase_factor = increase;
        self.validate()?;
        Ok(self)
    }

    /// Read the signal at most once per `interval`; zero means before every check.
    pub fn with_adjust_interval(mut self, interval: Duration) -> Self {
        self.adjust_interval = interval;
        self
    }

    pub fn base_limit(&self) -> u32 {
        self.base_limit
    }

    pub fn min_limit(&self) -> u32 {
        self.min_limit
    }

    pub fn max_limit(&self) -> u32 {
        self.max_limit
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let (min, base, max) = (self.min_limit, self.base_limit, self.max_limit);
        if min == 0 || min > base || base > max {
            return Err(ConfigError::InvalidBounds { min, base, max });
        }
        let (low, high) = (self.low_watermark, self.high_watermark);
        if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) || low >= high {
            return Err(ConfigError::InvalidWatermarks { low, high });
        }
        let (decrease, increase) = (self.decrease_factor, self.increase_factor);
        if !(decrease > 0.0 && decrease < 1.0) || !(increase > 1.0 && increase.is_finite()) {
            return Err(ConfigError::InvalidFactors { decrease, increase });
        }
        Ok(())
    }

    fn next_limit(&self, current: f64, load: f64) -> f64 {
        if load > self.high_watermark {
            (current * self.decrease_factor).max(f64::from(self.min_limit))
        } else if load < self.low_watermark {
            (current * self.increase_factor).max(current + 1.0).min(f64::from(self.max_limit))
        } else {
            current
        }
    }
}

#[derive(Debug)]
struct Tuning {
    effective: f64,
    last_adjust_millis: Option<u64>,
}

/// Limiter wrapper whose limit follows system load.
pub struct Adaptive<L> {
    inner: L,
    signal: Arc<dyn LoadSignal>,
    config: AdaptiveConfig,
    tuning: Mutex<Tuning>,
    clock: Arc<dyn Clock>,
}

impl<L: RateLimiter> Adaptive<L> {
    /// Wrap `inner`, immediately setting its limit to `config.base_limit()`.
    pub fn new<G>(inner: L, signal: G, config: AdaptiveConfig) -> Self
    where
        G: LoadSignal + 'static,
    {
        inner.set_limit(config.base_limit);
        Self {
            inner,
            signal: Arc::new(signal),
            tuning: Mutex::new(Tuning {
                effective: f64::from(config.base_limit),
                last_adjust_millis: None,
            }),
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Limit currently pushed into the wrapped limiter.
    pub fn effective_limit(&self) -> u32 {
        lock(&self.tuning).effective.round() as u32
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    /// Read the load signal and retune the wrapped limiter. Called before each check;
    /// may also be driven from a timer.
    pub fn adjust(&self) {
        let now = self.clock.now_millis();
        let interval = u64::try_from(self.config.adjust_interval.as_millis()).unwrap_or(u64::MAX);

        {
            let mut tuning = lock(&self.tuning);
            if let Some(last) = tuning.last_adjust_millis {
                if interval > 0 && now.saturating_sub(last) < interval {
                    return;
                }
            }
            tuning.last_adjust_millis = Some(now);
        }

        // Signals may be slow; read outside the lock.
        let load = self.signal.load();

        let mut tuning = lock(&self.tuning);
        let before = tuning.effective.round() as u32;
        tuning.effective = match load {
            Ok(load) if load.is_finite() => self.config.next_limit(tuning.effective, load.clamp(0.0, 1.0)),
            Ok(load) => {
                warn!(target: "floodgate::adaptive", load, "load signal not a number; using base limit");
                f64::from(self.config.base_limit)
            }
            Err(e) => {
                warn!(target: "floodgate::adaptive", error = %e, "load signal unavailable; using base limit");
                f64::from(self.config.base_limit)
            }
        };
        let after = tuning.effective.round() as u32;
        if before != after {
            debug!(target: "floodgate::adaptive", from = before, to = after, "effective limit changed");
        }
        // Pushed under the lock so the wrapped limiter sees limits in the order they were decided.
        if before != after || self.inner.limit() != after {
            self.inner.set_limit(after);
        }
    }
}

#[async_trait]
impl<L: RateLimiter> RateLimiter for Adaptive<L> {
    async fn check(&self, key: &str) -> Decision {
        self.adjust();
        self.inner.check(key).await
    }

    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        self.inner.reset(key).await
    }

    fn limit(&self) -> u32 {
        self.inner.limit()
    }

    /// Rebases the effective limit; later adjustments start from here.
    fn set_limit(&self, limit: u32) {
        let clamped = limit.clamp(self.config.min_limit, self.config.max_limit);
        let mut tuning = lock(&self.tuning);
        tuning.effective = f64::from(clamped);
        self.inner.set_limit(clamped);
    }
}
