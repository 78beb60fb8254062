//! Circuit breaking around a limiter.
//!
//! [`CircuitBreaker`] counts rejections from the limiter it wraps. Once `max_failures`
//! accumulate it opens and answers every check with a [`Cause::CircuitOpen`] rejection
//! without touching the wrapped limiter (and whatever store sits behind it). After
//! `reset_timeout` a single probe is let through: an admission closes the circuit, a
//! rejection reopens it.
//!
//! | State      | `check(key)`                                                         |
//! |------------|----------------------------------------------------------------------|
//! | `Closed`   | delegate; a rejection counts as a failure, `max_failures` opens      |
//! | `Open`     | reject until more than `reset_timeout` has passed, then go half-open |
//! | `HalfOpen` | delegate exactly one probe; concurrent callers are rejected          |

use crate::clock::{Clock, SystemClock};
use crate::decision::{Cause, Decision};
use crate::error::{ConfigError, LimiterError};
use crate::limiter::{lock, RateLimiter};
use crate::sweeper::Sweep;
use crate::telemetry::{AdmissionEvent, SinkHandle, TelemetrySink};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};

const SHARED_SLOT: &str = "*";

/// Current state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits checks until the reset timeout elapses.
    Open,
    /// One probe decides between closing and reopening.
    HalfOpen,
}

/// Which subjects share a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakerScope {
    /// One circuit for the whole limiter. Suits protecting a shared store: once it
    /// struggles, every subject backs off. One misbehaving subject can trip it for all.
    #[default]
    Shared,
    /// An independent circuit per subject key.
    PerKey,
}

/// Validated breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    max_failures: usize,
    reset_timeout: Duration,
    scope: BreakerScope,
}

impl CircuitBreakerConfig {
    /// Open after `max_failures` rejections; probe once `reset_timeout` has passed.
    pub fn new(max_failures: usize, reset_timeout: Duration) -> Result<Self, ConfigError> {
        if max_failures == 0 {
            return Err(ConfigError::InvalidFailureThreshold(max_failures));
        }
        if reset_timeout.is_zero() {
            return Err(ConfigError::InvalidResetTimeout(reset_timeout));
        }
        Ok(Self { max_failures, reset_timeout, scope: BreakerScope::Shared })
    }

    pub fn with_scope(mut self, scope: BreakerScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn max_failures(&self) -> usize {
        self.max_failures
    }

    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }

    pub fn scope(&self) -> BreakerScope {
        self.scope
    }

    fn reset_timeout_millis(&self) -> u64 {
        u64::try_from(self.reset_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Clone, Copy)]
struct Circuit {
    state: CircuitState,
    failure_count: usize,
    opened_at_millis: u64,
    probe_in_flight: bool,
    last_seen_millis: u64,
}

impl Circuit {
    fn closed(now: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at_millis: 0,
            probe_in_flight: false,
            last_seen_millis: now,
        }
    }
}

enum Gate {
    Pass,
    Probe,
    Reject { reset_at_millis: u64 },
}

type Circuits = Arc<Mutex<HashMap<String, Circuit>>>;

/// Releases the half-open probe slot if the probe is dropped before it finishes.
struct ProbeGuard<'a> {
    circuits: &'a Circuits,
    slot: &'a str,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Some(circuit) = lock(self.circuits).get_mut(self.slot) {
                circuit.probe_in_flight = false;
            }
        }
    }
}

/// Limiter wrapper with a closed / open / half-open failure detector.
pub struct CircuitBreaker<L> {
    inner: L,
    config: CircuitBreakerConfig,
    circuits: Circuits,
    clock: Arc<dyn Clock>,
    sink: SinkHandle,
}

impl<L: RateLimiter> CircuitBreaker<L> {
    pub fn new(inner: L, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            config,
            circuits: Arc::new(Mutex::new(HashMap::new())),
            clock: Arc::new(SystemClock),
            sink: SinkHandle::none(),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Report state transitions to `sink`.
    pub fn with_sink<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        self.sink = SinkHandle::new(sink);
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    /// State of the shared circuit, or of `key`'s circuit under [`BreakerScope::PerKey`].
    pub fn state_for(&self, key: &str) -> CircuitState {
        let slot = self.slot(key);
        lock(&self.circuits).get(slot).map_or(CircuitState::Closed, |c| c.state)
    }

    /// State of the shared circuit.
    pub fn state(&self) -> CircuitState {
        self.state_for(SHARED_SLOT)
    }

    /// Failures counted toward opening for `key`'s circuit.
    pub fn failure_count(&self, key: &str) -> usize {
        let slot = self.slot(key);
        lock(&self.circuits).get(slot).map_or(0, |c| c.failure_count)
    }

    /// Forget closed per-key circuits idle for `max_idle`. Open and half-open circuits are
    /// kept so a tripped subject cannot skip its cool-down by going quiet.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let now = self.clock.now_millis();
        let max_idle = u64::try_from(max_idle.as_millis()).unwrap_or(u64::MAX);
        let mut circuits = lock(&self.circuits);
        let before = circuits.len();
        circuits.retain(|slot, c| {
            slot == SHARED_SLOT
                || c.state != CircuitState::Closed
                || now.saturating_sub(c.last_seen_millis) < max_idle
        });
        before - circuits.len()
    }

    fn slot<'k>(&self, key: &'k str) -> &'k str {
        match self.config.scope {
            BreakerScope::Shared => SHARED_SLOT,
            BreakerScope::PerKey => key,
        }
    }

    fn admit(&self, slot: &str, now: u64) -> (Gate, Option<AdmissionEvent>) {
        let mut circuits = lock(&self.circuits);
        let circuit = circuits.entry(slot.to_string()).or_insert_with(|| Circuit::closed(now));
        circuit.last_seen_millis = now;
        let reopen_at = circuit.opened_at_millis.saturating_add(self.config.reset_timeout_millis());

        match circuit.state {
            CircuitState::Closed => (Gate::Pass, None),
            CircuitState::Open if now > reopen_at => {
                circuit.state = CircuitState::HalfOpen;
                circuit.failure_count = 0;
                circuit.probe_in_flight = true;
                info!(target: "floodgate::circuit_breaker", circuit = slot, "circuit half-open; probing");
                (Gate::Probe, Some(AdmissionEvent::CircuitHalfOpen { circuit: slot.to_string() }))
            }
            CircuitState::Open => (Gate::Reject { reset_at_millis: reopen_at.saturating_add(1) }, None),
            CircuitState::HalfOpen if !circuit.probe_in_flight => {
                circuit.probe_in_flight = true;
                (Gate::Probe, None)
            }
            CircuitState::HalfOpen => (Gate::Reject { reset_at_millis: now }, None),
        }
    }

    fn record_rejection(&self, slot: &str) -> Option<AdmissionEvent> {
        let now = self.clock.now_millis();
        let mut circuits = lock(&self.circuits);
        let circuit = circuits.entry(slot.to_string()).or_insert_with(|| Circuit::closed(now));
        if circuit.state != CircuitState::Closed {
            return None;
        }
        circuit.failure_count += 1;
        if circuit.failure_count < self.config.max_failures {
            return None;
        }
        circuit.state = CircuitState::Open;
        circuit.opened_at_millis = now;
        error!(
            target: "floodgate::circuit_breaker",
            circuit = slot,
            failures = circuit.failure_count,
            threshold = self.config.max_failures,
            "circuit open"
        );
        Some(AdmissionEvent::CircuitOpened {
            circuit: slot.to_string(),
            failure_count: circuit.failure_count,
        })
    }

    fn finish_probe(&self, slot: &str, admitted: bool) -> Option<AdmissionEvent> {
        let now = self.clock.now_millis();
        let mut circuits = lock(&self.circuits);
        let circuit = circuits.get_mut(slot)?;
        if circuit.state != CircuitState::HalfOpen || !circuit.probe_in_flight {
            return None;
        }
        circuit.probe_in_flight = false;
        if admitted {
            circuit.state = CircuitState::Closed;
            circuit.failure_count = 0;
            info!(target: "floodgate::circuit_breaker", circuit = slot, "circuit closed");
            Some(AdmissionEvent::CircuitClosed { circuit: slot.to_string() })
        } else {
            circuit.state = CircuitState::Open;
            circuit.opened_at_millis = now;
            error!(target: "floodgate::circuit_breaker", circuit = slot, "probe rejected; circuit open");
            Some(AdmissionEvent::CircuitOpened {
                circuit: slot.to_string(),
                failure_count: circuit.failure_count,
            })
        }
    }

    async fn emit(&self, event: Option<AdmissionEvent>) {
        if let Some(event) = event {
            self.sink.emit(event).await;
        }
    }
}

#[async_trait]
impl<L: RateLimiter> RateLimiter for CircuitBreaker<L> {
    async fn check(&self, key: &str) -> Decision {
        let slot = self.slot(key);
        let now = self.clock.now_millis();
        let (gate, event) = self.admit(slot, now);
        self.emit(event).await;

        match gate {
            Gate::Reject { reset_at_millis } => {
                tracing::debug!(target: "floodgate::circuit_breaker", key, "rejected by open circuit");
                Decision::rejected(self.inner.limit(), reset_at_millis.max(now), Cause::CircuitOpen)
            }
            Gate::Pass => {
                let decision = self.inner.check(key).await;
                if !decision.allowed {
                    let event = self.record_rejection(slot);
                    self.emit(event).await;
                }
                decision
            }
            Gate::Probe => {
                let mut guard = ProbeGuard { circuits: &self.circuits, slot, armed: true };
                let decision = self.inner.check(key).await;
                guard.armed = false;
                drop(guard);
                let event = self.finish_probe(slot, decision.allowed);
                self.emit(event).await;
                decision
            }
        }
    }

    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        let slot = self.slot(key);
        let was_tripped = {
            let now = self.clock.now_millis();
            let mut circuits = lock(&self.circuits);
            let previous = circuits.insert(slot.to_string(), Circuit::closed(now));
            previous.is_some_and(|c| c.state != CircuitState::Closed)
        };
        if was_tripped {
            info!(target: "floodgate::circuit_breaker", circuit = slot, "circuit closed by reset");
            self.emit(Some(AdmissionEvent::CircuitClosed { circuit: slot.to_string() })).await;
        }
        self.inner.reset(key).await
    }

    fn limit(&self) -> u32 {
        self.inner.limit()
    }

    fn set_limit(&self, limit: u32) {
        self.inner.set_limit(limit)
    }
}

impl<L: RateLimiter> Sweep for CircuitBreaker<L> {
    fn sweep(&self) -> usize {
        self.sweep_idle(self.config.reset_timeout.saturating_mul(4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::telemetry::MemorySink;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Limiter whose answer is scripted and whose calls are counted.
    #[derive(Default)]
    struct Scripted {
        admit: AtomicBool,
        calls: AtomicUsize,
        resets: AtomicUsize,
    }

    impl Scripted {
        fn rejecting() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RateLimiter for Scripted {
        async fn check(&self, _key: &str) -> Decision {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.admit.load(Ordering::SeqCst) {
                Decision::admitted(1, 0, 0)
            } else {
                Decision::rejected(1, 0, Cause::QuotaExhausted)
            }
        }

        async fn reset(&self, _key: &str) -> Result<(), LimiterError> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn limit(&self) -> u32 {
            1
        }

        fn set_limit(&self, _limit: u32) {}
    }

    fn breaker(
        inner: Arc<Scripted>,
        max_failures: usize,
        reset_timeout: Duration,
    ) -> (CircuitBreaker<Arc<Scripted>>, ManualClock) {
        let clock = ManualClock::starting_at(50_000);
        let cfg = CircuitBreakerConfig::new(max_failures, reset_timeout).unwrap();
        (CircuitBreaker::new(inner, cfg).with_clock(clock.clone()), clock)
    }

    #[test]
    fn rejects_invalid_config() {
        assert_eq!(
            CircuitBreakerConfig::new(0, Duration::from_secs(1)).unwrap_err(),
            ConfigError::InvalidFailureThreshold(0)
        );
        assert_eq!(
            CircuitBreakerConfig::new(1, Duration::ZERO).unwrap_err(),
            ConfigError::InvalidResetTimeout(Duration::ZERO)
        );
    }

    #[tokio::test]
    async fn trips_after_max_failures_and_probes_once() {
        let inner = Scripted::rejecting();
        let (breaker, clock) = breaker(inner.clone(), 3, Duration::from_secs(2));

        for _ in 0..3 {
            let d = breaker.check("k").await;
            assert!(!d.allowed);
            assert_eq!(d.cause, Cause::QuotaExhausted);
        }
        assert_eq!(inner.calls(), 3);
        assert_eq!(breaker.state(), CircuitState::Open);

        let d = breaker.check("k").await;
        assert!(d.is_circuit_open());
        assert_eq!(inner.calls(), 3, "open circuit must not consult the wrapped limiter");

        clock.advance(Duration::from_millis(2_100));
        let d = breaker.check("k").await;
        assert!(!d.allowed);
        assert_eq!(d.cause, Cause::QuotaExhausted);
        assert_eq!(inner.calls(), 4, "exactly one probe per half-open transition");
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(breaker.check("k").await.is_circuit_open());
        assert_eq!(inner.calls(), 4);
    }

    #[tokio::test]
    async fn stays_open_until_timeout_strictly_elapses() {
        let inner = Scripted::rejecting();
        let (breaker, clock) = breaker(inner.clone(), 1, Duration::from_secs(2));
        breaker.check("k").await;

        clock.advance(Duration::from_secs(2));
        let d = breaker.check("k").await;
        assert!(d.is_circuit_open());
        assert_eq!(d.reset_at_millis, clock.now_millis() + 1);
        assert_eq!(inner.calls(), 1);

        clock.advance(Duration::from_millis(1));
        breaker.check("k").await;
        assert_eq!(inner.calls(), 2);
    }

    #[tokio::test]
    async fn unbounded_reset_timeout_keeps_circuit_open() {
        let inner = Scripted::rejecting();
        let (breaker, clock) = breaker(inner.clone(), 1, Duration::MAX);
        breaker.check("k").await;
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(86_400));
        let d = breaker.check("k").await;
        assert!(d.is_circuit_open());
        assert_eq!(d.reset_at_millis, u64::MAX);
        assert_eq!(inner.calls(), 1);
        assert_eq!(breaker.sweep(), 0);
    }

    #[tokio::test]
    async fn successful_probe_closes() {
        let inner = Scripted::rejecting();
        let (breaker, clock) = breaker(inner.clone(), 2, Duration::from_secs(1));
        breaker.check("k").await;
        breaker.check("k").await;
        assert_eq!(breaker.state(), CircuitState::Open);

        inner.admit.store(true, Ordering::SeqCst);
        clock.advance(Duration::from_millis(1_001));
        assert!(breaker.allow("k").await);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count("k"), 0);
        assert!(breaker.allow("k").await);
    }

    #[tokio::test]
    async fn admissions_do_not_clear_failure_count() {
        let inner = Scripted::rejecting();
        let (breaker, _clock) = breaker(inner.clone(), 3, Duration::from_secs(1));
        breaker.check("k").await;
        breaker.check("k").await;
        inner.admit.store(true, Ordering::SeqCst);
        breaker.check("k").await;
        assert_eq!(breaker.failure_count("k"), 2);
        inner.admit.store(false, Ordering::SeqCst);
        breaker.check("k").await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn reset_closes_and_resets_inner() {
        let inner = Scripted::rejecting();
        let (breaker, _clock) = breaker(inner.clone(), 1, Duration::from_secs(30));
        breaker.check("k").await;
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset("k").await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count("k"), 0);
        assert_eq!(inner.resets.load(Ordering::SeqCst), 1);

        inner.admit.store(true, Ordering::SeqCst);
        assert!(breaker.allow("k").await);
    }

    #[tokio::test]
    async fn shared_scope_trips_for_everyone() {
        let inner = Scripted::rejecting();
        let (breaker, _clock) = breaker(inner.clone(), 2, Duration::from_secs(5));
        breaker.check("noisy").await;
        breaker.check("noisy").await;
        inner.admit.store(true, Ordering::SeqCst);
        assert!(breaker.check("quiet").await.is_circuit_open());
    }

    #[tokio::test]
    async fn per_key_scope_isolates_subjects() {
        let inner = Scripted::rejecting();
        let clock = ManualClock::new();
        let cfg = CircuitBreakerConfig::new(2, Duration::from_secs(5))
            .unwrap()
            .with_scope(BreakerScope::PerKey);
        let breaker = CircuitBreaker::new(inner.clone(), cfg).with_clock(clock.clone());

        breaker.check("noisy").await;
        breaker.check("noisy").await;
        assert_eq!(breaker.state_for("noisy"), CircuitState::Open);

        inner.admit.store(true, Ordering::SeqCst);
        assert!(breaker.allow("quiet").await);
        assert_eq!(breaker.state_for("quiet"), CircuitState::Closed);

        clock.advance(Duration::from_secs(60));
        assert_eq!(breaker.sweep_idle(Duration::from_secs(30)), 1);
        assert_eq!(breaker.state_for("noisy"), CircuitState::Open);
    }

    #[tokio::test]
    async fn emits_transition_events() {
        let sink = MemorySink::new();
        let inner = Scripted::rejecting();
        let (breaker, clock) = breaker(inner.clone(), 1, Duration::from_secs(1));
        let breaker = breaker.with_sink(sink.clone());

        breaker.check("k").await;
        clock.advance(Duration::from_secs(2));
        inner.admit.store(true, Ordering::SeqCst);
        breaker.check("k").await;

        assert_eq!(
            sink.events(),
            vec![
                AdmissionEvent::CircuitOpened { circuit: "*".into(), failure_count: 1 },
                AdmissionEvent::CircuitHalfOpen { circuit: "*".into() },
                AdmissionEvent::CircuitClosed { circuit: "*".into() },
            ]
        );
    }

    /// Wrapped limiter that parks until released, to hold a probe in flight.
    struct Gated {
        release: tokio::sync::Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RateLimiter for Gated {
        async fn check(&self, _key: &str) -> Decision {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n > 0 {
                self.release.notified().await;
            }
            Decision::rejected(1, 0, Cause::QuotaExhausted)
        }

        async fn reset(&self, _key: &str) -> Result<(), LimiterError> {
            Ok(())
        }

        fn limit(&self) -> u32 {
            1
        }

        fn set_limit(&self, _limit: u32) {}
    }

    #[tokio::test]
    async fn concurrent_callers_during_probe_are_rejected() {
        let inner = Arc::new(Gated { release: tokio::sync::Notify::new(), calls: AtomicUsize::new(0) });
        let clock = ManualClock::new();
        let cfg = CircuitBreakerConfig::new(1, Duration::from_secs(1)).unwrap();
        let breaker = Arc::new(CircuitBreaker::new(inner.clone(), cfg).with_clock(clock.clone()));

        breaker.check("k").await;
        clock.advance(Duration::from_secs(2));

        let prober = {
            let breaker = breaker.clone();
            tokio::spawn(async move { breaker.check("k").await })
        };
        while inner.calls.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        for _ in 0..5 {
            assert!(breaker.check("k").await.is_circuit_open());
        }
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);

        inner.release.notify_one();
        prober.await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn dropped_probe_releases_slot() {
        let inner = Arc::new(Gated { release: tokio::sync::Notify::new(), calls: AtomicUsize::new(0) });
        let clock = ManualClock::new();
        let cfg = CircuitBreakerConfig::new(1, Duration::from_secs(1)).unwrap();
        let breaker = CircuitBreaker::new(inner.clone(), cfg).with_clock(clock.clone());

        breaker.check("k").await;
        clock.advance(Duration::from_secs(2));

        let probe = tokio::time::timeout(Duration::from_millis(10), breaker.check("k")).await;
        assert!(probe.is_err());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        inner.release.notify_one();
        let d = breaker.check("k").await;
        assert_eq!(d.cause, Cause::QuotaExhausted);
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
