//! Convenient re-exports for common Floodgate types.
pub use crate::{
    clock::{Clock, ManualClock},
    config::{AdmissionConfig, RoutePolicy},
    decision::{Cause, Decision},
    error::{AdmissionError, ConfigError, LimiterError, Rejection},
    key::{AdmissionContext, KeyStrategy, RequestInfo},
    limiter::adaptive::{Adaptive, AdaptiveConfig, LoadSignal},
    limiter::circuit_breaker::{BreakerScope, CircuitBreaker, CircuitBreakerConfig, CircuitState},
    limiter::sliding_window::SlidingWindow,
    limiter::token_bucket::TokenBucket,
    limiter::{FailurePolicy, RateLimiter},
    middleware::{AdmissionLayer, AdmissionService},
    store::{InMemoryWindowStore, WindowStore},
    sweeper::{spawn_sweeper, Sweep},
    telemetry::{AdmissionEvent, LogSink, MemorySink, TelemetrySink},
};
