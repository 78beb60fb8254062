#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Floodgate
//!
//! Admission control for async Rust: decide per subject (client address, authenticated user
//! or API key) whether an operation may proceed now, and keep a struggling backing store
//! from being hammered while it recovers.
//!
//! ## Features
//!
//! - **Token bucket** limiter held in process memory
//! - **Sliding window** limiter over a shared [`WindowStore`] (in-memory here, Redis in
//!   the `floodgate-redis` crate), bounded by a store timeout with an explicit
//!   [`FailurePolicy`]
//! - **Adaptive** wrapper scaling any limiter's limit from a load signal
//! - **Circuit breaker** wrapper that stops consulting a limiter after repeated rejections
//! - **Tower middleware** with pluggable key strategies, bypass predicates and telemetry
//! - **Route policies** deserializable from JSON, with stock presets
//!
//! ## Quick Start
//!
//! ```rust
//! use floodgate::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let limiter = SlidingWindow::new(InMemoryWindowStore::new(), 5, Duration::from_secs(1))?;
//!     let breaker = CircuitBreaker::new(limiter, CircuitBreakerConfig::new(3, Duration::from_secs(2))?);
//!
//!     let decision = breaker.check("ip:203.0.113.7").await;
//!     assert!(decision.allowed);
//!     assert_eq!(decision.remaining, 4);
//!
//!     breaker.reset("ip:203.0.113.7").await?;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod decision;
pub mod dynamic;
pub mod error;
pub mod key;
pub mod limiter;
pub mod middleware;
pub mod prelude;
pub mod presets;
pub mod store;
pub mod sweeper;
pub mod telemetry;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AdmissionConfig, Algorithm, KeyStrategyKind, LocalLimiter, RoutePolicy};
pub use decision::{Cause, Decision};
pub use dynamic::DynamicConfig;
pub use error::{AdmissionError, ConfigError, LimiterError, Rejection, StoreError};
pub use key::{AdmissionContext, KeyStrategy, RequestInfo};
pub use limiter::adaptive::{Adaptive, AdaptiveConfig, FixedLoad, LoadError, LoadSignal, SharedLoad};
pub use limiter::circuit_breaker::{BreakerScope, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use limiter::sliding_window::SlidingWindow;
pub use limiter::token_bucket::TokenBucket;
pub use limiter::{FailurePolicy, RateLimiter};
pub use middleware::{AdmissionLayer, AdmissionService, SkipPredicate};
pub use store::{InMemoryWindowStore, WindowOutcome, WindowStore};
pub use sweeper::{spawn_sweeper, Sweep, SweeperHandle};
