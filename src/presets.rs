//! Stock route policies.
//!
//! - [`auth`]: login and credential endpoints. Strict sliding window keyed by address,
//!   failing closed when the store is unreachable.
//! - [`search`]: moderate token bucket keyed by address.
//! - [`admin`]: lenient token bucket keyed by identity, bypassed for the `admin` role.
//!
//! ```rust
//! use floodgate::presets;
//!
//! let config = presets::config();
//! assert_eq!(config.policy_for("admin").bypass_roles, vec!["admin".to_string()]);
//! ```

use crate::config::{AdmissionConfig, Algorithm, KeyStrategyKind, RoutePolicy};
use crate::limiter::FailurePolicy;

const AUTH_PER_MINUTE: f64 = 5.0;
const AUTH_WINDOW_MILLIS: u64 = 60_000;

const SEARCH_RATE: f64 = 10.0;
const SEARCH_BURST: u32 = 20;

const ADMIN_RATE: f64 = 50.0;
const ADMIN_BURST: u32 = 100;

/// Role whose holders skip admission on [`admin`] routes.
pub const ADMIN_ROLE: &str = "admin";

/// Five attempts per trailing minute per address.
pub fn auth() -> RoutePolicy {
    RoutePolicy {
        algorithm: Algorithm::SlidingWindow,
        requests_per_second: AUTH_PER_MINUTE / 60.0,
        burst: AUTH_PER_MINUTE as u32,
        window_millis: AUTH_WINDOW_MILLIS,
        key_strategy: KeyStrategyKind::Address,
        on_store_failure: FailurePolicy::FailClosed,
        ..RoutePolicy::default()
    }
}

/// Ten requests per second per address, bursting to twenty.
pub fn search() -> RoutePolicy {
    RoutePolicy {
        algorithm: Algorithm::TokenBucket,
        requests_per_second: SEARCH_RATE,
        burst: SEARCH_BURST,
        key_strategy: KeyStrategyKind::Address,
        ..RoutePolicy::default()
    }
}

/// Fifty requests per second per identity, bursting to a hundred; admins are not limited.
pub fn admin() -> RoutePolicy {
    RoutePolicy {
        algorithm: Algorithm::TokenBucket,
        requests_per_second: ADMIN_RATE,
        burst: ADMIN_BURST,
        key_strategy: KeyStrategyKind::Identity,
        bypass_roles: vec![ADMIN_ROLE.to_string()],
        ..RoutePolicy::default()
    }
}

/// Config with the three presets under the routes `auth`, `search` and `admin`, and
/// [`search`] as the default.
pub fn config() -> AdmissionConfig {
    AdmissionConfig::new(search())
        .with_route("auth", auth())
        .with_route("search", search())
        .with_route("admin", admin())
}
