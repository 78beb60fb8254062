//! Per-route admission policies.
//!
//! A [`RoutePolicy`] is the `{rate, burst, window, key strategy, bypass}` tuple a service
//! applies to one family of endpoints. [`AdmissionConfig`] maps route names to policies with
//! a default for everything else. With the `config` feature both deserialize from JSON:
//!
//! ```json
//! {
//!   "default": { "requests_per_second": 20.0, "burst": 40 },
//!   "routes": {
//!     "login": { "algorithm": "sliding_window", "requests_per_second": 0.1, "window_millis": 60000 },
//!     "admin": { "key_strategy": "identity", "bypass_roles": ["admin"] }
//!   }
//! }
//! ```

use crate::decision::Decision;
use crate::error::{ConfigError, LimiterError};
use crate::key::{AdmissionContext, KeyStrategy};
use crate::limiter::sliding_window::SlidingWindow;
use crate::limiter::token_bucket::TokenBucket;
use crate::limiter::{FailurePolicy, RateLimiter};
use crate::middleware::{AdmissionLayer, SkipPredicate};
use crate::store::{InMemoryWindowStore, WindowStore};
use crate::sweeper::Sweep;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Limiting algorithm for a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "config", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "config", serde(rename_all = "snake_case"))]
pub enum Algorithm {
    #[default]
    TokenBucket,
    SlidingWindow,
}

/// Serializable name of a [`KeyStrategy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "config", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "config", serde(rename_all = "snake_case"))]
pub enum KeyStrategyKind {
    #[default]
    Address,
    Identity,
    Credential,
}

/// Admission policy for one route.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "config", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "config", serde(default, deny_unknown_fields))]
pub struct RoutePolicy {
    pub algorithm: Algorithm,
    /// Sustained rate. For sliding windows the per-window limit is this rate times the
    /// window, rounded.
    pub requests_per_second: f64,
    /// Token-bucket capacity. Unused by sliding windows.
    pub burst: u32,
    /// Sliding-window length. Unused by token buckets.
    pub window_millis: u64,
    pub key_strategy: KeyStrategyKind,
    /// Header carrying the credential for [`KeyStrategyKind::Credential`].
    pub credential_header: Option<String>,
    /// Take the client address from the forwarded-for chain.
    pub trust_forwarded: bool,
    /// Requests from callers holding any of these roles skip admission.
    pub bypass_roles: Vec<String>,
    pub on_store_failure: FailurePolicy,
}

impl Default for RoutePolicy {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::TokenBucket,
            requests_per_second: 10.0,
            burst: 20,
            window_millis: 1_000,
            key_strategy: KeyStrategyKind::Address,
            credential_header: None,
            trust_forwarded: false,
            bypass_roles: Vec::new(),
            on_store_failure: FailurePolicy::FailOpen,
        }
    }
}

impl RoutePolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.requests_per_second.is_finite() || self.requests_per_second <= 0.0 {
            return Err(ConfigError::InvalidRate(self.requests_per_second));
        }
        match self.algorithm {
            Algorithm::TokenBucket if self.burst == 0 => return Err(ConfigError::InvalidBurst(0)),
            Algorithm::SlidingWindow if self.window_millis == 0 => {
                return Err(ConfigError::InvalidWindow(Duration::ZERO))
            }
            _ => {}
        }
        if self.key_strategy == KeyStrategyKind::Credential
            && self.credential_header.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigError::MissingCredentialHeader);
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_millis)
    }

    /// Events admitted per window by a sliding-window limiter built from this policy.
    pub fn window_limit(&self) -> u32 {
        let limit = (self.requests_per_second * self.window().as_secs_f64()).round();
        if limit >= f64::from(u32::MAX) {
            u32::MAX
        } else {
            (limit as u32).max(1)
        }
    }

    /// The key strategy this policy names.
    pub fn strategy(&self) -> KeyStrategy {
        match self.key_strategy {
            KeyStrategyKind::Address => KeyStrategy::ByAddress { trust_forwarded: self.trust_forwarded },
            KeyStrategyKind::Identity => KeyStrategy::ByIdentity,
            KeyStrategyKind::Credential => {
                KeyStrategy::credential(self.credential_header.clone().unwrap_or_default())
            }
        }
    }

    /// Bypass predicate for [`bypass_roles`](Self::bypass_roles), if any are configured.
    pub fn skip_predicate(&self) -> Option<SkipPredicate> {
        if self.bypass_roles.is_empty() {
            return None;
        }
        let roles = self.bypass_roles.clone();
        Some(Arc::new(move |req: &dyn AdmissionContext| roles.iter().any(|r| req.has_role(r))))
    }

    /// Sliding-window limiter over `store`, e.g. a Redis store shared between instances.
    pub fn sliding_window<S>(&self, store: S) -> Result<SlidingWindow<S>, ConfigError>
    where
        S: WindowStore + 'static,
    {
        self.validate()?;
        Ok(SlidingWindow::new(store, self.window_limit(), self.window())?
            .with_failure_policy(self.on_store_failure))
    }

    /// In-process limiter implementing this policy.
    pub fn build_local(&self) -> Result<LocalLimiter, ConfigError> {
        self.validate()?;
        match self.algorithm {
            Algorithm::TokenBucket => {
                Ok(LocalLimiter::TokenBucket(TokenBucket::new(self.requests_per_second, self.burst)?))
            }
            Algorithm::SlidingWindow => {
                Ok(LocalLimiter::SlidingWindow(self.sliding_window(InMemoryWindowStore::new())?))
            }
        }
    }

    /// Admission layer over `limiter` keyed and bypassed as this policy says.
    pub fn layer_with<L: RateLimiter>(&self, limiter: L) -> AdmissionLayer<L> {
        let layer = AdmissionLayer::new(limiter).key_strategy(self.strategy());
        match self.skip_predicate() {
            Some(skip) => layer.skip_if(move |req| skip(req)),
            None => layer,
        }
    }

    /// Admission layer over an in-process limiter built from this policy.
    pub fn layer(&self) -> Result<AdmissionLayer<LocalLimiter>, ConfigError> {
        Ok(self.layer_with(self.build_local()?))
    }
}

/// In-process limiter produced by [`RoutePolicy::build_local`].
#[derive(Debug, Clone)]
pub enum LocalLimiter {
    TokenBucket(TokenBucket),
    SlidingWindow(SlidingWindow<InMemoryWindowStore>),
}

#[async_trait]
impl RateLimiter for LocalLimiter {
    async fn check(&self, key: &str) -> Decision {
        match self {
            LocalLimiter::TokenBucket(l) => l.check(key).await,
            LocalLimiter::SlidingWindow(l) => l.check(key).await,
        }
    }

    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        match self {
            LocalLimiter::TokenBucket(l) => l.reset(key).await,
            LocalLimiter::SlidingWindow(l) => l.reset(key).await,
        }
    }

    fn limit(&self) -> u32 {
        match self {
            LocalLimiter::TokenBucket(l) => l.limit(),
            LocalLimiter::SlidingWindow(l) => l.limit(),
        }
    }

    fn set_limit(&self, limit: u32) {
        match self {
            LocalLimiter::TokenBucket(l) => l.set_limit(limit),
            LocalLimiter::SlidingWindow(l) => l.set_limit(limit),
        }
    }
}

impl Sweep for LocalLimiter {
    fn sweep(&self) -> usize {
        match self {
            LocalLimiter::TokenBucket(l) => l.sweep(),
            LocalLimiter::SlidingWindow(l) => l.store().sweep(),
        }
    }
}

/// Route name → policy, with a default for unlisted routes.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "config", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "config", serde(default, deny_unknown_fields))]
pub struct AdmissionConfig {
    pub default: RoutePolicy,
    pub routes: HashMap<String, RoutePolicy>,
}

impl AdmissionConfig {
    pub fn new(default: RoutePolicy) -> Self {
        Self { default, routes: HashMap::new() }
    }

    #[must_use]
    pub fn with_route(mut self, route: impl Into<String>, policy: RoutePolicy) -> Self {
        self.routes.insert(route.into(), policy);
        self
    }

    /// Parse and validate a JSON document.
    #[cfg(feature = "config")]
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "config")]
    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate every policy; errors name the offending route.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default.validate().map_err(|e| ConfigError::InvalidRoute {
            route: "default".to_string(),
            source: Box::new(e),
        })?;
        for (route, policy) in &self.routes {
            policy.validate().map_err(|e| ConfigError::InvalidRoute {
                route: route.clone(),
                source: Box::new(e),
            })?;
        }
        Ok(())
    }

    /// Policy for `route`, or the default when the route is not listed.
    pub fn policy_for(&self, route: &str) -> &RoutePolicy {
        self.routes.get(route).unwrap_or(&self.default)
    }
}
