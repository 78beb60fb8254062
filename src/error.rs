//! Error types for limiters and the admission middleware
use crate::decision::{Cause, Decision};
use std::fmt;
use std::time::Duration;

/// Boxed error produced by a window store backend.
pub type StoreError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Infrastructure failure surfaced by [`RateLimiter::reset`](crate::RateLimiter::reset).
///
/// Admission checks never return this; they resolve store trouble through the limiter's
/// [`FailurePolicy`](crate::FailurePolicy).
#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    /// The backing store reported an error.
    #[error("window store error: {0}")]
    Store(#[source] StoreError),
    /// The backing store did not answer within the configured timeout.
    #[error("window store did not answer within {timeout:?}")]
    StoreTimeout { timeout: Duration },
}

impl LimiterError {
    pub fn store<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        LimiterError::Store(Box::new(err))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, LimiterError::StoreTimeout { .. })
    }
}

/// Rejected limiter or breaker parameters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("refill rate must be finite and > 0 (got {0})")]
    InvalidRate(f64),
    #[error("burst must be > 0 (got {0})")]
    InvalidBurst(u32),
    #[error("limit must be > 0 (got {0})")]
    InvalidLimit(u32),
    #[error("window must be at least 1ms (got {0:?})")]
    InvalidWindow(Duration),
    #[error("limits must satisfy 0 < min <= base <= max (got min={min}, base={base}, max={max})")]
    InvalidBounds { min: u32, base: u32, max: u32 },
    #[error("watermarks must satisfy 0 <= low < high <= 1 (got low={low}, high={high})")]
    InvalidWatermarks { low: f64, high: f64 },
    #[error("decrease factor must be in (0, 1) and increase factor > 1 (got {decrease}, {increase})")]
    InvalidFactors { decrease: f64, increase: f64 },
    #[error("max_failures must be > 0 (got {0})")]
    InvalidFailureThreshold(usize),
    #[error("reset_timeout must be > 0 (got {0:?})")]
    InvalidResetTimeout(Duration),
    #[error("credential key strategy needs a credential_header")]
    MissingCredentialHeader,
    #[error("route '{route}': {source}")]
    InvalidRoute {
        route: String,
        #[source]
        source: Box<ConfigError>,
    },
    #[error("malformed admission config: {0}")]
    Parse(String),
}

/// Rejection handed back to the caller instead of forwarding the operation.
///
/// Carries everything needed for a 429 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Subject key the decision was attributed to.
    pub key: String,
    pub decision: Decision,
    /// Clock reading when the rejection was produced; basis for `Retry-After`.
    pub now_millis: u64,
}

impl Rejection {
    /// HTTP status for rejected operations.
    pub const STATUS: u16 = 429;

    pub fn status(&self) -> u16 {
        Self::STATUS
    }

    pub fn limit(&self) -> u32 {
        self.decision.limit
    }

    pub fn remaining(&self) -> u32 {
        0
    }

    pub fn reset_at_secs(&self) -> u64 {
        self.decision.reset_at_secs()
    }

    pub fn retry_after_secs(&self) -> u64 {
        self.decision.retry_after_secs(self.now_millis)
    }

    pub fn cause(&self) -> Cause {
        self.decision.cause
    }

    /// Response headers in the conventional `X-RateLimit-*` form.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("X-RateLimit-Limit", self.limit().to_string()),
            ("X-RateLimit-Remaining", self.remaining().to_string()),
            ("X-RateLimit-Reset", self.reset_at_secs().to_string()),
            ("Retry-After", self.retry_after_secs().to_string()),
        ]
    }
}

/// Error returned by [`AdmissionService`](crate::middleware::AdmissionService).
#[derive(Debug, Clone)]
pub enum AdmissionError<E> {
    /// The limiter (or a breaker around it) refused the operation.
    Rejected(Rejection),
    /// The wrapped service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(r) => write!(
                f,
                "admission rejected for '{}' ({}; limit {}, retry after {}s)",
                r.key,
                r.cause(),
                r.limit(),
                r.retry_after_secs()
            ),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Rejected(_) => None,
        }
    }
}

impl<E> AdmissionError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// Rejected by an open circuit rather than by quota.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::Rejected(r) if r.cause() == Cause::CircuitOpen)
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Rejected(r) => Some(r),
            Self::Inner(_) => None,
        }
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Rejected(_) => None,
        }
    }

    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Rejected(_) => None,
        }
    }
}
