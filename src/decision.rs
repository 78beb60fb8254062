//! Admission decisions and the metadata callers surface to clients.

use std::fmt;

/// Why a decision came out the way it did.
///
/// Circuit-open and store-unavailable outcomes point at a downstream problem rather than at
/// the subject, so they are kept apart from plain quota exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cause {
    /// The subject had quota left.
    Admitted,
    /// The subject used up its quota.
    QuotaExhausted,
    /// A circuit breaker is rejecting traffic without consulting the limiter.
    CircuitOpen,
    /// The backing store failed or timed out; `allowed` reflects the failure policy.
    StoreUnavailable,
}

impl Cause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cause::Admitted => "admitted",
            Cause::QuotaExhausted => "quota_exhausted",
            Cause::CircuitOpen => "circuit_open",
            Cause::StoreUnavailable => "store_unavailable",
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one admission check. Computed per call and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the operation may proceed.
    pub allowed: bool,
    /// Limit in force when the decision was made.
    pub limit: u32,
    /// Quota left after this decision; always 0 on rejection.
    pub remaining: u32,
    /// Clock reading (epoch millis on the system clock) at which the subject is next admitted.
    pub reset_at_millis: u64,
    pub cause: Cause,
}

impl Decision {
    pub fn admitted(limit: u32, remaining: u32, reset_at_millis: u64) -> Self {
        Self { allowed: true, limit, remaining, reset_at_millis, cause: Cause::Admitted }
    }

    pub fn rejected(limit: u32, reset_at_millis: u64, cause: Cause) -> Self {
        Self { allowed: false, limit, remaining: 0, reset_at_millis, cause }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Rejected because a breaker is open.
    pub fn is_circuit_open(&self) -> bool {
        !self.allowed && self.cause == Cause::CircuitOpen
    }

    /// Decided by failure policy rather than by counting.
    pub fn is_degraded(&self) -> bool {
        self.cause == Cause::StoreUnavailable
    }

    /// `reset_at` rounded up to whole seconds, as sent in `X-RateLimit-Reset`.
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at_millis.div_ceil(1_000)
    }

    /// Seconds until the reset point, at least 1, for `Retry-After`.
    pub fn retry_after_secs(&self, now_millis: u64) -> u64 {
        self.reset_at_millis.saturating_sub(now_millis).div_ceil(1_000).max(1)
    }
}
