use crate::decision::Cause;
use std::fmt;

/// Events emitted by the admission layer and circuit breakers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    /// A request was refused by the middleware.
    Rejected {
        /// Subject key the decision was made for
        key: String,
        /// Why the request was refused
        cause: Cause,
        /// Limit in force at decision time
        limit: u32,
        /// When quota is expected back, epoch milliseconds
        reset_at_millis: u64,
    },
    /// A circuit opened, either after `failure_count` rejections or a failed probe.
    ///
    /// Checks against it are answered without consulting the wrapped limiter.
    CircuitOpened {
        /// Circuit identity: `*` for a shared breaker, otherwise the subject key
        circuit: String,
        /// Failures counted when the circuit opened
        failure_count: usize,
    },
    /// A circuit left the open state and let one probe through.
    CircuitHalfOpen {
        circuit: String,
    },
    /// A circuit closed after a successful probe or an explicit reset.
    CircuitClosed {
        circuit: String,
    },
}

impl AdmissionEvent {
    /// Short machine-friendly name, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionEvent::Rejected { .. } => "rejected",
            AdmissionEvent::CircuitOpened { .. } => "circuit_opened",
            AdmissionEvent::CircuitHalfOpen { .. } => "circuit_half_open",
            AdmissionEvent::CircuitClosed { .. } => "circuit_closed",
        }
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Rejected { key, cause, limit, reset_at_millis } => {
                write!(f, "Rejected(key={}, cause={}, limit={}, reset_at={})", key, cause, limit, reset_at_millis)
            }
            AdmissionEvent::CircuitOpened { circuit, failure_count } => {
                write!(f, "CircuitOpened({}, failures={})", circuit, failure_count)
            }
            AdmissionEvent::CircuitHalfOpen { circuit } => write!(f, "CircuitHalfOpen({})", circuit),
            AdmissionEvent::CircuitClosed { circuit } => write!(f, "CircuitClosed({})", circuit),
        }
    }
}
