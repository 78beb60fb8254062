//! Telemetry for admission decisions.
//!
//! The middleware reports rejections and circuit breakers report state transitions as
//! [`AdmissionEvent`]s. Events flow through [`TelemetrySink`] implementations, which are
//! `tower::Service<AdmissionEvent>`s so they compose with the rest of a tower stack.
//!
//! Sinks are best-effort: a failing or slow sink never changes a decision.

pub mod events;
pub mod sinks;

pub use events::AdmissionEvent;
pub(crate) use sinks::SinkHandle;
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, TelemetrySink};
