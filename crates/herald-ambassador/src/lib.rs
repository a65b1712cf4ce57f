//! ---
//! herald_section: "04-publishing-resilience"
//! herald_subsection: "module"
//! herald_type: "source"
//! herald_scope: "code"
//! herald_description: "Circuit breaker, failed-message queue, and publishing facade."
//! herald_version: "v0.0.0-prealpha"
//! herald_owner: "tbd"
//! ---
//! Publishing ambassador: shields callers from an unreliable pub/sub broker.
//!
//! Every publish goes through a [`CircuitBreaker`]. Messages that cannot be
//! delivered land in a bounded [`FailedQueue`] and are redelivered after the
//! next successful publish or whenever the circuit closes. Counters are kept
//! by a [`MetricsCollector`] and optionally mirrored into Prometheus.
#![warn(missing_docs)]

pub mod ambassador;
pub mod breaker;
pub mod error;
pub mod event;
pub mod metrics;
pub mod queue;

pub use ambassador::Ambassador;
pub use breaker::{CircuitBreaker, CircuitState, Transition};
pub use error::{AmbassadorError, Result};
pub use event::{OperationEvent, OperationKind};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use queue::{Admission, FailedMessage, FailedQueue};
