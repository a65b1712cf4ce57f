//! ---
//! herald_section: "04-publishing-resilience"
//! herald_subsection: "module"
//! herald_type: "source"
//! herald_scope: "code"
//! herald_description: "Circuit breaker, failed-message queue, and publishing facade."
//! herald_version: "v0.0.0-prealpha"
//! herald_owner: "tbd"
//! ---
use std::time::Duration;

use herald_broker::BrokerError;

/// Shared result type for ambassador operations.
pub type Result<T> = std::result::Result<T, AmbassadorError>;

/// Reasons a publish did not reach the broker.
///
/// In every case the message has already been handed to the failed queue.
#[derive(Debug, thiserror::Error)]
pub enum AmbassadorError {
    /// The circuit is open; the broker was not contacted.
    #[error("circuit breaker is open, message queued for retry")]
    CircuitOpen,
    /// No live session could be obtained within the grace period.
    #[error("broker at {endpoint} not ready within {grace:?}, message queued for retry")]
    Connection {
        /// Broker the ambassador tried to reach.
        endpoint: String,
        /// How long the call waited.
        grace: Duration,
    },
    /// The broker round-trip failed.
    #[error("publish on channel {channel} failed, message queued for retry")]
    Publish {
        /// Target channel of the failed publish.
        channel: String,
        /// Underlying broker failure.
        #[source]
        source: BrokerError,
    },
}

impl AmbassadorError {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AmbassadorError::CircuitOpen => "circuit_open",
            AmbassadorError::Connection { .. } => "connection",
            AmbassadorError::Publish { .. } => "publish",
        }
    }
}
