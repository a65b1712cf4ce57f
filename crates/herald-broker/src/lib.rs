//! ---
//! herald_section: "02-broker-connectivity"
//! herald_subsection: "module"
//! herald_type: "source"
//! herald_scope: "code"
//! herald_description: "Broker connection primitives and pub/sub transports."
//! herald_version: "v0.0.0-prealpha"
//! herald_owner: "tbd"
//! ---
//! A broker connection owns exactly one session with a pub/sub broker. It is
//! created through a [`BrokerConnector`], reports its lifecycle through a
//! [`ConnectionState`] watch channel, and performs single publish round-trips.
//! Handles are never repaired in place: callers replace them and the old
//! handle fails every later operation with [`BrokerError::Closed`].
#![warn(missing_docs)]

use std::time::Duration;

pub mod connection;
pub mod memory;
pub mod reconnect;
pub mod redis;
pub mod resp;

/// Shared result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Failures raised by broker connections.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The session is not established (connecting, reconnecting or abandoned).
    #[error("broker session is not connected")]
    NotConnected,
    /// The handle was closed, typically because it was replaced.
    #[error("broker connection handle was closed")]
    Closed,
    /// Socket level failure.
    #[error("broker io error: {0}")]
    Io(#[from] std::io::Error),
    /// The round-trip did not finish in time.
    #[error("broker round-trip timed out after {0:?}")]
    Timeout(Duration),
    /// The broker answered with an error reply.
    #[error("broker rejected publish: {0}")]
    Rejected(String),
    /// The broker answered with something the codec does not understand.
    #[error("broker protocol violation: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Whether the error leaves the underlying session unusable.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            BrokerError::Io(_) | BrokerError::Timeout(_) | BrokerError::Protocol(_)
        )
    }
}

pub use connection::{
    wait_until_connected, AlwaysReconnect, BrokerConnection, BrokerConnector, ConnectionState,
    ReconnectGate,
};
pub use memory::{Delivery, InMemoryBroker, InMemoryConnector};
pub use reconnect::{ReconnectDecision, ReconnectPolicy};
pub use redis::RedisConnector;
