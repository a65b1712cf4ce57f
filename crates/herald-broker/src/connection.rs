//! ---
//! herald_section: "02-broker-connectivity"
//! herald_subsection: "module"
//! herald_type: "source"
//! herald_scope: "code"
//! herald_description: "Broker connection primitives and pub/sub transports."
//! herald_version: "v0.0.0-prealpha"
//! herald_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use herald_common::config::BrokerConfig;
use tokio::sync::watch;

use crate::reconnect::ReconnectPolicy;
use crate::Result;

/// Lifecycle of a single broker connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// First session is being established.
    Connecting,
    /// Session is live and accepts publishes.
    Connected,
    /// Session was lost and the reconnect policy is working on it.
    Reconnecting,
    /// No session and no attempts in progress: abandoned or closed.
    Disconnected,
}

impl ConnectionState {
    /// Short lowercase label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnected => "disconnected",
        }
    }

    /// True when the handle will not make further progress on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consulted by the reconnect loop before each new attempt.
///
/// The publishing circuit implements this so that an open circuit stops the
/// connection layer from hammering a broker already known to be down.
pub trait ReconnectGate: Send + Sync {
    /// Return `false` to abandon reconnecting immediately.
    fn allow_reconnect(&self) -> bool;
}

/// Gate that never vetoes reconnect attempts.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReconnect;

impl ReconnectGate for AlwaysReconnect {
    fn allow_reconnect(&self) -> bool {
        true
    }
}

/// One session with a pub/sub broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync + fmt::Debug {
    /// `host:port` of the broker this handle talks to.
    fn endpoint(&self) -> &str;

    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Subscribe to lifecycle transitions.
    fn watch_state(&self) -> watch::Receiver<ConnectionState>;

    /// Whether a publish attempt may currently succeed.
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Perform exactly one publish and return the broker's receiver count.
    async fn publish_once(&self, channel: &str, payload: Bytes) -> Result<u64>;

    /// Tear the handle down; every later call fails with `Closed`.
    fn close(&self);
}

/// Factory for broker connections.
///
/// `connect` returns immediately with a handle in [`ConnectionState::Connecting`];
/// the session is established in the background. It must be called from
/// within a tokio runtime.
pub trait BrokerConnector: Send + Sync {
    /// Start connecting to the configured broker.
    fn connect(
        &self,
        config: &BrokerConfig,
        policy: ReconnectPolicy,
        gate: Arc<dyn ReconnectGate>,
    ) -> Arc<dyn BrokerConnection>;

    /// Name used in logs.
    fn name(&self) -> &'static str;
}

/// Wait up to `grace` for the connection to reach [`ConnectionState::Connected`].
///
/// Returns early with `false` once the handle gives up for good.
pub async fn wait_until_connected(connection: &dyn BrokerConnection, grace: Duration) -> bool {
    let mut states = connection.watch_state();
    let wait = async move {
        loop {
            let state = *states.borrow_and_update();
            if state == ConnectionState::Connected {
                return true;
            }
            if state.is_terminal() {
                return false;
            }
            if states.changed().await.is_err() {
                return false;
            }
        }
    };
    tokio::time::timeout(grace, wait).await.unwrap_or(false)
}

/// State publisher shared between a handle and its background task.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub(crate) fn new(initial: ConnectionState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Publish a transition; returns the previous state.
    pub(crate) fn set(&self, state: ConnectionState) -> ConnectionState {
        self.tx.send_replace(state)
    }

    /// Like [`StateCell::set`], but never leaves `Disconnected`.
    pub(crate) fn advance(&self, state: ConnectionState) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_terminal() || *current == state {
                return false;
            }
            *current = state;
            true
        })
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}
