//! ---
//! herald_section: "02-broker-connectivity"
//! herald_subsection: "module"
//! herald_type: "source"
//! herald_scope: "code"
//! herald_description: "Broker connection primitives and pub/sub transports."
//! herald_version: "v0.0.0-prealpha"
//! herald_owner: "tbd"
//! ---
//! In-process broker used by tests and by `heraldd` with `kind = "memory"`.
//!
//! Reachability is a switch: while it is off every handle sits in
//! `Connecting`/`Reconnecting` and publishes fail with `NotConnected`. The
//! reconnect policy and gate are not consulted; handles wait for the switch
//! indefinitely until closed.
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use herald_common::config::BrokerConfig;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::connection::{
    BrokerConnection, BrokerConnector, ConnectionState, ReconnectGate, StateCell,
};
use crate::reconnect::ReconnectPolicy;
use crate::{BrokerError, Result};

/// A message accepted by the in-memory broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel the message was published on.
    pub channel: String,
    /// Raw payload bytes.
    pub payload: Bytes,
}

struct BrokerInner {
    reachable: watch::Sender<bool>,
    rejecting: AtomicBool,
    latency: Mutex<Duration>,
    subscribers: Mutex<HashMap<String, u64>>,
    deliveries: Mutex<Vec<Delivery>>,
    attempts: AtomicU64,
    connections: AtomicU64,
}

/// Shared handle to an in-process pub/sub broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    /// Create a reachable broker that accepts every publish.
    pub fn new() -> Self {
        let (reachable, _rx) = watch::channel(true);
        Self {
            inner: Arc::new(BrokerInner {
                reachable,
                rejecting: AtomicBool::new(false),
                latency: Mutex::new(Duration::ZERO),
                subscribers: Mutex::new(HashMap::new()),
                deliveries: Mutex::new(Vec::new()),
                attempts: AtomicU64::new(0),
                connections: AtomicU64::new(0),
            }),
        }
    }

    /// Toggle whether connections can reach the broker.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.send_replace(reachable);
    }

    /// Whether the broker is currently reachable.
    pub fn is_reachable(&self) -> bool {
        *self.inner.reachable.borrow()
    }

    /// While set, connected publishes fail with [`BrokerError::Rejected`].
    pub fn set_rejecting(&self, rejecting: bool) {
        self.inner.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Receiver count reported for publishes on `channel`.
    pub fn set_subscribers(&self, channel: &str, count: u64) {
        self.inner
            .subscribers
            .lock()
            .insert(channel.to_owned(), count);
    }

    /// Simulated round-trip time for every publish.
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock() = latency;
    }

    /// Every accepted message, in acceptance order.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.inner.deliveries.lock().clone()
    }

    /// Payloads accepted on `channel`, decoded lossily as UTF-8.
    pub fn payloads_on(&self, channel: &str) -> Vec<String> {
        self.inner
            .deliveries
            .lock()
            .iter()
            .filter(|delivery| delivery.channel == channel)
            .map(|delivery| String::from_utf8_lossy(&delivery.payload).into_owned())
            .collect()
    }

    /// Publish attempts made while connected, accepted or rejected.
    pub fn attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Connection handles opened against this broker.
    pub fn connections(&self) -> u64 {
        self.inner.connections.load(Ordering::SeqCst)
    }

    /// Connector bound to this broker.
    pub fn connector(&self) -> InMemoryConnector {
        InMemoryConnector {
            broker: self.clone(),
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("reachable", &self.is_reachable())
            .field("attempts", &self.attempts())
            .finish_non_exhaustive()
    }
}

/// Connector handing out [`InMemoryBroker`] sessions.
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
}

impl BrokerConnector for InMemoryConnector {
    fn connect(
        &self,
        config: &BrokerConfig,
        _policy: ReconnectPolicy,
        _gate: Arc<dyn ReconnectGate>,
    ) -> Arc<dyn BrokerConnection> {
        self.broker.inner.connections.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(StateCell::new(ConnectionState::Connecting));
        let task = tokio::spawn(follow_reachability(
            state.clone(),
            self.broker.inner.reachable.subscribe(),
        ));
        Arc::new(InMemoryConnection {
            broker: self.broker.clone(),
            endpoint: config.endpoint(),
            state,
            supervisor: Mutex::new(Some(task)),
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

async fn follow_reachability(state: Arc<StateCell>, mut reachable: watch::Receiver<bool>) {
    loop {
        let up = *reachable.borrow_and_update();
        let next = match (up, state.get()) {
            (true, _) => ConnectionState::Connected,
            (false, ConnectionState::Connecting) => ConnectionState::Connecting,
            (false, _) => ConnectionState::Reconnecting,
        };
        state.advance(next);
        if reachable.changed().await.is_err() {
            return;
        }
    }
}

struct InMemoryConnection {
    broker: InMemoryBroker,
    endpoint: String,
    state: Arc<StateCell>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for InMemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryConnection")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn publish_once(&self, channel: &str, payload: Bytes) -> Result<u64> {
        match self.state.get() {
            ConnectionState::Connected => {}
            ConnectionState::Disconnected => return Err(BrokerError::Closed),
            _ => return Err(BrokerError::NotConnected),
        }
        let inner = &self.broker.inner;
        inner.attempts.fetch_add(1, Ordering::SeqCst);

        let latency = *inner.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.state.get() == ConnectionState::Disconnected {
            return Err(BrokerError::Closed);
        }
        if inner.rejecting.load(Ordering::SeqCst) {
            return Err(BrokerError::Rejected("broker is rejecting publishes".into()));
        }

        let receivers = inner
            .subscribers
            .lock()
            .get(channel)
            .copied()
            .unwrap_or(0);
        inner.deliveries.lock().push(Delivery {
            channel: channel.to_owned(),
            payload,
        });
        Ok(receivers)
    }

    fn close(&self) {
        if let Some(task) = self.supervisor.lock().take() {
            task.abort();
        }
        self.state.set(ConnectionState::Disconnected);
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        if let Some(task) = self.supervisor.get_mut().take() {
            task.abort();
        }
    }
}
