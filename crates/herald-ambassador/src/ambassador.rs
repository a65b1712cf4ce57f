//! ---
//! herald_section: "04-publishing-resilience"
//! herald_subsection: "module"
//! herald_type: "source"
//! herald_scope: "code"
//! herald_description: "Circuit breaker, failed-message queue, and publishing facade."
//! herald_version: "v0.0.0-prealpha"
//! herald_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use herald_broker::{
    wait_until_connected, BrokerConnection, BrokerConnector, ConnectionState, ReconnectGate,
    ReconnectPolicy,
};
use herald_common::config::AmbassadorConfig;
use herald_metrics::AmbassadorMetrics;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::error::{AmbassadorError, Result};
use crate::event::OperationEvent;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::queue::{Admission, FailedMessage, FailedQueue};

/// Publishing façade shared by every caller in the process.
///
/// Cloning is cheap; clones drive the same breaker, queue and connection.
/// Construct it inside a tokio runtime: it spawns the connection supervisor
/// and a task that drains the failed queue whenever the circuit closes.
#[derive(Clone)]
pub struct Ambassador {
    inner: Arc<Inner>,
}

struct Inner {
    config: RwLock<AmbassadorConfig>,
    connector: Arc<dyn BrokerConnector>,
    connection: RwLock<Arc<dyn BrokerConnection>>,
    reconnect: AsyncMutex<()>,
    breaker: CircuitBreaker,
    queue: FailedQueue,
    metrics: MetricsCollector,
    draining: AsyncMutex<()>,
    drain_again: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Ambassador {
    /// Build an ambassador and start connecting to the configured broker.
    pub fn new(
        config: AmbassadorConfig,
        connector: Arc<dyn BrokerConnector>,
    ) -> anyhow::Result<Self> {
        Self::build(config, connector, None)
    }

    /// Like [`Ambassador::new`], mirroring counters into a Prometheus family.
    pub fn with_exporter(
        config: AmbassadorConfig,
        connector: Arc<dyn BrokerConnector>,
        exporter: AmbassadorMetrics,
    ) -> anyhow::Result<Self> {
        Self::build(config, connector, Some(exporter))
    }

    fn build(
        config: AmbassadorConfig,
        connector: Arc<dyn BrokerConnector>,
        exporter: Option<AmbassadorMetrics>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let breaker = CircuitBreaker::new(config.failure_threshold, config.reset_timeout);
        let connection = open_connection(connector.as_ref(), &config, &breaker);
        info!(
            connector = connector.name(),
            endpoint = connection.endpoint(),
            channel = %config.channel,
            "publishing ambassador starting"
        );

        let inner = Arc::new(Inner {
            queue: FailedQueue::new(config.queue_capacity, config.overflow),
            config: RwLock::new(config),
            connector,
            connection: RwLock::new(connection),
            reconnect: AsyncMutex::new(()),
            breaker,
            metrics: MetricsCollector::with_exporter(exporter),
            draining: AsyncMutex::new(()),
            drain_again: AtomicBool::new(false),
            listener: Mutex::new(None),
        });
        let listener = spawn_transition_listener(&inner);
        *inner.listener.lock() = Some(listener);
        Ok(Self { inner })
    }

    /// Publish on the configured default channel.
    pub async fn publish(&self, payload: impl Into<Bytes>) -> Result<u64> {
        let channel = self.default_channel();
        self.publish_on(&channel, payload).await
    }

    /// Publish `payload` on `channel`, returning the broker's receiver count.
    ///
    /// On any error the message is already queued for redelivery. Recorded
    /// latency runs from the call to the acknowledgement, so it includes any
    /// wait for the connection.
    pub async fn publish_on(&self, channel: &str, payload: impl Into<Bytes>) -> Result<u64> {
        let started = Instant::now();
        let payload = payload.into();
        let inner = &self.inner;

        if !inner.breaker.allow_request() {
            inner.enqueue(channel, payload);
            inner.metrics.record_short_circuited();
            debug!(channel, queue_len = inner.queue.len(), "circuit open, message queued");
            return Err(AmbassadorError::CircuitOpen);
        }

        let mut connection = inner.current_connection();
        if !connection.is_connected() {
            if connection.state() != ConnectionState::Connecting {
                connection = inner.replace_connection(Some(&connection)).await;
            }
            let grace = inner.config.read().connect_grace;
            if !wait_until_connected(connection.as_ref(), grace).await {
                inner.enqueue(channel, payload);
                inner.metrics.record_failed();
                inner.breaker.record_failure();
                warn!(
                    channel,
                    endpoint = connection.endpoint(),
                    grace = ?grace,
                    "broker not ready, message queued"
                );
                return Err(AmbassadorError::Connection {
                    endpoint: connection.endpoint().to_owned(),
                    grace,
                });
            }
        }

        match connection.publish_once(channel, payload.clone()).await {
            Ok(receivers) => {
                inner.metrics.record_published(started.elapsed());
                inner.breaker.record_success();
                debug!(channel, receivers, "message published");
                if !inner.queue.is_empty() {
                    let inner = inner.clone();
                    tokio::spawn(async move { inner.drain().await });
                }
                Ok(receivers)
            }
            Err(source) => {
                inner.metrics.record_failed();
                inner.enqueue(channel, payload);
                inner.breaker.record_failure();
                warn!(channel, error = %source, "publish failed, message queued");
                Err(AmbassadorError::Publish {
                    channel: channel.to_owned(),
                    source,
                })
            }
        }
    }

    /// Serialize and publish an operation event, logging instead of failing.
    pub async fn publish_event(&self, event: &OperationEvent) {
        let payload = match event.to_payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(trace_id = %event.trace_id, error = %err, "failed to encode operation event");
                return;
            }
        };
        debug!(
            trace_id = %event.trace_id,
            operation = %event.operation_name,
            "publishing operation event"
        );
        if let Err(err) = self.publish(payload).await {
            warn!(
                trace_id = %event.trace_id,
                kind = err.kind(),
                error = %err,
                "operation event not delivered"
            );
        }
    }

    /// Side-effect-free view of the counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        inner.metrics.snapshot(
            inner.queue.len(),
            inner.queue.total_dropped(),
            inner.breaker.is_open(),
        )
    }

    /// Swap in a new configuration. The connection is rebuilt against the new
    /// broker settings; queued messages are kept. The broker kind is fixed by
    /// the connector and cannot change here.
    pub async fn update_configuration(&self, config: AmbassadorConfig) -> anyhow::Result<()> {
        config.validate()?;
        let inner = &self.inner;
        let current = inner.connector.name();
        if config.broker.kind.as_str() != current {
            anyhow::bail!(
                "broker kind cannot change from {} to {} without a restart",
                current,
                config.broker.kind.as_str()
            );
        }
        let _guard = inner.reconnect.lock().await;

        inner
            .breaker
            .reconfigure(config.failure_threshold, config.reset_timeout);
        let dropped = inner.queue.reconfigure(config.queue_capacity, config.overflow);
        if dropped > 0 {
            inner.metrics.record_dropped(dropped);
            warn!(dropped, "queue capacity reduced, oldest messages discarded");
        }
        inner.metrics.record_queue_length(inner.queue.len());

        let fresh = open_connection(inner.connector.as_ref(), &config, &inner.breaker);
        info!(
            endpoint = fresh.endpoint(),
            channel = %config.channel,
            queue_len = inner.queue.len(),
            "ambassador configuration updated"
        );
        *inner.config.write() = config;
        let stale = std::mem::replace(&mut *inner.connection.write(), fresh);
        stale.close();
        Ok(())
    }

    /// Force a fresh connection. Success while the circuit is open ends the
    /// episode early; either way queued messages are drained.
    pub async fn reconnect(&self) -> Result<()> {
        let inner = &self.inner;
        let connection = inner.replace_connection(None).await;
        let grace = inner.config.read().connect_grace;
        if !wait_until_connected(connection.as_ref(), grace).await {
            warn!(endpoint = connection.endpoint(), grace = ?grace, "manual reconnect failed");
            return Err(AmbassadorError::Connection {
                endpoint: connection.endpoint().to_owned(),
                grace,
            });
        }
        info!(endpoint = connection.endpoint(), "manual reconnect succeeded");
        // closing the circuit wakes the listener, which drains
        if !inner.breaker.close_manually() {
            inner.drain().await;
        }
        Ok(())
    }

    /// Redeliver queued messages now, if the circuit and connection allow it.
    pub async fn flush(&self) {
        self.inner.drain().await;
    }

    /// Copy of the queued messages, oldest first.
    pub fn queued(&self) -> Vec<FailedMessage> {
        self.inner.queue.peek()
    }

    /// Circuit breaker guarding the broker.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// Wait up to `grace` for the current connection to come up.
    pub async fn wait_until_ready(&self, grace: Duration) -> bool {
        let connection = self.inner.current_connection();
        wait_until_connected(connection.as_ref(), grace).await
    }

    /// State of the current broker connection.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.current_connection().state()
    }

    /// Channel used by [`Ambassador::publish`].
    pub fn default_channel(&self) -> String {
        self.inner.config.read().channel.clone()
    }

    /// Close the connection and stop background work. Queued messages are
    /// discarded with the last handle.
    pub fn shutdown(&self) {
        if let Some(listener) = self.inner.listener.lock().take() {
            listener.abort();
        }
        self.inner.current_connection().close();
        info!(queue_len = self.inner.queue.len(), "publishing ambassador stopped");
    }
}

impl std::fmt::Debug for Ambassador {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ambassador")
            .field("connection", &self.inner.current_connection())
            .field("breaker", &self.inner.breaker)
            .field("queue", &self.inner.queue)
            .finish_non_exhaustive()
    }
}

fn open_connection(
    connector: &dyn BrokerConnector,
    config: &AmbassadorConfig,
    breaker: &CircuitBreaker,
) -> Arc<dyn BrokerConnection> {
    let gate: Arc<dyn ReconnectGate> = Arc::new(breaker.clone());
    connector.connect(
        &config.broker,
        ReconnectPolicy::with_max_attempts(config.max_retries),
        gate,
    )
}

fn spawn_transition_listener(inner: &Arc<Inner>) -> JoinHandle<()> {
    let mut transitions = inner.breaker.subscribe();
    let inner: Weak<Inner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        loop {
            let closed = match transitions.recv().await {
                Ok(transition) => {
                    if let Some(inner) = inner.upgrade() {
                        inner.metrics.record_circuit(transition.state.is_open());
                    }
                    transition.state == CircuitState::Closed
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "missed circuit transitions, draining anyway");
                    true
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };
            if closed {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.drain().await;
            }
        }
    })
}

impl Inner {
    fn current_connection(&self) -> Arc<dyn BrokerConnection> {
        self.connection.read().clone()
    }

    fn enqueue(&self, channel: &str, payload: Bytes) {
        match self.queue.enqueue(FailedMessage::new(channel, payload)) {
            Admission::Queued => {}
            Admission::Evicted(evicted) => {
                self.metrics.record_dropped(1);
                warn!(
                    channel = %evicted.channel,
                    enqueued_at = %evicted.enqueued_at,
                    "failed queue full, oldest message discarded"
                );
            }
            Admission::Refused(refused) => {
                self.metrics.record_dropped(1);
                warn!(channel = %refused.channel, "failed queue full, message discarded");
            }
        }
        self.metrics.record_queue_length(self.queue.len());
    }

    /// Replace the connection unless someone already replaced `stale`.
    async fn replace_connection(
        &self,
        stale: Option<&Arc<dyn BrokerConnection>>,
    ) -> Arc<dyn BrokerConnection> {
        let _guard = self.reconnect.lock().await;
        let current = self.current_connection();
        if let Some(stale) = stale {
            if !Arc::ptr_eq(stale, &current) {
                return current;
            }
        }

        let fresh = {
            let config = self.config.read();
            open_connection(self.connector.as_ref(), &config, &self.breaker)
        };
        debug!(endpoint = fresh.endpoint(), "replacing broker connection");
        let stale = std::mem::replace(&mut *self.connection.write(), fresh.clone());
        stale.close();
        fresh
    }

    /// Redeliver queued messages. Only one drain runs at a time; a request
    /// arriving mid-drain makes the running one go round again.
    async fn drain(&self) {
        loop {
            let Ok(guard) = self.draining.try_lock() else {
                self.drain_again.store(true, Ordering::SeqCst);
                return;
            };
            self.drain_again.store(false, Ordering::SeqCst);
            self.drain_pass().await;
            drop(guard);
            if !self.drain_again.swap(false, Ordering::SeqCst) {
                return;
            }
        }
    }

    async fn drain_pass(&self) {
        let connection = self.current_connection();
        if self.breaker.is_open() || !connection.is_connected() {
            debug!(
                circuit = self.breaker.state().as_str(),
                connection = %connection.state(),
                "skipping drain"
            );
            return;
        }
        let pending = self.queue.take_all();
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "draining failed queue");

        let mut retry = Vec::new();
        let mut pending = pending.into_iter();
        while let Some(message) = pending.next() {
            if self.breaker.is_open() || !connection.is_connected() {
                retry.push(message);
                retry.extend(pending.by_ref());
                break;
            }
            match connection
                .publish_once(&message.channel, message.payload.clone())
                .await
            {
                Ok(_) => self.metrics.record_redelivered(),
                Err(err) => {
                    debug!(channel = %message.channel, error = %err, "redelivery failed, requeued");
                    retry.push(message);
                }
            }
        }

        let requeued = retry.len();
        let dropped = self.queue.requeue(retry);
        if dropped > 0 {
            self.metrics.record_dropped(dropped);
            warn!(dropped, "failed queue full while requeueing");
        }
        self.metrics.record_queue_length(self.queue.len());
        debug!(requeued, queue_len = self.queue.len(), "drain finished");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
        self.connection.get_mut().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_broker::InMemoryBroker;
    use tokio::time::sleep;

    fn config(threshold: u32) -> AmbassadorConfig {
        AmbassadorConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_secs(10),
            ..AmbassadorConfig::default()
        }
    }

    async fn ready(broker: &InMemoryBroker, config: AmbassadorConfig) -> Ambassador {
        let ambassador = Ambassador::new(config, Arc::new(broker.connector())).unwrap();
        assert!(ambassador.wait_until_ready(Duration::from_secs(1)).await);
        ambassador
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_skips_broker() {
        let broker = InMemoryBroker::new();
        let ambassador = ready(&broker, config(1)).await;
        broker.set_rejecting(true);

        assert!(matches!(
            ambassador.publish("a").await,
            Err(AmbassadorError::Publish { .. })
        ));
        assert!(ambassador.breaker().is_open());
        let attempts = broker.attempts();

        assert!(matches!(
            ambassador.publish("b").await,
            Err(AmbassadorError::CircuitOpen)
        ));
        assert_eq!(broker.attempts(), attempts);
        let metrics = ambassador.metrics();
        assert_eq!(metrics.failed_count, 1);
        assert_eq!(metrics.short_circuited_count, 1);
        assert_eq!(metrics.failed_queue_length, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn success_triggers_drain_of_earlier_failures() {
        let broker = InMemoryBroker::new();
        let ambassador = ready(&broker, config(5)).await;
        broker.set_rejecting(true);
        let _ = ambassador.publish("first").await;
        let _ = ambassador.publish("second").await;
        assert_eq!(ambassador.metrics().failed_queue_length, 2);

        broker.set_rejecting(false);
        ambassador.publish("third").await.unwrap();
        sleep(Duration::from_millis(1)).await;

        assert_eq!(
            broker.payloads_on("log_channel"),
            vec!["third", "first", "second"]
        );
        let metrics = ambassador.metrics();
        assert_eq!(metrics.failed_queue_length, 0);
        assert_eq!(metrics.redelivered_count, 2);
        assert_eq!(metrics.published_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_is_noop_while_disconnected() {
        let broker = InMemoryBroker::new();
        let ambassador = ready(&broker, config(5)).await;
        broker.set_rejecting(true);
        let _ = ambassador.publish("kept").await;
        broker.set_rejecting(false);
        broker.set_reachable(false);
        sleep(Duration::from_millis(1)).await;

        ambassador.flush().await;
        assert_eq!(ambassador.metrics().failed_queue_length, 1);
        assert_eq!(ambassador.queued()[0].payload, "kept");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_connection() {
        let broker = InMemoryBroker::new();
        let ambassador = ready(&broker, config(5)).await;
        ambassador.shutdown();
        assert_eq!(ambassador.connection_state(), ConnectionState::Disconnected);
    }
}
