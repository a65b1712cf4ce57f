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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use herald_common::config::BrokerConfig;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::connection::{
    BrokerConnection, BrokerConnector, ConnectionState, ReconnectGate, StateCell,
};
use crate::reconnect::{ReconnectDecision, ReconnectPolicy};
use crate::resp;
use crate::{BrokerError, Result};

/// Connector producing Redis sessions speaking RESP over TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct RedisConnector;

impl RedisConnector {
    /// Create a new connector.
    pub fn new() -> Self {
        Self
    }
}

impl BrokerConnector for RedisConnector {
    fn connect(
        &self,
        config: &BrokerConfig,
        policy: ReconnectPolicy,
        gate: Arc<dyn ReconnectGate>,
    ) -> Arc<dyn BrokerConnection> {
        Arc::new(RedisConnection::start(config.clone(), policy, gate))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

struct Session {
    stream: BufStream<TcpStream>,
    line: Vec<u8>,
}

impl Session {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream: BufStream::new(stream),
            line: Vec::with_capacity(64),
        }
    }

    async fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<u64> {
        let frame = resp::encode_publish(channel, payload);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;

        self.line.clear();
        let read = self.stream.read_until(b'\n', &mut self.line).await?;
        if read == 0 {
            return Err(BrokerError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "broker closed the connection",
            )));
        }
        resp::publish_receivers(resp::parse_reply_line(&self.line)?)
    }
}

struct Shared {
    endpoint: String,
    state: StateCell,
    session: Mutex<Option<Session>>,
    lost: Notify,
    closed: AtomicBool,
}

impl Shared {
    fn transition(&self, next: ConnectionState) {
        if self.state.advance(next) {
            debug!(endpoint = %self.endpoint, to = %next, "broker connection state changed");
        }
    }
}

/// A Redis session with a background supervisor handling (re)connects.
pub struct RedisConnection {
    shared: Arc<Shared>,
    command_timeout: Duration,
    supervisor: SyncMutex<Option<JoinHandle<()>>>,
}

impl RedisConnection {
    fn start(config: BrokerConfig, policy: ReconnectPolicy, gate: Arc<dyn ReconnectGate>) -> Self {
        let shared = Arc::new(Shared {
            endpoint: config.endpoint(),
            state: StateCell::new(ConnectionState::Connecting),
            session: Mutex::new(None),
            lost: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let command_timeout = config.command_timeout;
        let task = tokio::spawn(supervise(shared.clone(), config, policy, gate));
        Self {
            shared,
            command_timeout,
            supervisor: SyncMutex::new(Some(task)),
        }
    }
}

impl fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConnection")
            .field("endpoint", &self.shared.endpoint)
            .field("state", &self.shared.state.get())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BrokerConnection for RedisConnection {
    fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    async fn publish_once(&self, channel: &str, payload: Bytes) -> Result<u64> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        let mut guard = self.shared.session.lock().await;
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        let Some(session) = guard.as_mut() else {
            return Err(BrokerError::NotConnected);
        };

        let outcome = match timeout(self.command_timeout, session.publish(channel, &payload)).await
        {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout(self.command_timeout)),
        };

        if let Err(err) = &outcome {
            if err.is_session_fatal() {
                warn!(endpoint = %self.shared.endpoint, error = %err, "broker session lost");
                guard.take();
                self.shared.transition(ConnectionState::Reconnecting);
                self.shared.lost.notify_one();
            }
        }
        outcome
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.supervisor.lock().take() {
            task.abort();
        }
        if let Ok(mut session) = self.shared.session.try_lock() {
            session.take();
        }
        self.shared.state.set(ConnectionState::Disconnected);
        debug!(endpoint = %self.shared.endpoint, "broker connection closed");
    }
}

impl Drop for RedisConnection {
    fn drop(&mut self) {
        if let Some(task) = self.supervisor.get_mut().take() {
            task.abort();
        }
    }
}

async fn supervise(
    shared: Arc<Shared>,
    config: BrokerConfig,
    policy: ReconnectPolicy,
    gate: Arc<dyn ReconnectGate>,
) {
    loop {
        match establish(&shared, &config, &policy, gate.as_ref()).await {
            Some(session) => {
                *shared.session.lock().await = Some(session);
                if shared.closed.load(Ordering::Acquire) {
                    shared.session.lock().await.take();
                    return;
                }
                shared.transition(ConnectionState::Connected);
                info!(endpoint = %shared.endpoint, "connected to broker");
            }
            None => {
                shared.transition(ConnectionState::Disconnected);
                return;
            }
        }

        shared.lost.notified().await;
        if shared.closed.load(Ordering::Acquire) {
            return;
        }
        shared.transition(ConnectionState::Reconnecting);
        warn!(endpoint = %shared.endpoint, "reconnecting to broker");
    }
}

async fn establish(
    shared: &Shared,
    config: &BrokerConfig,
    policy: &ReconnectPolicy,
    gate: &dyn ReconnectGate,
) -> Option<Session> {
    let started = Instant::now();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match timeout(config.connect_timeout, TcpStream::connect(shared.endpoint.as_str())).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(endpoint = %shared.endpoint, error = %err, "failed to set TCP_NODELAY");
                }
                return Some(Session::new(stream));
            }
            Ok(Err(err)) => {
                debug!(endpoint = %shared.endpoint, attempt, error = %err, "broker connect attempt failed");
            }
            Err(_) => {
                debug!(endpoint = %shared.endpoint, attempt, timeout = ?config.connect_timeout, "broker connect attempt timed out");
            }
        }

        match policy.next(attempt, started.elapsed(), gate) {
            ReconnectDecision::RetryAfter(delay) => sleep(delay).await,
            ReconnectDecision::Abandon(reason) => {
                warn!(endpoint = %shared.endpoint, attempt, reason, "giving up on broker connection");
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{wait_until_connected, AlwaysReconnect};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config_for(addr: std::net::SocketAddr) -> BrokerConfig {
        BrokerConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..BrokerConfig::default()
        }
    }

    #[tokio::test]
    async fn publishes_against_a_resp_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let expected = resp::encode_publish("todo", b"hello");
            let mut buf = [0u8; 256];
            while received.len() < expected.len() {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0, "client hung up early");
                received.extend_from_slice(&buf[..n]);
            }
            socket.write_all(b":2\r\n").await.unwrap();
            received
        });

        let connection = RedisConnector::new().connect(
            &config_for(addr),
            ReconnectPolicy::with_max_attempts(3),
            Arc::new(AlwaysReconnect),
        );
        assert!(wait_until_connected(connection.as_ref(), Duration::from_secs(5)).await);
        let receivers = connection
            .publish_once("todo", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(receivers, 2);

        let received = server.await.unwrap();
        assert_eq!(received, resp::encode_publish("todo", b"hello").to_vec());
    }

    #[tokio::test]
    async fn error_reply_keeps_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            for reply in [&b"-ERR nope\r\n"[..], &b":0\r\n"[..]] {
                let _ = socket.read(&mut buf).await.unwrap();
                socket.write_all(reply).await.unwrap();
            }
            // hold the socket open until the client is done
            let _ = socket.read(&mut buf).await;
        });

        let connection = RedisConnector::new().connect(
            &config_for(addr),
            ReconnectPolicy::with_max_attempts(3),
            Arc::new(AlwaysReconnect),
        );
        assert!(wait_until_connected(connection.as_ref(), Duration::from_secs(5)).await);
        let first = connection.publish_once("c", Bytes::from_static(b"a")).await;
        assert!(matches!(first, Err(BrokerError::Rejected(_))));
        assert!(connection.is_connected());
        let second = connection.publish_once("c", Bytes::from_static(b"b")).await;
        assert_eq!(second.unwrap(), 0);
    }

    #[tokio::test]
    async fn abandons_after_bounded_attempts() {
        // bind then drop to obtain a port nobody listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let connection = RedisConnector::new().connect(
            &config_for(addr),
            ReconnectPolicy::with_max_attempts(2),
            Arc::new(AlwaysReconnect),
        );
        assert!(!wait_until_connected(connection.as_ref(), Duration::from_secs(5)).await);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(matches!(
            connection.publish_once("c", Bytes::from_static(b"x")).await,
            Err(BrokerError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn closed_handle_fails_cleanly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let connection = RedisConnector::new().connect(
            &config_for(addr),
            ReconnectPolicy::default(),
            Arc::new(AlwaysReconnect),
        );
        assert!(wait_until_connected(connection.as_ref(), Duration::from_secs(5)).await);
        connection.close();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(matches!(
            connection.publish_once("c", Bytes::from_static(b"x")).await,
            Err(BrokerError::Closed)
        ));
    }
}
