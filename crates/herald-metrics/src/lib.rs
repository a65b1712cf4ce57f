//! ---
//! herald_section: "03-observability"
//! herald_subsection: "module"
//! herald_type: "source"
//! herald_scope: "code"
//! herald_description: "Metrics collection and export utilities."
//! herald_version: "v0.0.0-prealpha"
//! herald_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint.
async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    match TextEncoder::new().encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                )],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_reloads_total: IntCounterVec,
    config_load_seconds: Histogram,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "heraldd_starts_total",
            "Total number of times the Herald daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let config_reloads_total = IntCounterVec::new(
            Opts::new(
                "heraldd_config_reloads_total",
                "Configuration reload attempts by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(config_reloads_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "heraldd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_reloads_total,
            config_load_seconds,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn record_reload(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.config_reloads_total.with_label_values(&[outcome]).inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }
}

impl std::fmt::Debug for DaemonMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonMetrics").finish_non_exhaustive()
    }
}

/// Metric family published by the publishing ambassador.
#[derive(Clone)]
pub struct AmbassadorMetrics {
    registry: SharedRegistry,
    published_total: IntCounter,
    failed_total: IntCounter,
    short_circuited_total: IntCounter,
    redelivered_total: IntCounter,
    dropped_total: IntCounter,
    publish_latency_seconds: Histogram,
    failed_queue_length: IntGauge,
    circuit_open: IntGauge,
    circuit_transitions_total: IntCounterVec,
}

impl AmbassadorMetrics {
    /// Register the ambassador metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let published_total = IntCounter::with_opts(Opts::new(
            "herald_messages_published_total",
            "Messages accepted by the broker on the first attempt",
        ))?;
        registry.register(Box::new(published_total.clone()))?;

        let failed_total = IntCounter::with_opts(Opts::new(
            "herald_messages_failed_total",
            "Publish attempts that failed against an unreachable or rejecting broker",
        ))?;
        registry.register(Box::new(failed_total.clone()))?;

        let short_circuited_total = IntCounter::with_opts(Opts::new(
            "herald_messages_short_circuited_total",
            "Publish calls diverted to the failed queue while the circuit was open",
        ))?;
        registry.register(Box::new(short_circuited_total.clone()))?;

        let redelivered_total = IntCounter::with_opts(Opts::new(
            "herald_messages_redelivered_total",
            "Queued messages delivered by a drain pass",
        ))?;
        registry.register(Box::new(redelivered_total.clone()))?;

        let dropped_total = IntCounter::with_opts(Opts::new(
            "herald_messages_dropped_total",
            "Messages discarded by the failed queue overflow policy",
        ))?;
        registry.register(Box::new(dropped_total.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "herald_publish_latency_seconds",
            "Time from publish call to broker acknowledgement, including any connection wait",
        )
        .buckets(prometheus::exponential_buckets(0.0005, 2.0, 16)?);
        let publish_latency_seconds = Histogram::with_opts(histogram_opts)?;
        registry.register(Box::new(publish_latency_seconds.clone()))?;

        let failed_queue_length = IntGauge::with_opts(Opts::new(
            "herald_failed_queue_length",
            "Messages currently waiting in the failed queue",
        ))?;
        registry.register(Box::new(failed_queue_length.clone()))?;

        let circuit_open = IntGauge::with_opts(Opts::new(
            "herald_circuit_open",
            "Indicator (0/1) whether the publishing circuit is open",
        ))?;
        registry.register(Box::new(circuit_open.clone()))?;

        let circuit_transitions_total = IntCounterVec::new(
            Opts::new(
                "herald_circuit_transitions_total",
                "Circuit breaker transitions by target state",
            ),
            &["state"],
        )?;
        registry.register(Box::new(circuit_transitions_total.clone()))?;

        Ok(Self {
            registry,
            published_total,
            failed_total,
            short_circuited_total,
            redelivered_total,
            dropped_total,
            publish_latency_seconds,
            failed_queue_length,
            circuit_open,
            circuit_transitions_total,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn observe_published(&self, latency: Duration) {
        self.published_total.inc();
        self.publish_latency_seconds.observe(latency.as_secs_f64());
    }

    pub fn inc_failed(&self) {
        self.failed_total.inc();
    }

    pub fn inc_short_circuited(&self) {
        self.short_circuited_total.inc();
    }

    pub fn inc_redelivered(&self) {
        self.redelivered_total.inc();
    }

    pub fn inc_dropped_by(&self, count: u64) {
        self.dropped_total.inc_by(count);
    }

    pub fn set_queue_length(&self, len: usize) {
        self.failed_queue_length.set(len as i64);
    }

    /// Track a circuit transition; `open` is the state being entered.
    pub fn record_circuit(&self, open: bool) {
        self.circuit_open.set(if open { 1 } else { 0 });
        let state = if open { "open" } else { "closed" };
        self.circuit_transitions_total
            .with_label_values(&[state])
            .inc();
    }
}

impl std::fmt::Debug for AmbassadorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmbassadorMetrics").finish_non_exhaustive()
    }
}

pub use prometheus;
