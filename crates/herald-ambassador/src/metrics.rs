//! ---
//! herald_section: "04-publishing-resilience"
//! herald_subsection: "module"
//! herald_type: "source"
//! herald_scope: "code"
//! herald_description: "Circuit breaker, failed-message queue, and publishing facade."
//! herald_version: "v0.0.0-prealpha"
//! herald_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use herald_metrics::AmbassadorMetrics;
use serde::Serialize;

/// Point-in-time view of the ambassador's counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Publishes accepted by the broker on the direct path.
    pub published_count: u64,
    /// Direct publish attempts that failed (not connected or broker error).
    pub failed_count: u64,
    /// Calls diverted to the queue because the circuit was open.
    pub short_circuited_count: u64,
    /// Mean latency of successful direct publishes; 0 before the first one.
    pub avg_latency_ms: f64,
    /// Messages currently waiting for redelivery.
    pub failed_queue_length: usize,
    /// Queued messages delivered by a drain.
    pub redelivered_count: u64,
    /// Messages lost to the queue's overflow policy.
    pub dropped_count: u64,
    /// Whether the circuit is open right now.
    pub circuit_open: bool,
}

/// Lock-free counters, optionally mirrored into a Prometheus exporter.
pub struct MetricsCollector {
    published: AtomicU64,
    failed: AtomicU64,
    short_circuited: AtomicU64,
    redelivered: AtomicU64,
    total_latency_nanos: AtomicU64,
    exporter: Option<AmbassadorMetrics>,
}

impl MetricsCollector {
    /// Collector without an exporter.
    pub fn new() -> Self {
        Self::with_exporter(None)
    }

    /// Collector that mirrors every update into `exporter`.
    pub fn with_exporter(exporter: Option<AmbassadorMetrics>) -> Self {
        Self {
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            short_circuited: AtomicU64::new(0),
            redelivered: AtomicU64::new(0),
            total_latency_nanos: AtomicU64::new(0),
            exporter,
        }
    }

    /// Count a successful direct publish and its round-trip time.
    pub fn record_published(&self, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.total_latency_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.published.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.observe_published(latency);
        }
    }

    /// Count a failed direct publish attempt.
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.inc_failed();
        }
    }

    /// Count a call diverted by the open circuit.
    pub fn record_short_circuited(&self) {
        self.short_circuited.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.inc_short_circuited();
        }
    }

    /// Count a queued message delivered by a drain.
    pub fn record_redelivered(&self) {
        self.redelivered.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.inc_redelivered();
        }
    }

    /// Drops are counted by the queue; only the exporter needs telling.
    pub fn record_dropped(&self, count: u64) {
        if let Some(exporter) = &self.exporter {
            exporter.inc_dropped_by(count);
        }
    }

    /// Export the current queue length.
    pub fn record_queue_length(&self, len: usize) {
        if let Some(exporter) = &self.exporter {
            exporter.set_queue_length(len);
        }
    }

    /// Export a circuit transition.
    pub fn record_circuit(&self, open: bool) {
        if let Some(exporter) = &self.exporter {
            exporter.record_circuit(open);
        }
    }

    /// Read the counters. Never mutates anything.
    pub fn snapshot(
        &self,
        failed_queue_length: usize,
        dropped_count: u64,
        circuit_open: bool,
    ) -> MetricsSnapshot {
        let published_count = self.published.load(Ordering::Relaxed);
        let total_latency_ms = self.total_latency_nanos.load(Ordering::Relaxed) as f64 / 1e6;
        let avg_latency_ms = if published_count == 0 {
            0.0
        } else {
            total_latency_ms / published_count as f64
        };
        MetricsSnapshot {
            published_count,
            failed_count: self.failed.load(Ordering::Relaxed),
            short_circuited_count: self.short_circuited.load(Ordering::Relaxed),
            avg_latency_ms,
            failed_queue_length,
            redelivered_count: self.redelivered.load(Ordering::Relaxed),
            dropped_count,
            circuit_open,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("published", &self.published.load(Ordering::Relaxed))
            .field("failed", &self.failed.load(Ordering::Relaxed))
            .field("exporter", &self.exporter.is_some())
            .finish_non_exhaustive()
    }
}
