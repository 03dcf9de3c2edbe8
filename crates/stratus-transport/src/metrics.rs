//! Transport metrics shared by every connection of a process.

use prometheus::{Encoder, HistogramOpts, HistogramVec, Registry, TextEncoder};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::Result;

const LIFESPAN_BUCKETS: &[f64] = &[
    0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0, 14400.0,
];

#[derive(Debug, Clone, Default, Serialize)]
/// Snapshot of transport metrics at a point in time.
pub struct MetricsSnapshot {
    /// Number of connections that became active.
    pub connections_opened: u64,
    /// Number of connections that became inactive.
    pub connections_closed: u64,
    /// Number of currently active connections.
    pub active_connections: u64,
    /// Number of streams accepted.
    pub streams_opened: u64,
    /// Number of streams refused by the request limit or a drain.
    pub streams_refused: u64,
    /// Number of requests aborted.
    pub requests_aborted: u64,
    /// Number of requests failed for exceeding the body limit.
    pub aggregation_failures: u64,
    /// Number of graceful drains started.
    pub drains_started: u64,
    /// Number of connections closed without a drain wait.
    pub immediate_disconnects: u64,
    /// Number of keep-alive pings sent.
    pub pings_sent: u64,
    /// Number of keep-alive pings that went unacknowledged.
    pub ping_timeouts: u64,
}

/// Thread-safe transport metrics collector.
///
/// Counters are plain atomics; the connection lifespan distribution is kept
/// in a Prometheus histogram so it can be scraped.
pub struct TransportMetrics {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    streams_opened: AtomicU64,
    streams_refused: AtomicU64,
    requests_aborted: AtomicU64,
    aggregation_failures: AtomicU64,
    drains_started: AtomicU64,
    immediate_disconnects: AtomicU64,
    pings_sent: AtomicU64,
    ping_timeouts: AtomicU64,
    registry: Registry,
    lifespan: HistogramVec,
}

impl std::fmt::Debug for TransportMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl TransportMetrics {
    /// Creates a collector with its own Prometheus registry.
    pub fn new() -> Result<Self> {
        let lifespan = HistogramVec::new(
            HistogramOpts::new(
                "stratus_connection_lifespan_seconds",
                "Time between keep-alive initialization and teardown of a connection",
            )
            .buckets(LIFESPAN_BUCKETS.to_vec()),
            &["protocol"],
        )?;
        let registry = Registry::new();
        registry.register(Box::new(lifespan.clone()))?;

        Ok(Self {
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            streams_opened: AtomicU64::new(0),
            streams_refused: AtomicU64::new(0),
            requests_aborted: AtomicU64::new(0),
            aggregation_failures: AtomicU64::new(0),
            drains_started: AtomicU64::new(0),
            immediate_disconnects: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
            ping_timeouts: AtomicU64::new(0),
            registry,
            lifespan,
        })
    }

    /// Increments the connections opened counter.
    pub fn inc_connections_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the connections closed counter.
    pub fn inc_connections_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the streams opened counter.
    pub fn inc_streams_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the streams refused counter.
    pub fn inc_streams_refused(&self) {
        self.streams_refused.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the aborted requests counter.
    pub fn inc_requests_aborted(&self) {
        self.requests_aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the aggregation failures counter.
    pub fn inc_aggregation_failures(&self) {
        self.aggregation_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the drains started counter.
    pub fn inc_drains_started(&self) {
        self.drains_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the immediate disconnects counter.
    pub fn inc_immediate_disconnects(&self) {
        self.immediate_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the pings sent counter.
    pub fn inc_pings_sent(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the ping timeouts counter.
    pub fn inc_ping_timeouts(&self) {
        self.ping_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the lifespan of a connection speaking `protocol`.
    pub fn observe_lifespan(&self, protocol: &str, lifespan: Duration) {
        self.lifespan
            .with_label_values(&[protocol])
            .observe(lifespan.as_secs_f64());
    }

    /// Returns the number of lifespans recorded for `protocol`.
    pub fn lifespan_samples(&self, protocol: &str) -> u64 {
        self.lifespan
            .with_label_values(&[protocol])
            .get_sample_count()
    }

    /// Renders the Prometheus registry in the text exposition format.
    pub fn render_prometheus(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);
        MetricsSnapshot {
            connections_opened: opened,
            connections_closed: closed,
            active_connections: opened.saturating_sub(closed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            streams_refused: self.streams_refused.load(Ordering::Relaxed),
            requests_aborted: self.requests_aborted.load(Ordering::Relaxed),
            aggregation_failures: self.aggregation_failures.load(Ordering::Relaxed),
            drains_started: self.drains_started.load(Ordering::Relaxed),
            immediate_disconnects: self.immediate_disconnects.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            ping_timeouts: self.ping_timeouts.load(Ordering::Relaxed),
        }
    }
}
