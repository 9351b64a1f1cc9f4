//! Metrics sink abstraction and the metric names the bridge records.
//!
//! Components take an `Arc<dyn MetricsSink>` and never depend on a concrete
//! exporter. [`InMemoryMetrics`] backs the tests and the periodic summary the
//! binary logs; [`TracingMetrics`] forwards every sample as a debug event.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

/// Counter: one per state change, labelled `from`/`to`
pub const CONNECTION_STATE_TRANSITION: &str = "connection.state_transition";
/// Counter: handshake attempts, labelled `outcome`
pub const CONNECTION_HANDSHAKE: &str = "connection.handshake";
/// Histogram: backoff slept before a handshake retry
pub const CONNECTION_HANDSHAKE_RETRY_DELAY_MS: &str = "connection.handshake_retry_delay_ms";
/// Counter: reconnect runs, labelled `reason` and `outcome`
pub const CONNECTION_RECONNECT: &str = "connection.reconnect";
/// Counter: heartbeats, labelled `outcome` (sent, acked, timeout, peer_ping)
pub const CONNECTION_HEARTBEAT: &str = "connection.heartbeat";
/// Histogram: heartbeat round trip
pub const CONNECTION_HEARTBEAT_RTT_MS: &str = "connection.heartbeat_rtt_ms";
/// Histogram: time the state lock was held
pub const CONNECTION_STATE_LOCK_HOLD_MS: &str = "connection.state_lock_hold_ms";
/// Counter: malformed inbound frames skipped by the router
pub const CONNECTION_DECODE_ERROR: &str = "connection.decode_error";
/// Counter: data frames dropped because the consumer queue was full
pub const CONNECTION_DATA_QUEUE_DROPPED: &str = "connection.data_queue_dropped";
/// Counter: reliable sends, labelled `outcome`
pub const TRANSPORT_SEND: &str = "transport.send";
/// Histogram: send-to-ACK latency
pub const TRANSPORT_ACK_LATENCY_MS: &str = "transport.ack_latency_ms";
/// Counter: mesh queries, labelled `outcome`
pub const DEVICES_MESH_REQUEST: &str = "devices.mesh_request";
/// Histogram: mesh query duration
pub const DEVICES_MESH_REQUEST_LATENCY_MS: &str = "devices.mesh_request_latency_ms";
/// Counter: single-device queries, labelled `outcome`
pub const DEVICES_DEVICE_REQUEST: &str = "devices.device_request";
/// Histogram: single-device query duration
pub const DEVICES_DEVICE_REQUEST_LATENCY_MS: &str = "devices.device_request_latency_ms";
/// Counter: entries pushed out of the device cache
pub const DEVICES_CACHE_EVICTION: &str = "devices.cache_eviction";

/// Label set attached to a sample
pub type Labels<'a> = &'a [(&'a str, &'a str)];

/// Destination for counters and histogram samples
pub trait MetricsSink: Send + Sync + Debug {
    /// Add one to a counter
    fn increment(&self, name: &str, labels: Labels<'_>);
    /// Record one histogram sample
    fn observe(&self, name: &str, value: f64, labels: Labels<'_>);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &str, _labels: Labels<'_>) {}
    fn observe(&self, _name: &str, _value: f64, _labels: Labels<'_>) {}
}

/// Emits each sample as a `tracing` debug event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment(&self, name: &str, labels: Labels<'_>) {
        debug!(metric = name, labels = ?labels, "counter +1");
    }

    fn observe(&self, name: &str, value: f64, labels: Labels<'_>) {
        debug!(metric = name, value, labels = ?labels, "histogram sample");
    }
}

/// Shared handle to a sink that records nothing
pub fn noop() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetrics)
}

/// Aggregate of the samples recorded under one key
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistogramSummary {
    /// Number of samples
    pub count: u64,
    /// Sum of all samples
    pub sum: f64,
    /// Smallest sample
    pub min: f64,
    /// Largest sample
    pub max: f64,
}

impl HistogramSummary {
    fn record(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }

    /// Mean of the recorded samples, zero when empty
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Point-in-time copy of an [`InMemoryMetrics`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Counters keyed by `name` and `name{k=v,...}`
    pub counters: BTreeMap<String, u64>,
    /// Histograms keyed the same way
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Process-local aggregation of counters and histograms.
///
/// Every sample is recorded twice: under the bare metric name and under the
/// name qualified by its labels, so callers can query either total.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: DashMap<String, u64>,
    histograms: DashMap<String, HistogramSummary>,
}

fn labelled_key(name: &str, labels: Labels<'_>) -> Option<String> {
    if labels.is_empty() {
        return None;
    }
    let rendered: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    Some(format!("{}{{{}}}", name, rendered.join(",")))
}

impl InMemoryMetrics {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Total for a counter across all label sets
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).map(|v| *v).unwrap_or(0)
    }

    /// Total for a counter with exactly these labels, in this order
    pub fn counter_with(&self, name: &str, labels: Labels<'_>) -> u64 {
        let key = labelled_key(name, labels).unwrap_or_else(|| name.to_string());
        self.counters.get(&key).map(|v| *v).unwrap_or(0)
    }

    /// Summary of a histogram across all label sets
    pub fn histogram(&self, name: &str) -> Option<HistogramSummary> {
        self.histograms.get(name).map(|h| h.clone())
    }

    /// Copy out every counter and histogram
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self
                .counters
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            histograms: self
                .histograms
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &str, labels: Labels<'_>) {
        *self.counters.entry(name.to_string()).or_insert(0) += 1;
        if let Some(key) = labelled_key(name, labels) {
            *self.counters.entry(key).or_insert(0) += 1;
        }
    }

    fn observe(&self, name: &str, value: f64, labels: Labels<'_>) {
        self.histograms
            .entry(name.to_string())
            .or_default()
            .record(value);
        if let Some(key) = labelled_key(name, labels) {
            self.histograms.entry(key).or_default().record(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_by_name_and_labels() {
        let metrics = InMemoryMetrics::new();
        metrics.increment(TRANSPORT_SEND, &[("outcome", "success")]);
        metrics.increment(TRANSPORT_SEND, &[("outcome", "success")]);
        metrics.increment(TRANSPORT_SEND, &[("outcome", "timeout")]);

        assert_eq!(metrics.counter(TRANSPORT_SEND), 3);
        assert_eq!(metrics.counter_with(TRANSPORT_SEND, &[("outcome", "success")]), 2);
        assert_eq!(metrics.counter_with(TRANSPORT_SEND, &[("outcome", "timeout")]), 1);
        assert_eq!(metrics.counter(CONNECTION_RECONNECT), 0);
    }

    #[test]
    fn test_histogram_summary() {
        let metrics = InMemoryMetrics::new();
        metrics.observe(TRANSPORT_ACK_LATENCY_MS, 10.0, &[]);
        metrics.observe(TRANSPORT_ACK_LATENCY_MS, 30.0, &[]);

        let summary = metrics.histogram(TRANSPORT_ACK_LATENCY_MS).unwrap();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.min, 10.0);
        assert_eq!(summary.max, 30.0);
        assert_eq!(summary.mean(), 20.0);
    }

    #[test]
    fn test_snapshot_contains_labelled_keys() {
        let metrics = InMemoryMetrics::new();
        metrics.increment(CONNECTION_HEARTBEAT, &[("outcome", "sent")]);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.counters.get("connection.heartbeat{outcome=sent}"), Some(&1));
    }
}
