//! Prometheus metrics for the detector.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge_vec, register_histogram_vec, Counter,
    CounterVec, Encoder, GaugeVec, HistogramVec, TextEncoder,
};

/// Datagrams received by the gateway, by decode status
pub static DATAGRAMS_RECEIVED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "scada_ids_datagrams_received_total",
        "Datagrams received by decode status",
        &["status"]
    )
    .unwrap()
});

/// Packets handed to each engine queue
pub static PACKETS_PUBLISHED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "scada_ids_packets_published_total",
        "Packets delivered to an engine queue",
        &["engine"]
    )
    .unwrap()
});

/// Packets dropped because an engine queue was full
pub static PACKETS_DROPPED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "scada_ids_packets_dropped_total",
        "Packets dropped on a full engine queue",
        &["engine"]
    )
    .unwrap()
});

/// Queue depth per engine, sampled on publish
pub static QUEUE_DEPTH: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "scada_ids_queue_depth",
        "Current engine queue depth",
        &["engine"]
    )
    .unwrap()
});

/// Windows scored, by ensemble verdict
pub static WINDOWS_SCORED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "scada_ids_windows_scored_total",
        "Aggregate windows scored by verdict",
        &["verdict"]
    )
    .unwrap()
});

pub static OUT_OF_ORDER: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "scada_ids_out_of_order_total",
        "Packets rejected by the aggregator as out of order"
    )
    .unwrap()
});

pub static BATCHES_SCORED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "scada_ids_batches_scored_total",
        "Per-packet batches scored"
    )
    .unwrap()
});

pub static ANOMALIES_REPORTED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "scada_ids_anomalous_packets_total",
        "Distinct anomalous packet summaries reported"
    )
    .unwrap()
});

/// Inference latency histogram
pub static INFERENCE_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "scada_ids_inference_latency_seconds",
        "Model inference latency in seconds",
        &["model"],
        vec![0.00001, 0.0001, 0.0005, 0.001, 0.005, 0.05, 0.5]
    )
    .unwrap()
});

/// Initialize all metrics (call at startup)
pub fn init() {
    // Touch lazy statics to ensure they're registered
    let _ = &*DATAGRAMS_RECEIVED;
    let _ = &*PACKETS_PUBLISHED;
    let _ = &*PACKETS_DROPPED;
    let _ = &*QUEUE_DEPTH;
    let _ = &*WINDOWS_SCORED;
    let _ = &*OUT_OF_ORDER;
    let _ = &*BATCHES_SCORED;
    let _ = &*ANOMALIES_REPORTED;
    let _ = &*INFERENCE_LATENCY;
}

/// Get metrics in Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_datagram(status: &str) {
    DATAGRAMS_RECEIVED.with_label_values(&[status]).inc();
}

pub fn record_published(engine: &str, depth: usize) {
    PACKETS_PUBLISHED.with_label_values(&[engine]).inc();
    QUEUE_DEPTH.with_label_values(&[engine]).set(depth as f64);
}

pub fn record_dropped(engine: &str) {
    PACKETS_DROPPED.with_label_values(&[engine]).inc();
}

pub fn record_window(verdict: &str) {
    WINDOWS_SCORED.with_label_values(&[verdict]).inc();
}
