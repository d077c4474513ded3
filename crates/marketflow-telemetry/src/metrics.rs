//! Prometheus metrics for the marketflow collector.
//!
//! Covers:
//! - Exchange connection state, reconnects, heartbeat score
//! - Feed parsing counters and quality
//! - DataFlow engine throughput, backpressure, sink delivery
//! - WebSocket proxy fan-out
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. If registration fails,
//! it indicates a fatal configuration error (e.g., duplicate metric names)
//! that should cause an immediate crash at startup rather than silent
//! failure. These panics only occur during static initialization, never at
//! runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, register_int_gauge_vec,
    CounterVec, GaugeVec, HistogramVec, IntGaugeVec,
};

// =============================================================================
// Connection (C3)
// =============================================================================

/// Exchange WebSocket state machine current state.
/// Labels: adapter, state (idle/connecting/connected/active/reconnecting/error/closed)
pub static WS_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "marketflow_ws_state",
        "Exchange WebSocket state machine current state (1=active, 0=inactive)",
        &["adapter", "state"]
    )
    .unwrap()
});

/// Total exchange reconnection attempts.
pub static WS_RECONNECT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "marketflow_ws_reconnect_total",
        "Total exchange WebSocket reconnection attempts",
        &["adapter", "reason"]
    )
    .unwrap()
});

/// Heartbeat health score in [0, 1].
pub static WS_HEARTBEAT_SCORE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "marketflow_ws_heartbeat_score",
        "Exchange connection heartbeat health score",
        &["adapter"]
    )
    .unwrap()
});

/// Inbound frames per connection.
pub static WS_MESSAGES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "marketflow_ws_messages_total",
        "Total frames received from the exchange",
        &["adapter"]
    )
    .unwrap()
});

// =============================================================================
// Feed (C5)
// =============================================================================

/// Frame parsing outcomes.
/// Labels: adapter, outcome (accepted/parse_error/unknown_event/validation_error)
pub static FEED_FRAMES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "marketflow_feed_frames_total",
        "Feed frame parsing outcomes",
        &["adapter", "outcome"]
    )
    .unwrap()
});

/// Normalized record quality score distribution.
pub static FEED_QUALITY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "marketflow_feed_quality",
        "Quality score of normalized records",
        &["adapter"],
        vec![0.0, 0.2, 0.4, 0.5, 0.7, 0.8, 0.9, 1.0]
    )
    .unwrap()
});

// =============================================================================
// DataFlow engine (C6)
// =============================================================================

/// Submit outcomes. Labels: engine, outcome (accepted/rejected)
pub static FLOW_SUBMIT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "marketflow_flow_submit_total",
        "DataFlow submit outcomes",
        &["engine", "outcome"]
    )
    .unwrap()
});

/// Messages dropped by backpressure eviction (drop_oldest).
pub static FLOW_BACKPRESSURE_DROPS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "marketflow_flow_backpressure_drops_total",
        "Messages evicted from the ingress queue under backpressure",
        &["engine"]
    )
    .unwrap()
});

/// Messages dropped by the transformer chain.
pub static FLOW_TRANSFORMER_DROPS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "marketflow_flow_transformer_drops_total",
        "Messages dropped by transformers",
        &["engine", "transformer"]
    )
    .unwrap()
});

/// Messages that matched no route.
pub static FLOW_UNROUTED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "marketflow_flow_unrouted_total",
        "Messages that matched no route rule",
        &["engine"]
    )
    .unwrap()
});

/// Messages routed per sink.
pub static FLOW_ROUTED_TO: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "marketflow_flow_routed_total",
        "Messages routed to a sink outbox",
        &["engine", "sink"]
    )
    .unwrap()
});

/// Batches written per sink.
pub static FLOW_SINK_BATCHES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "marketflow_flow_sink_batches_total",
        "Batches handed to sink.write",
        &["engine", "sink"]
    )
    .unwrap()
});

/// Serialized bytes written per sink.
pub static FLOW_SINK_BYTES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "marketflow_flow_sink_bytes_total",
        "Approximate payload bytes handed to sink.write",
        &["engine", "sink"]
    )
    .unwrap()
});

/// Sink write errors / retries / permanent losses.
pub static FLOW_SINK_ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "marketflow_flow_sink_errors_total",
        "sink.write failures",
        &["engine", "sink"]
    )
    .unwrap()
});

pub static FLOW_SINK_RETRIES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "marketflow_flow_sink_retries_total",
        "sink.write retry attempts",
        &["engine", "sink"]
    )
    .unwrap()
});

pub static FLOW_SINK_PERMANENT_LOSS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "marketflow_flow_sink_permanent_loss_total",
        "Messages lost after exhausting retries without a dead-letter target",
        &["engine", "sink"]
    )
    .unwrap()
});

/// Current outbox depth per sink.
pub static FLOW_OUTBOX_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "marketflow_flow_outbox_depth",
        "Current per-sink outbox depth",
        &["engine", "sink"]
    )
    .unwrap()
});

/// Current ingress queue depth.
pub static FLOW_INGRESS_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "marketflow_flow_ingress_depth",
        "Current ingress queue depth",
        &["engine"]
    )
    .unwrap()
});

/// End-to-end latency from submit to sink.write return.
pub static FLOW_E2E_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "marketflow_flow_e2e_latency_ms",
        "Latency from submit to sink.write return in milliseconds",
        &["engine", "sink"],
        vec![0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0]
    )
    .unwrap()
});

// =============================================================================
// WebSocket proxy (C8)
// =============================================================================

/// Messages forwarded to browser clients.
pub static PROXY_FORWARDED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "marketflow_proxy_forwarded_total",
        "Messages forwarded to browser clients",
        &["proxy"]
    )
    .unwrap()
});

/// Messages dropped because a client's outbound queue was full.
pub static PROXY_SLOW_CONSUMER_DROPS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "marketflow_proxy_slow_consumer_drops_total",
        "Forwards dropped on full client outbound queues",
        &["proxy"]
    )
    .unwrap()
});

/// Serialization time of forwarded messages.
pub static PROXY_SERIALIZE_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "marketflow_proxy_serialize_ms",
        "Serialization time of forwarded messages in milliseconds",
        &["proxy"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    )
    .unwrap()
});

/// Distribution of fan-out sizes per forwarded message.
pub static PROXY_FANOUT_SIZE: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "marketflow_proxy_fanout_size",
        "Number of recipients per forwarded message",
        &["proxy"],
        vec![0.0, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 500.0, 1000.0]
    )
    .unwrap()
});

/// Currently connected browser clients.
pub static PROXY_CLIENTS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "marketflow_proxy_clients",
        "Currently connected browser clients",
        &["proxy"]
    )
    .unwrap()
});

// =============================================================================
// Adapters (C9/C10)
// =============================================================================

/// Adapter lifecycle status as a numeric gauge (0..3).
pub static ADAPTER_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "marketflow_adapter_status",
        "Adapter lifecycle status (0=stopped, 1=created, 2=initialized, 3=running)",
        &["adapter"]
    )
    .unwrap()
});

/// Set the single active state for a connection state gauge family.
pub fn set_ws_state(adapter: &str, states: &[&str], active: &str) {
    for state in states {
        let v = if *state == active { 1.0 } else { 0.0 };
        WS_STATE.with_label_values(&[adapter, state]).set(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        // Touch each family; a duplicate registration would panic.
        WS_RECONNECT_TOTAL
            .with_label_values(&["binance", "heartbeat_lost"])
            .inc();
        FLOW_SUBMIT_TOTAL
            .with_label_values(&["main", "accepted"])
            .inc();
        PROXY_FANOUT_SIZE.with_label_values(&["ws"]).observe(3.0);
        ADAPTER_STATUS.with_label_values(&["binance"]).set(3);
    }

    #[test]
    fn test_set_ws_state_exclusive() {
        let states = ["idle", "connecting", "active"];
        set_ws_state("test", &states, "active");
        assert_eq!(
            WS_STATE.with_label_values(&["test", "active"]).get(),
            1.0
        );
        assert_eq!(WS_STATE.with_label_values(&["test", "idle"]).get(), 0.0);
    }
}
