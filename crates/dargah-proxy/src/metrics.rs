//! Prometheus metrics for the dargah proxy.
//!
//! Exposed as text on the admin HTTP surface at `/metrics`.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec, Counter,
    CounterVec, Encoder, Gauge, GaugeVec, TextEncoder,
};

/// Total client connections accepted
pub static CLIENT_CONNECTIONS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "dargah_client_connections_total",
        "Total client connections accepted"
    )
    .unwrap()
});

/// Currently open client sessions
pub static ACTIVE_SESSIONS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("dargah_active_sessions", "Currently open client sessions").unwrap()
});

/// Statements observed, by classification
pub static QUERIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "dargah_queries_total",
        "Statements observed, by classification",
        &["class"]
    )
    .unwrap()
});

/// Write statements refused for read-only users
pub static RBAC_DENIALS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "dargah_rbac_denials_total",
        "Write statements refused for read-only users"
    )
    .unwrap()
});

/// Upstream state transitions, by direction
pub static HEALTH_TRANSITIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "dargah_health_transitions_total",
        "Upstream state transitions, by direction",
        &["direction"]
    )
    .unwrap()
});

/// Last observed liveness per upstream (1 healthy, 0 unhealthy)
pub static UPSTREAM_HEALTHY: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "dargah_upstream_healthy",
        "Last observed liveness per upstream",
        &["addr"]
    )
    .unwrap()
});

/// Touch every metric once so /metrics shows zeroes rather than nothing.
pub fn init_metrics() {
    CLIENT_CONNECTIONS_TOTAL.get();
    ACTIVE_SESSIONS.get();
    QUERIES_TOTAL.with_label_values(&["read"]).get();
    RBAC_DENIALS_TOTAL.get();
}

pub fn record_query(class: &str) {
    QUERIES_TOTAL.with_label_values(&[class]).inc();
}

pub fn record_rbac_denial() {
    RBAC_DENIALS_TOTAL.inc();
}

pub fn record_health_transition(now_healthy: bool) {
    let direction = if now_healthy { "recovered" } else { "failed" };
    HEALTH_TRANSITIONS_TOTAL
        .with_label_values(&[direction])
        .inc();
}

pub fn observe_probe(addr: &str, healthy: bool) {
    UPSTREAM_HEALTHY
        .with_label_values(&[addr])
        .set(if healthy { 1.0 } else { 0.0 });
}

/// Render the registry in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
