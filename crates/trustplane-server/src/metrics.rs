use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};
use std::sync::LazyLock;

pub static AUTH_ATTEMPTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "trustplane_auth_attempts_total",
        "Authentication attempts",
        &["result"]
    )
    .unwrap()
});

pub static RATE_LIMIT_HITS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "trustplane_rate_limit_hits_total",
        "Requests rejected by the rate limiter",
        &["scope"]
    )
    .unwrap()
});

pub static RATE_LIMIT_STORE_FAILURES: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!(
        "trustplane_rate_limit_store_failures",
        "Counter store failures observed (limiter failing open)"
    )
    .unwrap()
});

pub static PAYMENT_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "trustplane_payment_requests_total",
        "Payment creation requests",
        &["result"]
    )
    .unwrap()
});

pub static PAYMENT_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "trustplane_payment_duration_seconds",
        "Payment creation latency in seconds",
        &["result"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 10.0]
    )
    .unwrap()
});

pub static WEBHOOK_EVENTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "trustplane_webhook_events_total",
        "Webhook deliveries by outcome",
        &["result"]
    )
    .unwrap()
});

pub fn metrics_output() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
