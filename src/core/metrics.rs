//! Prometheus metrics for monitoring the gateway.
//!
//! A single process-wide registry tracks the hot path (request counts and
//! latency), admission rejections, event-bus overflow, and replica health.

use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, GaugeVec, HistogramVec,
    IntCounterVec,
};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Total requests by path, provider, model, and status code.
    pub request_count: IntCounterVec,

    /// Request duration histogram in seconds.
    pub request_duration: HistogramVec,

    /// Currently in-flight requests by path.
    pub active_requests: GaugeVec,

    /// Admission rejections by reason (rate_exceeded, cost_exceeded, ...).
    pub rejections: IntCounterVec,

    /// Events dropped because the bus buffer was full, by topic.
    pub events_dropped: IntCounterVec,

    /// Replica refresh failures, by replica name.
    pub replica_refresh_failures: IntCounterVec,

    /// Response-cache outcomes, by result (hit / miss).
    pub cache_lookups: IntCounterVec,

    /// Token usage recorded by the accountant, by provider, model, and kind.
    pub token_usage: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// Safe to call more than once; later calls return the same instance.
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let request_count = register_int_counter_vec!(
            "llm_gateway_requests_total",
            "Total number of proxied requests",
            &["path", "provider", "model", "status_code"]
        )
        .expect("Failed to register request_count metric");

        let request_duration = register_histogram_vec!(
            "llm_gateway_request_duration_seconds",
            "Request duration in seconds",
            &["path", "provider", "model"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
        )
        .expect("Failed to register request_duration metric");

        let active_requests = register_gauge_vec!(
            "llm_gateway_active_requests",
            "Number of in-flight requests",
            &["path"]
        )
        .expect("Failed to register active_requests metric");

        let rejections = register_int_counter_vec!(
            "llm_gateway_rejections_total",
            "Admission rejections by reason",
            &["reason"]
        )
        .expect("Failed to register rejections metric");

        let events_dropped = register_int_counter_vec!(
            "llm_gateway_events_dropped_total",
            "Usage events dropped on bus overflow",
            &["topic"]
        )
        .expect("Failed to register events_dropped metric");

        let replica_refresh_failures = register_int_counter_vec!(
            "llm_gateway_replica_refresh_failures_total",
            "Failed replica refresh attempts",
            &["replica"]
        )
        .expect("Failed to register replica_refresh_failures metric");

        let cache_lookups = register_int_counter_vec!(
            "llm_gateway_cache_lookups_total",
            "Response cache lookups by result",
            &["result"]
        )
        .expect("Failed to register cache_lookups metric");

        let token_usage = register_int_counter_vec!(
            "llm_gateway_tokens_total",
            "Tokens accounted by provider, model, and kind",
            &["provider", "model", "token_type"]
        )
        .expect("Failed to register token_usage metric");

        Metrics {
            request_count,
            request_duration,
            active_requests,
            rejections,
            events_dropped,
            replica_refresh_failures,
            cache_lookups,
            token_usage,
        }
    })
}

/// Get the metrics registry, initializing it on first use.
pub fn get_metrics() -> &'static Metrics {
    init_metrics()
}
