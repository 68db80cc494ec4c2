//! Prometheus metrics exposition
//!
//! Registers and exposes the service metrics:
//!
//! - `pool_selections_total` (counter): label `outcome` — emitted by the pool
//! - `pool_selection_duration_seconds` (histogram) — emitted by the pool
//! - `pool_exclusions_total` (counter): label `reason` — emitted by the pool
//! - `pool_outcomes_total` (counter): label `result` — emitted by the pool
//! - `circuit_transitions_total` (counter): label `to` — emitted by the breaker
//! - `api_requests_total` (counter): labels `endpoint`, `status` — emitted here

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Configures `pool_selection_duration_seconds` with explicit buckets so it
/// renders as a Prometheus histogram (with `_bucket` lines for
/// `histogram_quantile()` queries) rather than the default summary. Bucket
/// boundaries are dense under 100ms, the selection latency target, with a
/// coarse tail for pathological store round trips.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "pool_selection_duration_seconds".to_string(),
            ),
            &[
                0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ],
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed HTTP API request.
pub fn record_api_request(endpoint: &'static str, status: u16) {
    metrics::counter!(
        "api_requests_total",
        "endpoint" => endpoint,
        "status" => status.to_string()
    )
    .increment(1);
}
