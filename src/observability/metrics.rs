//! Prometheus export of the aggregator's metrics.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use tracing::info;

use crate::core::error::{AggregatorError, AggregatorResult};

const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Install the global recorder and serve `/metrics` on `address`.
/// Must be called from within a Tokio runtime.
pub fn install_prometheus(address: &str) -> AggregatorResult<()> {
    let address: SocketAddr = address
        .parse()
        .map_err(|e| AggregatorError::config(format!("Invalid metrics address '{}': {}", address, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(address)
        .set_buckets_for_metric(
            Matcher::Full("aggregator_proxy_request_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )
        .map_err(|e| AggregatorError::config(format!("Failed to set histogram buckets: {}", e)))?
        .install()
        .map_err(|e| AggregatorError::config(format!("Failed to install metrics exporter: {}", e)))?;

    describe_metrics();
    info!(address = %address, "Prometheus metrics exporter listening");
    Ok(())
}

pub fn describe_metrics() {
    describe_counter!("aggregator_workqueue_adds_total", "Items added to a work queue");
    describe_counter!("aggregator_workqueue_retries_total", "Rate-limited requeues");
    describe_gauge!("aggregator_workqueue_depth", "Items waiting in a work queue");
    describe_counter!("aggregator_backend_syncs_total", "Backend reconciliations by result");
    describe_counter!("aggregator_proxy_requests_total", "Proxied requests by backend and status class");
    describe_histogram!(
        "aggregator_proxy_request_duration_seconds",
        Unit::Seconds,
        "Time to response headers for proxied requests"
    );
    describe_counter!("aggregator_upgraded_sessions_total", "Upgraded connections spliced to a backend");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_address() {
        assert!(matches!(
            install_prometheus("not-an-address"),
            Err(AggregatorError::Configuration { .. })
        ));
    }

    #[test]
    fn test_describe_without_recorder() {
        describe_metrics();
    }
}
