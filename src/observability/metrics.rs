//! Metrics collection and exposition.
//!
//! # Metrics
//! - `router_resolutions_total` (counter): resolutions by outcome (matched, unmatched)
//! - `router_match_cache_hits_total` (counter): resolutions served from the match cache
//! - `resource_fetches_total` (counter): fetches by type and outcome
//!   (success, error, discarded, timeout)
//! - `resource_cache_hits_total` (counter): slices served without fetching, by type
//! - `resource_evictions_total` (counter): slices evicted by `max_cache`, by type
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; exposition is opt-in
//! - Labels stay low-cardinality: resource type, never resource key

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_route_resolved(outcome: &'static str) {
    metrics::counter!("router_resolutions_total", "outcome" => outcome).increment(1);
}

pub fn record_match_cache_hit() {
    metrics::counter!("router_match_cache_hits_total").increment(1);
}

pub fn record_resource_fetch(resource_type: &str, outcome: &'static str) {
    metrics::counter!(
        "resource_fetches_total",
        "type" => resource_type.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_resource_cache_hit(resource_type: &str) {
    metrics::counter!("resource_cache_hits_total", "type" => resource_type.to_string()).increment(1);
}

pub fn record_resource_eviction(resource_type: &str) {
    metrics::counter!("resource_evictions_total", "type" => resource_type.to_string()).increment(1);
}
