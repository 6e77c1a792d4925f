//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded throughout the codebase with the `metrics` crate's
//! macros; this module installs the exporter on its own port and registers
//! human-readable descriptions.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use std::net::SocketAddr;
use tracing::warn;

/// Install the Prometheus exporter on `port`. A port of 0 disables it.
/// Returns false if a recorder was already installed (e.g. in tests where
/// several apps share a process); recording still works in that case.
pub fn install(port: u16) -> bool {
    if port == 0 {
        return false;
    }
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let installed = metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install();

    match installed {
        Ok(()) => {
            describe();
            true
        }
        Err(e) => {
            warn!(error = %e, "metrics exporter not installed");
            false
        }
    }
}

fn describe() {
    describe_counter!("llmfleet_starts_total", "Model start attempts");
    describe_counter!("llmfleet_start_failures_total", "Model start attempts that failed");
    describe_histogram!(
        "llmfleet_start_duration_seconds",
        "Wall-clock time from start request to routing"
    );
    describe_counter!(
        "llmfleet_evictions_total",
        "Idle models stopped to admit another model"
    );
    describe_counter!(
        "llmfleet_idle_stops_total",
        "Models stopped by the idle sweeper"
    );
    describe_gauge!("llmfleet_in_flight", "Current in-flight requests per model");
    describe_counter!("llmfleet_requests_total", "Proxied requests per model");
    describe_histogram!(
        "llmfleet_request_ttfb_seconds",
        "Time from request arrival to first upstream response byte"
    );
}
