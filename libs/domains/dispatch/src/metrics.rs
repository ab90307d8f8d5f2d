//! Prometheus metrics for the dispatch core.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() {
    let _ = PROMETHEUS_HANDLE.get_or_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("Failed to install Prometheus recorder");
        info!("Prometheus metrics initialized");
        handle
    });
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(|h| h.render())
        .unwrap_or_default()
}

pub(crate) fn send_attempt(provider: &str, outcome: &'static str, duration: Duration) {
    counter!(
        "dispatch_send_attempts_total",
        "provider" => provider.to_string(),
        "outcome" => outcome
    )
    .increment(1);

    histogram!(
        "dispatch_send_duration_seconds",
        "provider" => provider.to_string()
    )
    .record(duration.as_secs_f64());
}

pub(crate) fn failover_exhausted() {
    counter!("dispatch_failovers_exhausted_total").increment(1);
}

pub(crate) fn quota_persist_failure(provider: &str) {
    counter!(
        "dispatch_quota_persist_failures_total",
        "provider" => provider.to_string()
    )
    .increment(1);
}

pub(crate) fn queue_job(result: &'static str) {
    counter!(
        "dispatch_queue_jobs_total",
        "result" => result
    )
    .increment(1);
}

pub(crate) fn disaster_entry(event: &'static str) {
    counter!(
        "dispatch_disaster_entries_total",
        "event" => event
    )
    .increment(1);
}

pub(crate) fn circuit_transition(provider: &str, state: &'static str) {
    counter!(
        "dispatch_circuit_transitions_total",
        "provider" => provider.to_string(),
        "state" => state
    )
    .increment(1);
}
