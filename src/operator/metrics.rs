//! Metrics seam
//!
//! Handlers report measurements through [`MetricsRecorder`]; the binary
//! picks an implementation from the settings.

use std::time::Duration;

pub trait MetricsRecorder: Send + Sync {
    /// A NetworkAssertion was handled by the create path
    fn assertion_seen(&self, namespace: &str, name: &str);

    /// Wall-clock time spent in one handler (`create`, `update`, `results`)
    fn handler_duration(&self, name: &str, handler: &str, elapsed: Duration);

    /// Duration of one probe call, from the result record's timestamps
    fn probe_duration(&self, name: &str, probe_type: &str, seconds: f64);

    /// Results written to a PolicyReport, by status
    fn results_processed(&self, name: &str, status: &str, count: u32);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn assertion_seen(&self, _namespace: &str, _name: &str) {}
    fn handler_duration(&self, _name: &str, _handler: &str, _elapsed: Duration) {}
    fn probe_duration(&self, _name: &str, _probe_type: &str, _seconds: f64) {}
    fn results_processed(&self, _name: &str, _status: &str, _count: u32) {}
}

/// Emits each measurement as a tracing event under the `netchecks::metrics`
/// target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsRecorder for TracingMetrics {
    fn assertion_seen(&self, namespace: &str, name: &str) {
        tracing::info!(
            target: "netchecks::metrics",
            metric = "netchecks_assertions",
            namespace,
            name,
            "counter"
        );
    }

    fn handler_duration(&self, name: &str, handler: &str, elapsed: Duration) {
        tracing::info!(
            target: "netchecks::metrics",
            metric = "netchecks_operator_assertion_processing_seconds",
            name,
            method = handler,
            seconds = elapsed.as_secs_f64(),
            "summary"
        );
    }

    fn probe_duration(&self, name: &str, probe_type: &str, seconds: f64) {
        tracing::info!(
            target: "netchecks::metrics",
            metric = "netchecks_probe_processing_seconds",
            name,
            probe_type,
            seconds,
            "summary"
        );
    }

    fn results_processed(&self, name: &str, status: &str, count: u32) {
        tracing::info!(
            target: "netchecks::metrics",
            metric = "netchecks_results",
            name,
            status,
            count,
            "counter"
        );
    }
}
