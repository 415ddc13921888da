//! Run lifecycle metrics.

use metrics::{counter, decrement_gauge, histogram, increment_gauge};

/// Metric recorder for the run lifecycle. A no-op until an exporter is
/// installed.
pub struct RunMetrics;

impl RunMetrics {
    pub fn run_admitted() {
        counter!("shipyard_runs_created_total", 1);
        increment_gauge!("shipyard_runs_active", 1.0);
    }

    pub fn run_started(stack: &str) {
        counter!("shipyard_runs_started_total", 1, "stack" => stack.to_string());
    }

    pub fn run_failed(kind: &str) {
        counter!("shipyard_runs_failed_total", 1, "kind" => kind.to_string());
    }

    pub fn run_stopped() {
        counter!("shipyard_runs_stopped_total", 1);
    }

    pub fn run_released() {
        decrement_gauge!("shipyard_runs_active", 1.0);
    }

    pub fn build_duration(seconds: f64, result: &str) {
        histogram!("shipyard_build_duration_seconds", seconds, "result" => result.to_string());
    }

    pub fn cleanup_failure(step: &str) {
        counter!("shipyard_cleanup_failures_total", 1, "step" => step.to_string());
    }
}
