//! Metrics for dev build lifecycle observability.
//!
//! Recorders are installed by the embedding binary; without one these are no-ops.

use metrics::{counter, histogram};

use crate::models::{Phase, PipelineEngine};

/// Record a build request accepted and persisted.
pub fn build_created(engine: PipelineEngine) {
    counter!("devbuild_created_total", "engine" => engine.as_str()).increment(1);
}

/// Record a build phase transition.
pub fn build_phase_changed(phase: Phase) {
    counter!("devbuild_phase_total", "phase" => phase.as_str()).increment(1);
}

/// Record a rejected or failed request.
pub fn request_failed(operation: &'static str, kind: &'static str) {
    counter!("devbuild_request_errors_total", "operation" => operation, "kind" => kind)
        .increment(1);
}

/// Record one per-platform result merged into a fan-out build.
pub fn platform_result_merged(platform: &str, phase: Phase) {
    counter!(
        "devbuild_platform_results_total",
        "platform" => platform.to_string(),
        "phase" => phase.as_str()
    )
    .increment(1);
}

/// Record an inbound completion event skipped without merging.
pub fn event_skipped(reason: &'static str) {
    counter!("devbuild_events_skipped_total", "reason" => reason).increment(1);
}

/// Record an optimistic-concurrency conflict.
pub fn concurrency_conflict(operation: &'static str) {
    counter!("devbuild_concurrency_conflicts_total", "operation" => operation).increment(1);
}

/// Record the wall time of a finished build.
pub fn build_duration(duration_ms: u64) {
    histogram!("devbuild_duration_ms").record(duration_ms as f64);
}
