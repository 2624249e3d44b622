//! Merging per-platform results into a fan-out build.

use crate::error::{DevBuildError, Result};
use crate::models::{BuildRecord, FanoutState, PipelineEngine, PlatformResult, SaveOptions};
use crate::services::aggregator::aggregate;
use crate::services::build_service::DevBuildService;

/// Insert `result`, replacing any entry with the same name in place.
/// Returns true if an entry was replaced.
pub fn upsert(state: &mut FanoutState, result: PlatformResult) -> bool {
    match state
        .platform_results
        .iter_mut()
        .find(|existing| existing.name == result.name)
    {
        Some(existing) => {
            *existing = result;
            true
        }
        None => {
            state.platform_results.push(result);
            false
        }
    }
}

/// Recompute the fan-out aggregate and, for fan-out records, copy it up
/// into the top-level status.
pub fn apply_aggregate(record: &mut BuildRecord) {
    let Some(state) = record.status.fanout_state.as_mut() else {
        return;
    };
    let agg = aggregate(&state.platform_results);
    state.phase = agg.phase;
    state.artifact_report = Some(agg.report);
    state.started_at = agg.started_at;
    state.ended_at = agg.ended_at;

    if record.spec.pipeline_engine == PipelineEngine::Fanout {
        record.status.phase = state.phase;
        record.status.artifact_report = state.artifact_report.clone();
        record.status.started_at = state.started_at;
        record.status.ended_at = state.ended_at;
    }
}

impl DevBuildService {
    /// Upsert one platform's result into a build and persist the new aggregate.
    ///
    /// Persists with compare-and-swap on `updated_at`, re-reading and
    /// re-merging on conflict until the configured attempts run out.
    pub async fn merge_result(&self, id: i64, result: PlatformResult, opts: SaveOptions) -> Result<BuildRecord> {
        self.merge_record(id, result, opts)
            .await
            .inspect_err(|e| crate::metrics::request_failed("merge", e.kind()))
    }

    async fn merge_record(&self, id: i64, result: PlatformResult, opts: SaveOptions) -> Result<BuildRecord> {
        if result.name.is_empty() {
            return Err(DevBuildError::invalid("platform result name is required"));
        }

        let attempts = self.config.merge_conflict_retries.max(1);
        for attempt in 1..=attempts {
            let mut record = self.load(id).await?;
            let token = record.meta.updated_at;
            let previous_phase = record.status.phase;
            let state = record.status.fanout_state.get_or_insert_with(FanoutState::default);

            if let Some(existing) = state.find(&result.name) {
                if *existing == result {
                    tracing::debug!(build_id = id, name = %result.name, "Duplicate platform result, nothing to merge");
                    self.inflate(&mut record);
                    return Ok(record);
                }
                if self.config.reject_terminal_regressions && existing.phase.is_terminal() {
                    return Err(DevBuildError::invalid(format!(
                        "platform result {} is already {}",
                        result.name, existing.phase
                    )));
                }
            }

            upsert(state, result.clone());
            apply_aggregate(&mut record);
            record.status.strip_display_fields();
            record.meta.updated_at = self.next_token(token);

            if opts.dry_run {
                self.inflate(&mut record);
                return Ok(record);
            }

            let saved = self
                .store
                .compare_and_swap(id, token, record)
                .await
                .map_err(|e| DevBuildError::internal_from("persist merged build", e))?;

            let Some(mut saved) = saved else {
                crate::metrics::concurrency_conflict("merge");
                tracing::warn!(build_id = id, name = %result.name, attempt, "Concurrent merge detected, retrying");
                continue;
            };

            crate::metrics::platform_result_merged(result.platform_key(), result.phase);
            if saved.status.phase != previous_phase {
                crate::metrics::build_phase_changed(saved.status.phase);
                if let Some(ms) = saved.status.duration_ms() {
                    crate::metrics::build_duration(ms);
                }
            }
            tracing::info!(
                build_id = id,
                name = %result.name,
                platform = %result.platform_key(),
                result_phase = %result.phase,
                phase = %saved.status.phase,
                "Platform result merged"
            );
            self.inflate(&mut saved);
            return Ok(saved);
        }

        Err(DevBuildError::internal(format!(
            "merge into build {id} kept conflicting after {attempts} attempts"
        )))
    }
}
