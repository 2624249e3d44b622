//! Jenkins-style backend: one parameterised job per build, polled on demand.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::clients::JobSystemClient;
use crate::config::DevBuildConfig;
use crate::error::{ClientError, DevBuildError, Result};
use crate::models::{BuildRecord, BuildStatus, Phase};
use crate::services::backend::{advance_token, Clock, PipelineBackend, TaskSpawner};
use crate::store::RecordStore;

pub struct JenkinsBackend {
    config: Arc<DevBuildConfig>,
    jobs: Arc<dyn JobSystemClient>,
    store: Arc<dyn RecordStore>,
    spawner: Arc<dyn TaskSpawner>,
    clock: Clock,
}

impl JenkinsBackend {
    pub fn new(
        config: Arc<DevBuildConfig>,
        jobs: Arc<dyn JobSystemClient>,
        store: Arc<dyn RecordStore>,
        spawner: Arc<dyn TaskSpawner>,
        clock: Clock,
    ) -> Self {
        Self {
            config,
            jobs,
            store,
            spawner,
            clock,
        }
    }
}

/// Job parameters for a persisted record.
pub fn job_params(record: &BuildRecord) -> BTreeMap<String, String> {
    let spec = &record.spec;
    [
        ("Product", spec.product.clone()),
        ("GitRef", spec.git_ref.clone()),
        ("Version", spec.version.clone()),
        ("Edition", spec.edition.clone()),
        ("PluginGitRef", spec.plugin_git_ref.clone()),
        ("GithubRepo", spec.source_repo.clone()),
        ("IsPushGCR", spec.is_push_gcr.to_string()),
        ("IsHotfix", spec.is_hotfix.to_string()),
        ("Features", spec.features.clone()),
        ("TiBuildID", record.id.to_string()),
        ("BuildEnv", spec.build_env.clone()),
        ("BuilderImg", spec.builder_image.clone()),
        ("ProductDockerfile", spec.dockerfile.clone()),
        ("ProductBaseImg", spec.base_image.clone()),
        ("TargetImg", spec.target_image.clone()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Map a provider result code onto a phase. Unknown codes keep the build running.
fn phase_for_result(code: Option<&str>) -> Option<Phase> {
    match code? {
        "SUCCESS" => Some(Phase::Success),
        "FAILURE" => Some(Phase::Failure),
        "ABORTED" => Some(Phase::Aborted),
        _ => None,
    }
}

/// End time from a reported duration. `None` for a missing, zero or
/// out-of-range duration.
fn end_from_duration(start: DateTime<Utc>, duration_ms: Option<u64>) -> Option<DateTime<Utc>> {
    let ms = i64::try_from(duration_ms.filter(|ms| *ms > 0)?).ok()?;
    start.checked_add_signed(Duration::try_milliseconds(ms)?)
}

#[async_trait]
impl PipelineBackend for JenkinsBackend {
    async fn trigger(&self, record: &BuildRecord) -> std::result::Result<(), ClientError> {
        let job = self.config.job_name.clone();
        let queue_handle = self.jobs.trigger(&job, &job_params(record)).await?;
        tracing::info!(build_id = record.id, queue_handle, job = %job, "Job queued");

        let id = record.id;
        let jobs = self.jobs.clone();
        let store = self.store.clone();
        let clock = self.clock.clone();
        self.spawner.spawn(Box::pin(async move {
            let resolved = jobs.resolve_handle(queue_handle).await;

            let mut current = match store.get(id).await {
                Ok(Some(r)) => r,
                Ok(None) => {
                    tracing::warn!(build_id = id, "Record vanished before handle resolution");
                    return;
                }
                Err(e) => {
                    tracing::error!(build_id = id, error = %e, "Failed to reload record");
                    return;
                }
            };

            match resolved {
                Ok(number) => {
                    current.status.handle = Some(number);
                    current.status.phase = Phase::Processing;
                    tracing::info!(build_id = id, job_number = number, "Job handle resolved");
                }
                Err(e) => {
                    current.status.phase = Phase::Error;
                    current.status.error_message = e.to_string();
                    tracing::warn!(build_id = id, error = %e, "Job handle resolution failed");
                }
            }
            crate::metrics::build_phase_changed(current.status.phase);
            current.meta.updated_at = advance_token(clock(), current.meta.updated_at);

            if let Err(e) = store.update(id, current).await {
                tracing::error!(build_id = id, error = %e, "Failed to persist resolved handle");
            }
        }));

        Ok(())
    }

    async fn sync(&self, record: &BuildRecord, now: DateTime<Utc>) -> Result<Option<BuildStatus>> {
        let Some(number) = record.status.handle else {
            return Ok(None);
        };
        let poll = self
            .jobs
            .poll_result(&self.config.job_name, number)
            .await
            .map_err(|e| DevBuildError::internal_from("fetch job status", e))?;

        let mut status = record.status.clone();
        if let Some(phase) = phase_for_result(poll.result_code.as_deref()) {
            status.phase = phase;
        }
        if poll.started_at.is_some() {
            status.started_at = poll.started_at;
        }
        if status.phase.is_terminal() && status.ended_at.is_none() {
            status.ended_at = Some(
                status
                    .started_at
                    .and_then(|start| end_from_duration(start, poll.duration_ms))
                    .unwrap_or(now),
            );
            if let Some(ms) = status.duration_ms() {
                crate::metrics::build_duration(ms);
            }
        }

        Ok(Some(status))
    }

    fn decorate(&self, status: &mut BuildStatus) {
        if let Some(number) = status.handle.filter(|n| *n != 0) {
            status.job_url = Some(self.jobs.build_url(&self.config.job_name, number));
        }
    }
}
