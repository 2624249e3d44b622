//! Dev build lifecycle: create, read, update, rerun and list build records.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clients::SourceControlClient;
use crate::config::DevBuildConfig;
use crate::error::{DevBuildError, Result};
use crate::models::{
    ArtifactReport, BuildMeta, BuildRecord, BuildSpec, BuildStatus, Caller, GetOptions,
    ListOptions, OciFile, Phase, PipelineEngine, SaveOptions,
};
use crate::services::backend::{advance_token, system_clock, Backends, Clock};
use crate::services::merge;
use crate::services::validator;
use crate::store::RecordStore;

/// Coordinates validation, persistence and backend dispatch.
pub struct DevBuildService {
    pub(crate) config: Arc<DevBuildConfig>,
    pub(crate) store: Arc<dyn RecordStore>,
    backends: Backends,
    source_control: Option<Arc<dyn SourceControlClient>>,
    clock: Clock,
}

impl DevBuildService {
    pub fn new(config: Arc<DevBuildConfig>, store: Arc<dyn RecordStore>, backends: Backends) -> Self {
        Self {
            config,
            store,
            backends,
            source_control: None,
            clock: system_clock(),
        }
    }

    pub fn with_source_control(mut self, client: Arc<dyn SourceControlClient>) -> Self {
        self.source_control = Some(client);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &DevBuildConfig {
        &self.config
    }

    /// Validate, persist and dispatch a new build request.
    ///
    /// Returns as soon as the backend accepted the trigger; the build itself
    /// runs asynchronously. A dry run returns the normalised record with id 0.
    pub async fn create(&self, spec: BuildSpec, opts: SaveOptions, caller: &Caller) -> Result<BuildRecord> {
        self.create_record(spec, opts, caller)
            .await
            .inspect_err(|e| crate::metrics::request_failed("create", e.kind()))
    }

    /// Load a record, optionally refreshing it from the job system first.
    pub async fn get(&self, id: i64, opts: GetOptions) -> Result<BuildRecord> {
        self.get_record(id, opts)
            .await
            .inspect_err(|e| crate::metrics::request_failed("get", e.kind()))
    }

    /// Replace a record's status. A missing fan-out state keeps the stored one.
    pub async fn update(&self, id: i64, status: BuildStatus, opts: SaveOptions) -> Result<BuildRecord> {
        self.update_record(id, status, opts)
            .await
            .inspect_err(|e| crate::metrics::request_failed("update", e.kind()))
    }

    /// Create a new build from an existing record's spec.
    pub async fn rerun(&self, id: i64, opts: SaveOptions, caller: &Caller) -> Result<BuildRecord> {
        let source = self.load(id).await?;
        tracing::info!(build_id = id, user = %caller.user, "Rerunning build");
        self.create(source.spec, opts, caller).await
    }

    /// Newest first, with display fields rendered.
    pub async fn list(&self, opts: &ListOptions) -> Result<Vec<BuildRecord>> {
        let mut records = self
            .store
            .list(opts)
            .await
            .map_err(|e| DevBuildError::internal_from("list builds", e))?;
        for record in &mut records {
            self.inflate(record);
        }
        Ok(records)
    }

    async fn create_record(&self, spec: BuildSpec, opts: SaveOptions, caller: &Caller) -> Result<BuildRecord> {
        let mut spec = validator::normalize(spec, &self.config)?;

        if !spec.target_image.is_empty() && !self.config.is_admin(caller.account.as_deref()) {
            return Err(DevBuildError::Unauthorized(
                "targetImage deny because of permission".to_string(),
            ));
        }

        let now = (self.clock)();
        if opts.dry_run {
            return Ok(new_record(spec, caller, now));
        }

        self.resolve_git_hash(&mut spec).await;

        let record = self
            .store
            .create(new_record(spec, caller, now))
            .await
            .map_err(|e| DevBuildError::internal_from("create build", e))?;

        let engine = record.spec.pipeline_engine;
        crate::metrics::build_created(engine);
        tracing::info!(
            build_id = record.id,
            product = %record.spec.product,
            version = %record.spec.version,
            engine = engine.as_str(),
            user = %caller.user,
            "Build created"
        );

        if let Err(e) = self.backends.get(engine).trigger(&record).await {
            tracing::warn!(build_id = record.id, error = %e, "Build trigger failed");
            let mut failed = record.clone();
            failed.status.phase = Phase::Error;
            failed.status.error_message = e.to_string();
            failed.meta.updated_at = self.next_token(record.meta.updated_at);
            if let Err(store_err) = self.store.update(record.id, failed).await {
                tracing::error!(build_id = record.id, error = %store_err, "Failed to record trigger failure");
            }
            crate::metrics::build_phase_changed(Phase::Error);
            return Err(DevBuildError::from_client("trigger build", e));
        }

        Ok(record)
    }

    /// Fill `git_hash` when it can be determined. Failure is not fatal.
    async fn resolve_git_hash(&self, spec: &mut BuildSpec) {
        if !spec.git_hash.is_empty() {
            return;
        }
        if validator::is_commit_hash(&spec.git_ref) {
            spec.git_hash = spec.git_ref.clone();
            return;
        }
        let Some(client) = self.source_control.as_ref() else {
            return;
        };
        let Some((owner, repo)) = spec.source_repo.split_once('/') else {
            return;
        };
        match client.resolve_commit(owner, repo, &spec.git_ref).await {
            Ok(hash) => spec.git_hash = hash,
            Err(e) => tracing::warn!(
                repo = %spec.source_repo,
                git_ref = %spec.git_ref,
                error = %e,
                "Commit resolution failed"
            ),
        }
    }

    async fn get_record(&self, id: i64, opts: GetOptions) -> Result<BuildRecord> {
        let mut record = self.load(id).await?;
        if opts.sync && record.status.phase == Phase::Processing {
            record = self.sync(record).await?;
        }
        self.inflate(&mut record);
        Ok(record)
    }

    async fn sync(&self, mut record: BuildRecord) -> Result<BuildRecord> {
        let id = record.id;
        let token = record.meta.updated_at;
        let backend = self.backends.get(record.spec.pipeline_engine);
        let Some(status) = backend.sync(&record, (self.clock)()).await? else {
            return Ok(record);
        };

        let check = self.load(id).await?;
        if check.meta.updated_at != token {
            crate::metrics::concurrency_conflict("sync");
            tracing::warn!(build_id = id, "Build changed while polling, discarding poll result");
            return Err(DevBuildError::internal("update failed because of race condition"));
        }

        let phase_changed = status.phase != record.status.phase;
        record.status = status;
        record.status.strip_display_fields();
        record.meta.updated_at = self.next_token(token);

        let saved = self
            .store
            .compare_and_swap(id, token, record)
            .await
            .map_err(|e| DevBuildError::internal_from("persist synced build", e))?
            .ok_or_else(|| {
                crate::metrics::concurrency_conflict("sync");
                DevBuildError::internal("update failed because of race condition")
            })?;

        if phase_changed {
            crate::metrics::build_phase_changed(saved.status.phase);
            tracing::info!(build_id = id, phase = %saved.status.phase, "Build synced");
        }
        Ok(saved)
    }

    async fn update_record(&self, id: i64, mut status: BuildStatus, opts: SaveOptions) -> Result<BuildRecord> {
        if id <= 0 {
            return Err(DevBuildError::invalid("bad id"));
        }
        let mut record = self.load(id).await?;

        if status.fanout_state.is_none() {
            status.fanout_state = record.status.fanout_state.take();
        }
        status.strip_display_fields();
        let previous_phase = record.status.phase;
        record.status = status;
        if record.spec.pipeline_engine == PipelineEngine::Fanout && record.status.fanout_state.is_some() {
            merge::apply_aggregate(&mut record);
        }
        record.meta.updated_at = self.next_token(record.meta.updated_at);

        if opts.dry_run {
            return Ok(record);
        }
        let saved = self
            .store
            .update(id, record)
            .await
            .map_err(|e| DevBuildError::internal_from("update build", e))?;

        if saved.status.phase != previous_phase {
            crate::metrics::build_phase_changed(saved.status.phase);
        }
        tracing::info!(build_id = id, phase = %saved.status.phase, "Build status replaced");
        Ok(saved)
    }

    pub(crate) async fn load(&self, id: i64) -> Result<BuildRecord> {
        self.store
            .get(id)
            .await
            .map_err(|e| DevBuildError::internal_from("load build", e))?
            .ok_or(DevBuildError::NotFound(id))
    }

    /// Next concurrency token, strictly after `previous`.
    pub(crate) fn next_token(&self, previous: DateTime<Utc>) -> DateTime<Utc> {
        advance_token((self.clock)(), previous)
    }

    /// Render display-only fields. Never persisted.
    pub fn inflate(&self, record: &mut BuildRecord) {
        self.backends
            .get(record.spec.pipeline_engine)
            .decorate(&mut record.status);

        if let Some(report) = record.status.artifact_report.as_mut() {
            render_report(&self.config, report);
        }
        if let Some(report) = record
            .status
            .fanout_state
            .as_mut()
            .and_then(|s| s.artifact_report.as_mut())
        {
            render_report(&self.config, report);
        }
    }
}

fn new_record(spec: BuildSpec, caller: &Caller, now: DateTime<Utc>) -> BuildRecord {
    BuildRecord {
        id: 0,
        meta: BuildMeta {
            created_by: caller.user.clone(),
            created_at: now,
            updated_at: now,
        },
        spec,
        status: BuildStatus::pending(),
    }
}

fn oci_url(base: &str, file: &OciFile) -> String {
    format!(
        "{}/{}?tag={}&file={}",
        base.trim_end_matches('/'),
        file.repo,
        file.tag,
        file.file
    )
}

fn render_report(config: &DevBuildConfig, report: &mut ArtifactReport) {
    for binary in &mut report.binaries {
        if let Some(file) = &binary.oci_file {
            binary.url = oci_url(&config.oci_download_url, file);
        }
        if let Some(file) = &binary.checksum_oci_file {
            binary.checksum_url = oci_url(&config.oci_download_url, file);
        }
    }
    for image in &mut report.images {
        image.internal_url = config.mirror_for(&image.url);
    }
}
