//! End-to-end lifecycle tests against the in-memory store and mock ports.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use devbuild_core::clients::{FanoutTrigger, JobPoll, JobSystemClient, SourceControlClient, TriggerEvent};
use devbuild_core::events::{CompletionEvent, CompletionHandler};
use devbuild_core::models::{
    BuildRecord, BuildSpec, BuildStatus, Caller, GetOptions, ListOptions, Phase, PipelineEngine,
    PlatformResult, PublishedArchive, SaveOptions,
};
use devbuild_core::services::{Backends, BoxTask, FanoutBackend, JenkinsBackend, TaskSpawner};
use devbuild_core::store::{MemoryStore, RecordStore};
use devbuild_core::{ClientError, DevBuildConfig, DevBuildError, DevBuildService};

const JOB_NUMBER: i64 = 77;
const COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

fn t0() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

// ---------------------------------------------------------------------------
// Mock ports
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockJobs {
    reject_trigger: AtomicBool,
    fail_resolve: AtomicBool,
    poll: Mutex<Option<JobPoll>>,
    params: Mutex<Vec<BTreeMap<String, String>>>,
    /// When set, every poll bumps record 1 as a concurrent writer would.
    race_store: Mutex<Option<Arc<MemoryStore>>>,
}

impl MockJobs {
    fn set_poll(&self, code: Option<&str>, started_at: Option<DateTime<Utc>>, duration_ms: u64) {
        *self.poll.lock().unwrap() = Some(JobPoll {
            result_code: code.map(str::to_string),
            started_at,
            duration_ms: Some(duration_ms),
        });
    }
}

#[async_trait]
impl JobSystemClient for MockJobs {
    async fn trigger(&self, _job: &str, params: &BTreeMap<String, String>) -> Result<i64, ClientError> {
        if self.reject_trigger.load(Ordering::SeqCst) {
            return Err(ClientError::Rejected("422 Unprocessable Entity".into()));
        }
        self.params.lock().unwrap().push(params.clone());
        Ok(1000)
    }

    async fn resolve_handle(&self, queue_handle: i64) -> Result<i64, ClientError> {
        assert_eq!(queue_handle, 1000);
        if self.fail_resolve.load(Ordering::SeqCst) {
            return Err(ClientError::Other(anyhow::anyhow!("queue item cancelled")));
        }
        Ok(JOB_NUMBER)
    }

    async fn poll_result(&self, _job: &str, number: i64) -> Result<JobPoll, ClientError> {
        assert_eq!(number, JOB_NUMBER);
        let race = self.race_store.lock().unwrap().clone();
        if let Some(store) = race {
            let mut record = store.get(1).await.unwrap().unwrap();
            record.meta.updated_at += Duration::seconds(5);
            store.update(1, record).await.unwrap();
        }
        self.poll
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ClientError::Other(anyhow::anyhow!("job system unreachable")))
    }

    fn build_url(&self, job: &str, number: i64) -> String {
        format!("https://jenkins.example/job/{job}/{number}/")
    }
}

#[derive(Default)]
struct QueueSpawner {
    tasks: Mutex<Vec<BoxTask>>,
}

impl QueueSpawner {
    fn pending(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    async fn run_all(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            task.await;
        }
    }
}

impl TaskSpawner for QueueSpawner {
    fn spawn(&self, task: BoxTask) {
        self.tasks.lock().unwrap().push(task);
    }
}

#[derive(Default)]
struct RecordingTrigger {
    fail: AtomicBool,
    events: Mutex<Vec<TriggerEvent>>,
}

#[async_trait]
impl FanoutTrigger for RecordingTrigger {
    async fn send(&self, event: &TriggerEvent) -> Result<(), ClientError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ClientError::Other(anyhow::anyhow!("broker unavailable")));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

struct StaticScm {
    fail: bool,
}

#[async_trait]
impl SourceControlClient for StaticScm {
    async fn resolve_commit(&self, owner: &str, repo: &str, git_ref: &str) -> Result<String, ClientError> {
        assert_eq!((owner, repo, git_ref), ("pingcap", "tidb", "master"));
        if self.fail {
            Err(ClientError::Other(anyhow::anyhow!("rate limited")))
        } else {
            Ok(COMMIT.to_string())
        }
    }
}

/// Memory store whose compare-and-swap reports a conflict a set number of times.
#[derive(Default)]
struct ContendedStore {
    inner: MemoryStore,
    conflicts: AtomicUsize,
}

#[async_trait]
impl RecordStore for ContendedStore {
    async fn create(&self, record: BuildRecord) -> anyhow::Result<BuildRecord> {
        self.inner.create(record).await
    }

    async fn get(&self, id: i64) -> anyhow::Result<Option<BuildRecord>> {
        self.inner.get(id).await
    }

    async fn update(&self, id: i64, record: BuildRecord) -> anyhow::Result<BuildRecord> {
        self.inner.update(id, record).await
    }

    async fn compare_and_swap(
        &self,
        id: i64,
        expected: DateTime<Utc>,
        record: BuildRecord,
    ) -> anyhow::Result<Option<BuildRecord>> {
        if self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(None);
        }
        self.inner.compare_and_swap(id, expected, record).await
    }

    async fn list(&self, options: &ListOptions) -> anyhow::Result<Vec<BuildRecord>> {
        self.inner.list(options).await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness<S> {
    service: Arc<DevBuildService>,
    store: Arc<S>,
    jobs: Arc<MockJobs>,
    spawner: Arc<QueueSpawner>,
    trigger: Arc<RecordingTrigger>,
}

fn harness_with<S: RecordStore + 'static>(config: DevBuildConfig, store: Arc<S>) -> Harness<S> {
    build_harness(config, store, None)
}

fn harness_with_scm(scm: StaticScm) -> Harness<MemoryStore> {
    build_harness(DevBuildConfig::default(), Arc::new(MemoryStore::new()), Some(Arc::new(scm)))
}

fn build_harness<S: RecordStore + 'static>(
    config: DevBuildConfig,
    store: Arc<S>,
    scm: Option<Arc<dyn SourceControlClient>>,
) -> Harness<S> {
    let config = Arc::new(config);
    let jobs = Arc::new(MockJobs::default());
    let spawner = Arc::new(QueueSpawner::default());
    let trigger = Arc::new(RecordingTrigger::default());
    let clock: devbuild_core::services::Clock = Arc::new(t0);
    let dyn_store: Arc<dyn RecordStore> = store.clone();

    let backends = Backends {
        monolithic: Arc::new(JenkinsBackend::new(
            config.clone(),
            jobs.clone(),
            dyn_store.clone(),
            spawner.clone(),
            clock.clone(),
        )),
        fanout: Arc::new(FanoutBackend::new(config.clone(), trigger.clone())),
    };
    let mut service = DevBuildService::new(config, dyn_store, backends).with_clock(clock);
    if let Some(scm) = scm {
        service = service.with_source_control(scm);
    }

    Harness {
        service: Arc::new(service),
        store,
        jobs,
        spawner,
        trigger,
    }
}

fn harness() -> Harness<MemoryStore> {
    harness_with(DevBuildConfig::default(), Arc::new(MemoryStore::new()))
}

fn tidb_spec() -> BuildSpec {
    BuildSpec {
        product: "tidb".into(),
        edition: "enterprise".into(),
        version: "v8.1.0".into(),
        git_ref: "master".into(),
        ..Default::default()
    }
}

fn fanout_spec() -> BuildSpec {
    BuildSpec {
        product: "tikv".into(),
        edition: "community".into(),
        version: "v8.1.0".into(),
        git_ref: "branch/release-8.1".into(),
        pipeline_engine: PipelineEngine::Fanout,
        ..Default::default()
    }
}

fn platform_result(name: &str, platform: &str, phase: Phase) -> PlatformResult {
    PlatformResult {
        name: name.into(),
        platform: platform.into(),
        phase,
        ..Default::default()
    }
}

fn alice() -> Caller {
    Caller::new("alice")
}

async fn stored(store: &impl RecordStore, id: i64) -> BuildRecord {
    store.get(id).await.unwrap().expect("record should exist")
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_queues_job_and_resolves_handle_in_background() {
    let h = harness();

    let record = h
        .service
        .create(tidb_spec(), SaveOptions::default(), &alice())
        .await
        .unwrap();
    assert_eq!(record.id, 1);
    assert_eq!(record.status.phase, Phase::Pending);
    assert_eq!(record.meta.created_by, "alice");
    assert_eq!(record.spec.plugin_git_ref, "release-8.1");

    let params = h.jobs.params.lock().unwrap().clone();
    assert_eq!(params.len(), 1);
    assert_eq!(params[0]["TiBuildID"], "1");
    assert_eq!(params[0]["PluginGitRef"], "release-8.1");

    // The caller returns before the handle is known.
    assert_eq!(h.spawner.pending(), 1);
    let queued = stored(h.store.as_ref(), 1).await;
    assert_eq!(queued.status.handle, None);

    // The clock is frozen, so the resolution write must still move the token.
    h.spawner.run_all().await;
    assert!(stored(h.store.as_ref(), 1).await.meta.updated_at > queued.meta.updated_at);
    let record = h.service.get(1, GetOptions::default()).await.unwrap();
    assert_eq!(record.status.phase, Phase::Processing);
    assert_eq!(record.status.handle, Some(JOB_NUMBER));
    assert_eq!(
        record.status.job_url.as_deref(),
        Some("https://jenkins.example/job/devbuild/77/")
    );
    assert_eq!(stored(h.store.as_ref(), 1).await.status.job_url, None);
}

#[tokio::test]
async fn background_resolution_failure_is_recorded_only() {
    let h = harness();
    h.jobs.fail_resolve.store(true, Ordering::SeqCst);

    let record = h
        .service
        .create(tidb_spec(), SaveOptions::default(), &alice())
        .await
        .unwrap();
    assert_eq!(record.status.phase, Phase::Pending);

    h.spawner.run_all().await;
    let record = stored(h.store.as_ref(), 1).await;
    assert_eq!(record.status.phase, Phase::Error);
    assert!(record.status.error_message.contains("queue item cancelled"));
}

#[tokio::test]
async fn dry_run_persists_and_triggers_nothing() {
    let h = harness();

    let record = h
        .service
        .create(tidb_spec(), SaveOptions { dry_run: true }, &alice())
        .await
        .unwrap();
    assert_eq!(record.id, 0);
    assert_eq!(record.spec.source_repo, "pingcap/tidb");
    assert!(h.store.is_empty().await);
    assert!(h.jobs.params.lock().unwrap().is_empty());
    assert_eq!(h.spawner.pending(), 0);
}

#[tokio::test]
async fn target_image_requires_admin_account() {
    let h = harness();
    let mut spec = tidb_spec();
    spec.target_image = "hub.pingcap.net/qa/tidb:v8.1.0".into();

    let err = h
        .service
        .create(spec.clone(), SaveOptions::default(), &alice())
        .await
        .unwrap_err();
    assert!(matches!(err, DevBuildError::Unauthorized(_)));
    assert!(h.store.is_empty().await);

    let admin = Caller::new("alice").with_account("admin");
    let record = h
        .service
        .create(spec, SaveOptions::default(), &admin)
        .await
        .unwrap();
    assert_eq!(record.spec.target_image, "hub.pingcap.net/qa/tidb:v8.1.0");
    assert_eq!(h.jobs.params.lock().unwrap()[0]["TargetImg"], record.spec.target_image);
}

#[tokio::test]
async fn hotfix_rules_are_checked_before_authorization() {
    let h = harness();
    let mut spec = tidb_spec();
    spec.is_hotfix = true;
    spec.version = "v6.1.2-20230102".into();
    spec.target_image = "x".into();

    let err = h
        .service
        .create(spec.clone(), SaveOptions::default(), &alice())
        .await
        .unwrap_err();
    assert!(matches!(err, DevBuildError::InvalidRequest(ref m) if m == "target image must be empty for hotfix"));

    spec.target_image.clear();
    let record = h
        .service
        .create(spec, SaveOptions::default(), &alice())
        .await
        .unwrap();
    assert_eq!(record.spec.plugin_git_ref, "release-6.1.2");
}

#[tokio::test]
async fn rejected_trigger_marks_record_as_error() {
    let h = harness();
    h.jobs.reject_trigger.store(true, Ordering::SeqCst);

    let err = h
        .service
        .create(tidb_spec(), SaveOptions::default(), &alice())
        .await
        .unwrap_err();
    assert!(matches!(err, DevBuildError::UpstreamRejected(_)));

    let record = stored(h.store.as_ref(), 1).await;
    assert_eq!(record.status.phase, Phase::Error);
    assert!(record.status.error_message.contains("422"));
    assert_eq!(h.spawner.pending(), 0);
}

#[tokio::test]
async fn failed_fanout_trigger_is_internal_error() {
    let h = harness();
    h.trigger.fail.store(true, Ordering::SeqCst);

    let err = h
        .service
        .create(fanout_spec(), SaveOptions::default(), &alice())
        .await
        .unwrap_err();
    assert!(matches!(err, DevBuildError::Internal { .. }));
    assert_eq!(stored(h.store.as_ref(), 1).await.status.phase, Phase::Error);
}

#[tokio::test]
async fn commit_is_resolved_when_possible() {
    let h = harness_with_scm(StaticScm { fail: false });
    let record = h
        .service
        .create(tidb_spec(), SaveOptions::default(), &alice())
        .await
        .unwrap();
    assert_eq!(record.spec.git_hash, COMMIT);
    assert_eq!(stored(h.store.as_ref(), 1).await.spec.git_hash, COMMIT);
}

#[tokio::test]
async fn commit_resolution_failure_is_not_fatal() {
    let h = harness_with_scm(StaticScm { fail: true });
    let record = h
        .service
        .create(tidb_spec(), SaveOptions::default(), &alice())
        .await
        .unwrap();
    assert!(record.spec.git_hash.is_empty());

    let mut pinned = tidb_spec();
    pinned.git_ref = COMMIT.into();
    let record = h
        .service
        .create(pinned, SaveOptions::default(), &alice())
        .await
        .unwrap();
    assert_eq!(record.spec.git_hash, COMMIT);
}

// ---------------------------------------------------------------------------
// Get / sync
// ---------------------------------------------------------------------------

async fn processing_build(h: &Harness<MemoryStore>) {
    h.service
        .create(tidb_spec(), SaveOptions::default(), &alice())
        .await
        .unwrap();
    h.spawner.run_all().await;
    assert_eq!(stored(h.store.as_ref(), 1).await.status.phase, Phase::Processing);
}

#[tokio::test]
async fn sync_maps_result_and_duration() {
    let h = harness();
    processing_build(&h).await;

    let started = t0() - Duration::minutes(10);
    h.jobs.set_poll(Some("SUCCESS"), Some(started), 60_000);

    let record = h.service.get(1, GetOptions { sync: true }).await.unwrap();
    assert_eq!(record.status.phase, Phase::Success);
    assert_eq!(record.status.started_at, Some(started));
    assert_eq!(record.status.ended_at, Some(started + Duration::seconds(60)));
    assert!(record.status.job_url.is_some());

    let persisted = stored(h.store.as_ref(), 1).await;
    assert_eq!(persisted.status.phase, Phase::Success);
    assert!(persisted.meta.updated_at > t0());
    assert!(persisted.status.job_url.is_none());
}

#[tokio::test]
async fn sync_without_duration_ends_now() {
    let h = harness();
    processing_build(&h).await;
    h.jobs.set_poll(Some("ABORTED"), Some(t0() - Duration::minutes(1)), 0);

    let record = h.service.get(1, GetOptions { sync: true }).await.unwrap();
    assert_eq!(record.status.phase, Phase::Aborted);
    assert_eq!(record.status.ended_at, Some(t0()));
}

#[tokio::test]
async fn sync_keeps_running_builds_processing() {
    let h = harness();
    processing_build(&h).await;
    h.jobs.set_poll(None, Some(t0()), 0);

    let record = h.service.get(1, GetOptions { sync: true }).await.unwrap();
    assert_eq!(record.status.phase, Phase::Processing);
    assert_eq!(record.status.started_at, Some(t0()));
    assert_eq!(record.status.ended_at, None);
}

#[tokio::test]
async fn sync_poll_failure_is_internal_error() {
    let h = harness();
    processing_build(&h).await;

    let err = h.service.get(1, GetOptions { sync: true }).await.unwrap_err();
    assert!(matches!(err, DevBuildError::Internal { .. }));

    // Without sync the record is still readable.
    let record = h.service.get(1, GetOptions::default()).await.unwrap();
    assert_eq!(record.status.phase, Phase::Processing);
}

#[tokio::test]
async fn sync_refuses_to_overwrite_concurrent_writer() {
    let h = harness();
    processing_build(&h).await;
    h.jobs.set_poll(Some("SUCCESS"), Some(t0()), 1_000);
    *h.jobs.race_store.lock().unwrap() = Some(h.store.clone());

    let err = h.service.get(1, GetOptions { sync: true }).await.unwrap_err();
    assert!(matches!(err, DevBuildError::Internal { .. }));

    let persisted = stored(h.store.as_ref(), 1).await;
    assert_eq!(persisted.status.phase, Phase::Processing);
    assert_eq!(persisted.meta.updated_at, t0() + Duration::seconds(5));
}

#[tokio::test]
async fn sync_is_skipped_for_pending_builds() {
    let h = harness();
    h.service
        .create(tidb_spec(), SaveOptions::default(), &alice())
        .await
        .unwrap();

    // No poll configured: a poll would fail.
    let record = h.service.get(1, GetOptions { sync: true }).await.unwrap();
    assert_eq!(record.status.phase, Phase::Pending);
}

#[tokio::test]
async fn get_unknown_build_is_not_found() {
    let h = harness();
    let err = h.service.get(42, GetOptions::default()).await.unwrap_err();
    assert!(matches!(err, DevBuildError::NotFound(42)));
}

// ---------------------------------------------------------------------------
// Update / rerun / list
// ---------------------------------------------------------------------------

#[tokio::test]
async fn update_replaces_status() {
    let h = harness();
    processing_build(&h).await;

    let status = BuildStatus {
        phase: Phase::Aborted,
        error_message: "cancelled by operator".into(),
        ..Default::default()
    };
    let dry = h
        .service
        .update(1, status.clone(), SaveOptions { dry_run: true })
        .await
        .unwrap();
    assert_eq!(dry.status.phase, Phase::Aborted);
    assert_eq!(stored(h.store.as_ref(), 1).await.status.phase, Phase::Processing);

    let record = h.service.update(1, status, SaveOptions::default()).await.unwrap();
    assert_eq!(record.status.phase, Phase::Aborted);
    assert_eq!(record.status.handle, None);
    assert_eq!(stored(h.store.as_ref(), 1).await.status.error_message, "cancelled by operator");
}

#[tokio::test]
async fn update_rejects_bad_ids() {
    let h = harness();
    let err = h
        .service
        .update(0, BuildStatus::default(), SaveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DevBuildError::InvalidRequest(_)));

    let err = h
        .service
        .update(5, BuildStatus::default(), SaveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DevBuildError::NotFound(5)));
}

#[tokio::test]
async fn update_keeps_fanout_state_and_derives_phase() {
    let h = harness();
    h.service
        .create(fanout_spec(), SaveOptions::default(), &alice())
        .await
        .unwrap();
    h.service
        .merge_result(1, platform_result("run-amd64", "linux/amd64", Phase::Processing), SaveOptions::default())
        .await
        .unwrap();

    let record = h
        .service
        .update(
            1,
            BuildStatus {
                phase: Phase::Success,
                ..Default::default()
            },
            SaveOptions::default(),
        )
        .await
        .unwrap();

    let state = record.status.fanout_state.as_ref().unwrap();
    assert_eq!(state.platform_results.len(), 1);
    assert_eq!(record.status.phase, Phase::Processing);
}

#[tokio::test]
async fn rerun_copies_spec_into_new_build() {
    let h = harness();
    let original = h
        .service
        .create(tidb_spec(), SaveOptions::default(), &alice())
        .await
        .unwrap();
    h.spawner.run_all().await;

    let rerun = h
        .service
        .rerun(1, SaveOptions::default(), &Caller::new("bob"))
        .await
        .unwrap();
    assert_eq!(rerun.id, 2);
    assert_eq!(rerun.spec, original.spec);
    assert_eq!(rerun.status.phase, Phase::Pending);
    assert_eq!(rerun.meta.created_by, "bob");
    assert_eq!(h.jobs.params.lock().unwrap().len(), 2);

    let err = h
        .service
        .rerun(9, SaveOptions::default(), &alice())
        .await
        .unwrap_err();
    assert!(matches!(err, DevBuildError::NotFound(9)));
}

#[tokio::test]
async fn list_is_newest_first_with_filters() {
    let h = harness();
    let mut hotfix = tidb_spec();
    hotfix.is_hotfix = true;
    hotfix.version = "v7.5.1-20240101".into();

    for (spec, user) in [(tidb_spec(), "alice"), (hotfix, "bob"), (fanout_spec(), "alice")] {
        h.service
            .create(spec, SaveOptions::default(), &Caller::new(user))
            .await
            .unwrap();
    }
    h.spawner.run_all().await;

    let all = h.service.list(&ListOptions::default()).await.unwrap();
    assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 2, 1]);
    assert!(all[1].status.job_url.is_some());

    let hotfixes = h
        .service
        .list(&ListOptions {
            hotfix: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(hotfixes.len(), 1);
    assert_eq!(hotfixes[0].meta.created_by, "bob");

    let alice = h
        .service
        .list(&ListOptions {
            created_by: Some("alice".into()),
            size: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(alice.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3]);
}

// ---------------------------------------------------------------------------
// Fan-out merge
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fanout_create_sends_trigger_event() {
    let h = harness();
    let record = h
        .service
        .create(fanout_spec(), SaveOptions::default(), &alice())
        .await
        .unwrap();

    let events = h.trigger.events.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].subject, record.id.to_string());
    assert_eq!(events[0].user, "alice");
    assert_eq!(events[0].data["pipelineEngine"], "tekton");
    assert!(h.jobs.params.lock().unwrap().is_empty());
    assert_eq!(h.spawner.pending(), 0);
}

#[tokio::test]
async fn platforms_converge_to_success() {
    let h = harness();
    h.service
        .create(fanout_spec(), SaveOptions::default(), &alice())
        .await
        .unwrap();
    let merge = |r: PlatformResult| {
        let service = h.service.clone();
        async move { service.merge_result(1, r, SaveOptions::default()).await.unwrap() }
    };

    merge(platform_result("run-amd64", "linux/amd64", Phase::Processing)).await;
    merge(platform_result("run-arm64", "linux/arm64", Phase::Processing)).await;

    let mut amd64 = platform_result("run-amd64", "linux/amd64", Phase::Success);
    amd64.source_commit = COMMIT.into();
    amd64.ended_at = Some(t0() + Duration::minutes(30));
    amd64.published_archives.push(PublishedArchive {
        repo: "hub.pingcap.net/tikv/tikv/package".into(),
        tag: "v8.1.0_linux_amd64".into(),
        files: vec!["tikv.tar.gz".into(), "tikv.tar.gz.sha256".into()],
    });
    let record = merge(amd64).await;
    assert_eq!(record.status.phase, Phase::Processing);
    assert_eq!(record.status.ended_at, None);

    let mut arm64 = platform_result("run-arm64", "linux/arm64", Phase::Success);
    arm64.ended_at = Some(t0() + Duration::minutes(45));
    let record = merge(arm64).await;
    assert_eq!(record.status.phase, Phase::Success);
    assert_eq!(record.status.ended_at, Some(t0() + Duration::minutes(45)));

    let report = record.status.artifact_report.as_ref().unwrap();
    assert_eq!(report.source_commit, COMMIT);
    assert_eq!(report.binaries.len(), 1);
    assert!(report.binaries[0].url.contains("?tag=v8.1.0_linux_amd64&file=tikv.tar.gz"));
    assert!(report.binaries[0].checksum_url.ends_with("file=tikv.tar.gz.sha256"));

    let state = record.status.fanout_state.as_ref().unwrap();
    assert_eq!(state.platform_results.len(), 2);
    assert!(state.platform_results[0].url.as_deref().unwrap().ends_with("/run-amd64"));

    // Display fields never reach the store.
    let persisted = stored(h.store.as_ref(), 1).await;
    let persisted_state = persisted.status.fanout_state.as_ref().unwrap();
    assert!(persisted_state.platform_results.iter().all(|r| r.url.is_none()));
    assert!(persisted.status.artifact_report.as_ref().unwrap().binaries[0].url.is_empty());
}

#[tokio::test]
async fn one_failed_platform_fails_the_build() {
    let h = harness();
    h.service
        .create(fanout_spec(), SaveOptions::default(), &alice())
        .await
        .unwrap();

    for (name, platform, phase) in [
        ("a", "linux/amd64", Phase::Success),
        ("b", "linux/arm64", Phase::Success),
        ("c", "darwin/arm64", Phase::Failure),
    ] {
        h.service
            .merge_result(1, platform_result(name, platform, phase), SaveOptions::default())
            .await
            .unwrap();
    }
    assert_eq!(stored(h.store.as_ref(), 1).await.status.phase, Phase::Failure);
}

#[tokio::test]
async fn merging_same_result_twice_is_idempotent() {
    let h = harness();
    h.service
        .create(fanout_spec(), SaveOptions::default(), &alice())
        .await
        .unwrap();

    let mut result = platform_result("run-amd64", "linux/amd64", Phase::Success);
    result.published_archives.push(PublishedArchive {
        repo: "r".into(),
        tag: "t".into(),
        files: vec!["f1.tar.gz".into(), "f1.tar.gz.sha256".into()],
    });

    let counts = |r: &BuildRecord| {
        let report = r.status.artifact_report.as_ref().unwrap();
        (
            r.status.fanout_state.as_ref().unwrap().platform_results.len(),
            report.binaries.len(),
            report.images.len(),
        )
    };

    let first = h
        .service
        .merge_result(1, result.clone(), SaveOptions::default())
        .await
        .unwrap();
    let second = h
        .service
        .merge_result(1, result, SaveOptions::default())
        .await
        .unwrap();
    assert_eq!(counts(&first), (1, 1, 0));
    assert_eq!(counts(&first), counts(&second));
}

#[tokio::test]
async fn dry_run_merge_is_not_persisted() {
    let h = harness();
    h.service
        .create(fanout_spec(), SaveOptions::default(), &alice())
        .await
        .unwrap();

    let record = h
        .service
        .merge_result(
            1,
            platform_result("a", "linux/amd64", Phase::Success),
            SaveOptions { dry_run: true },
        )
        .await
        .unwrap();
    assert_eq!(record.status.phase, Phase::Success);
    assert!(stored(h.store.as_ref(), 1).await.status.fanout_state.is_none());
}

#[tokio::test]
async fn merge_into_missing_build_is_not_found() {
    let h = harness();
    let err = h
        .service
        .merge_result(3, platform_result("a", "linux/amd64", Phase::Success), SaveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DevBuildError::NotFound(3)));
}

#[tokio::test]
async fn terminal_results_can_be_guarded() {
    let config = DevBuildConfig {
        reject_terminal_regressions: true,
        ..Default::default()
    };
    let h = harness_with(config, Arc::new(MemoryStore::new()));
    h.service
        .create(fanout_spec(), SaveOptions::default(), &alice())
        .await
        .unwrap();

    let failed = platform_result("a", "linux/amd64", Phase::Failure);
    h.service
        .merge_result(1, failed.clone(), SaveOptions::default())
        .await
        .unwrap();

    // Redelivery of the identical event is harmless.
    h.service
        .merge_result(1, failed, SaveOptions::default())
        .await
        .unwrap();

    let err = h
        .service
        .merge_result(1, platform_result("a", "linux/amd64", Phase::Processing), SaveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DevBuildError::InvalidRequest(_)));
    assert_eq!(stored(h.store.as_ref(), 1).await.status.phase, Phase::Failure);
}

#[tokio::test]
async fn contended_merge_retries_then_gives_up() {
    let h = harness_with(DevBuildConfig::default(), Arc::new(ContendedStore::default()));
    h.service
        .create(fanout_spec(), SaveOptions::default(), &alice())
        .await
        .unwrap();

    h.store.conflicts.store(2, Ordering::SeqCst);
    let record = h
        .service
        .merge_result(1, platform_result("a", "linux/amd64", Phase::Processing), SaveOptions::default())
        .await
        .unwrap();
    assert_eq!(record.status.phase, Phase::Processing);

    h.store.conflicts.store(10, Ordering::SeqCst);
    let err = h
        .service
        .merge_result(1, platform_result("b", "linux/arm64", Phase::Processing), SaveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DevBuildError::Internal { .. }));

    let persisted = h.store.get(1).await.unwrap().unwrap();
    assert_eq!(persisted.status.fanout_state.unwrap().platform_results.len(), 1);
}

#[tokio::test]
async fn concurrent_merges_lose_no_platform() {
    let h = harness();
    h.service
        .create(fanout_spec(), SaveOptions::default(), &alice())
        .await
        .unwrap();

    let platforms = ["linux/amd64", "linux/arm64", "darwin/amd64"];
    let tasks: Vec<_> = platforms
        .iter()
        .map(|platform| {
            let service = h.service.clone();
            let result = platform_result(platform, platform, Phase::Success);
            tokio::spawn(async move { service.merge_result(1, result, SaveOptions::default()).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let record = stored(h.store.as_ref(), 1).await;
    assert_eq!(record.status.fanout_state.unwrap().platform_results.len(), 3);
    assert_eq!(record.status.phase, Phase::Success);
}

// ---------------------------------------------------------------------------
// Completion events
// ---------------------------------------------------------------------------

fn completion(event_type: &str, arch: &str) -> CompletionEvent {
    CompletionEvent {
        event_type: event_type.into(),
        source: "https://tibuild.pingcap.net/api/devbuilds/1".into(),
        correlation_id: "1".into(),
        name: format!("tikv-build-linux-{arch}"),
        params: BTreeMap::from([
            ("os".to_string(), "linux".to_string()),
            ("arch".to_string(), arch.to_string()),
            ("git-revision".to_string(), COMMIT.to_string()),
        ]),
        ..Default::default()
    }
}

#[tokio::test]
async fn completion_events_drive_the_build() {
    let h = harness();
    h.service
        .create(fanout_spec(), SaveOptions::default(), &alice())
        .await
        .unwrap();
    let handler = CompletionHandler::new(h.service.clone());

    for arch in ["amd64", "arm64"] {
        let record = handler
            .handle(&completion("dev.tekton.event.pipelinerun.started.v1", arch))
            .await
            .unwrap();
        assert_eq!(record.unwrap().status.phase, Phase::Processing);
    }

    let ignored = handler
        .handle(&completion("dev.tekton.event.pipelinerun.unknown.v1", "amd64"))
        .await
        .unwrap();
    assert!(ignored.is_none());

    let mut malformed = completion("dev.tekton.event.pipelinerun.successful.v1", "amd64");
    malformed.results.insert("pushed-images".into(), "[".into());
    assert!(handler.handle(&malformed).await.unwrap().is_none());

    for arch in ["amd64", "arm64"] {
        handler
            .handle(&completion("dev.tekton.event.pipelinerun.successful.v1", arch))
            .await
            .unwrap();
    }

    let record = stored(h.store.as_ref(), 1).await;
    assert_eq!(record.status.phase, Phase::Success);
    assert_eq!(record.status.artifact_report.unwrap().source_commit, COMMIT);
}
