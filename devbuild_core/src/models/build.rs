//! A build request and its lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fanout::FanoutState;
use super::report::ArtifactReport;

/// The persistent entity tracking one build request end-to-end.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRecord {
    pub id: i64,
    pub meta: BuildMeta,
    pub spec: BuildSpec,
    pub status: BuildStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildMeta {
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    /// Optimistic-concurrency token; every persisted write advances it.
    pub updated_at: DateTime<Utc>,
}

/// What to build. Immutable after creation except through update/rerun.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildSpec {
    pub product: String,
    pub edition: String,
    pub version: String,
    pub git_ref: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub git_hash: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub plugin_git_ref: String,
    /// `linux/amd64`, `darwin/arm64`, ... or empty for all platforms.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub platform: String,
    /// Space separated feature flags, e.g. `fips`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub features: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub build_env: String,
    pub is_hotfix: bool,
    pub is_push_gcr: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub target_image: String,
    pub pipeline_engine: PipelineEngine,
    /// `owner/name` of the source repository.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source_repo: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub builder_image: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub base_image: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dockerfile: String,
}

impl BuildSpec {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.split_whitespace().any(|f| f == feature)
    }
}

/// Execution strategy chosen for a record at creation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineEngine {
    /// One poll-based job in the Jenkins-style job system.
    #[default]
    #[serde(rename = "jenkins", alias = "monolithic")]
    Monolithic,
    /// One independent sub-job per platform, reporting back via events.
    #[serde(rename = "tekton", alias = "fanout")]
    Fanout,
}

impl PipelineEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monolithic => "jenkins",
            Self::Fanout => "tekton",
        }
    }
}

/// Build phase. `Pending` is initial; `Success`, `Failure`, `Aborted` and
/// `Error` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[default]
    Pending,
    Processing,
    Success,
    Failure,
    Aborted,
    Error,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Aborted => "ABORTED",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildStatus {
    pub phase: Phase,
    /// External job number in the monolithic job system.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_report: Option<ArtifactReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fanout_state: Option<FanoutState>,
    /// Display only, rendered on read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_url: Option<String>,
}

impl BuildStatus {
    /// Fresh status for a newly created record.
    pub fn pending() -> Self {
        Self::default()
    }

    /// Drops every field that is rendered on read and must never be stored.
    pub fn strip_display_fields(&mut self) {
        self.job_url = None;
        if let Some(report) = self.artifact_report.as_mut() {
            report.strip_display_fields();
        }
        if let Some(state) = self.fanout_state.as_mut() {
            state.strip_display_fields();
        }
    }

    /// Wall time of a finished build, when both bounds are known.
    pub fn duration_ms(&self) -> Option<u64> {
        if !self.phase.is_terminal() {
            return None;
        }
        let elapsed = self.ended_at? - self.started_at?;
        Some(elapsed.num_milliseconds().max(0) as u64)
    }
}
