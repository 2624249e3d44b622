//! Per-platform partial results of a fan-out build.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::build::Phase;
use super::report::{ArtifactReport, ImageArtifact};

/// One platform's report within a fan-out build. `name` is the unique key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlatformResult {
    pub name: String,
    /// Platform label such as `linux/amd64`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub platform: String,
    pub phase: Phase,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source_commit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub published_images: Vec<ImageArtifact>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub published_archives: Vec<PublishedArchive>,
    /// Display only, rendered on read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl PlatformResult {
    /// Grouping key for aggregation: the platform label, or the result name
    /// when the sub-job did not declare one.
    pub fn platform_key(&self) -> &str {
        if self.platform.is_empty() {
            &self.name
        } else {
            &self.platform
        }
    }
}

/// Files pushed to one OCI artifact; checksum sidecars sit next to the
/// files they cover.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishedArchive {
    pub repo: String,
    pub tag: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FanoutState {
    pub platform_results: Vec<PlatformResult>,
    /// Derived from `platform_results`.
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_report: Option<ArtifactReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl FanoutState {
    pub fn find(&self, name: &str) -> Option<&PlatformResult> {
        self.platform_results.iter().find(|r| r.name == name)
    }

    pub(crate) fn strip_display_fields(&mut self) {
        for result in &mut self.platform_results {
            result.url = None;
        }
        if let Some(report) = self.artifact_report.as_mut() {
            report.strip_display_fields();
        }
    }
}
