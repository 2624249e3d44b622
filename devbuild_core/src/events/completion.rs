//! Inbound fan-out completion events.
//!
//! The transport layer decodes the wire envelope into a [`CompletionEvent`];
//! this module turns it into a platform result and hands it to the merge
//! engine. Events that cannot be attributed to a build are skipped, not failed.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{BuildRecord, ImageArtifact, Phase, PlatformResult, PublishedArchive, SaveOptions};
use crate::services::DevBuildService;

pub const EVENT_STARTED: &str = "dev.tekton.event.pipelinerun.started.v1";
pub const EVENT_SUCCESSFUL: &str = "dev.tekton.event.pipelinerun.successful.v1";
pub const EVENT_FAILED: &str = "dev.tekton.event.pipelinerun.failed.v1";

const PARAM_OS: &str = "os";
const PARAM_ARCH: &str = "arch";
const PARAM_REVISION: &str = "git-revision";
const RESULT_BINARIES: &str = "pushed-binaries";
const RESULT_IMAGES: &str = "pushed-images";

/// One pipeline run's lifecycle notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompletionEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    /// Source of the trigger event this run answers, if known.
    pub source: String,
    /// Build id, as the subject of the trigger event.
    pub correlation_id: String,
    /// Pipeline run name, unique per platform sub-job.
    pub name: String,
    pub params: BTreeMap<String, String>,
    /// Named run results; values are JSON documents.
    pub results: BTreeMap<String, String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Why an event was not merged.
#[derive(Debug, thiserror::Error)]
pub enum Skip {
    #[error("unknown event type {0}")]
    UnknownType(String),

    #[error("event source {0} does not belong to a dev build")]
    ForeignSource(String),

    #[error("correlation id {0:?} is not a build id")]
    BadCorrelationId(String),

    #[error("malformed {result} descriptor: {source}")]
    MalformedDescriptor {
        result: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl Skip {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UnknownType(_) => "unknown_type",
            Self::ForeignSource(_) => "foreign_source",
            Self::BadCorrelationId(_) => "bad_correlation_id",
            Self::MalformedDescriptor { .. } => "malformed_descriptor",
        }
    }
}

#[derive(Deserialize)]
struct BinariesDescriptor {
    oci: OciDescriptor,
    #[serde(default)]
    files: Vec<String>,
}

#[derive(Deserialize)]
struct OciDescriptor {
    repo: String,
    tag: String,
}

#[derive(Deserialize)]
struct ImagesDescriptor {
    #[serde(default)]
    images: Vec<ImageDescriptor>,
}

#[derive(Deserialize)]
struct ImageDescriptor {
    url: String,
}

/// Convert an event into the build id and platform result it reports.
///
/// `source_prefix` filters out runs not started by a dev build; an event
/// without a source is accepted.
pub fn parse(event: &CompletionEvent, source_prefix: &str) -> std::result::Result<(i64, PlatformResult), Skip> {
    let phase = match event.event_type.as_str() {
        EVENT_STARTED => Phase::Processing,
        EVENT_SUCCESSFUL => Phase::Success,
        EVENT_FAILED => Phase::Failure,
        other => return Err(Skip::UnknownType(other.to_string())),
    };

    let prefix = source_prefix.trim_end_matches('/');
    if !event.source.is_empty() && !event.source.starts_with(prefix) {
        return Err(Skip::ForeignSource(event.source.clone()));
    }

    let build_id = event
        .correlation_id
        .trim()
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| Skip::BadCorrelationId(event.correlation_id.clone()))?;

    let platform = match (event.params.get(PARAM_OS), event.params.get(PARAM_ARCH)) {
        (Some(os), Some(arch)) if !os.is_empty() && !arch.is_empty() => format!("{os}/{arch}"),
        _ => String::new(),
    };

    let source_commit = event
        .params
        .get(PARAM_REVISION)
        .filter(|rev| rev.len() == 40)
        .cloned()
        .unwrap_or_default();

    let published_archives = match event.results.get(RESULT_BINARIES) {
        Some(raw) => {
            let descriptor: BinariesDescriptor =
                serde_json::from_str(raw).map_err(|source| Skip::MalformedDescriptor {
                    result: RESULT_BINARIES,
                    source,
                })?;
            vec![PublishedArchive {
                repo: descriptor.oci.repo,
                tag: descriptor.oci.tag,
                files: descriptor.files,
            }]
        }
        None => Vec::new(),
    };

    let published_images = match event.results.get(RESULT_IMAGES) {
        Some(raw) => {
            let descriptor: ImagesDescriptor =
                serde_json::from_str(raw).map_err(|source| Skip::MalformedDescriptor {
                    result: RESULT_IMAGES,
                    source,
                })?;
            descriptor
                .images
                .into_iter()
                .map(|image| ImageArtifact {
                    platform: platform.clone(),
                    url: image.url,
                    internal_url: None,
                })
                .collect()
        }
        None => Vec::new(),
    };

    Ok((
        build_id,
        PlatformResult {
            name: event.name.clone(),
            platform,
            phase,
            source_commit,
            started_at: event.started_at,
            ended_at: event.ended_at,
            published_images,
            published_archives,
            url: None,
        },
    ))
}

/// Forwards parsed completion events to the merge engine.
pub struct CompletionHandler {
    service: Arc<DevBuildService>,
}

impl CompletionHandler {
    pub fn new(service: Arc<DevBuildService>) -> Self {
        Self { service }
    }

    /// Merge the event's result. Returns `None` when the event was skipped.
    pub async fn handle(&self, event: &CompletionEvent) -> Result<Option<BuildRecord>> {
        let source_prefix = &self.service.config().trigger_event_source;
        let (build_id, result) = match parse(event, source_prefix) {
            Ok(parsed) => parsed,
            Err(skip @ Skip::UnknownType(_)) => {
                tracing::info!(name = %event.name, reason = %skip, "Ignoring completion event");
                crate::metrics::event_skipped(skip.reason());
                return Ok(None);
            }
            Err(skip) => {
                tracing::warn!(name = %event.name, reason = %skip, "Skipping completion event");
                crate::metrics::event_skipped(skip.reason());
                return Ok(None);
            }
        };

        self.service
            .merge_result(build_id, result, SaveOptions::default())
            .await
            .map(Some)
    }
}
