//! Derives one aggregate status and artifact report from per-platform results.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::models::{ArtifactReport, BinaryArtifact, ImageArtifact, OciFile, Phase, PlatformResult};

/// Suffix identifying a checksum sidecar next to the file it covers.
pub const CHECKSUM_SUFFIX: &str = ".sha256";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregate {
    pub phase: Phase,
    pub report: ArtifactReport,
    pub started_at: Option<DateTime<Utc>>,
    /// Only set once `phase` is terminal.
    pub ended_at: Option<DateTime<Utc>>,
}

/// Aggregate a fan-out build's platform results.
///
/// Results are grouped by platform. The build succeeds only when every
/// platform that reported anything has a successful result and none failed.
/// Any failed platform fails the build. Aborted and errored sub-jobs count
/// as failed.
pub fn aggregate(results: &[PlatformResult]) -> Aggregate {
    let mut triggered = BTreeSet::new();
    let mut succeeded = BTreeSet::new();
    let mut failed = BTreeSet::new();

    for result in results {
        let key = result.platform_key();
        triggered.insert(key);
        match result.phase {
            Phase::Success => {
                succeeded.insert(key);
            }
            Phase::Failure | Phase::Aborted | Phase::Error => {
                failed.insert(key);
            }
            Phase::Pending | Phase::Processing => {}
        }
    }

    let phase = if !triggered.is_empty() && failed.is_empty() && succeeded.len() == triggered.len()
    {
        Phase::Success
    } else if !failed.is_empty() {
        Phase::Failure
    } else if !results.is_empty() {
        Phase::Processing
    } else {
        Phase::Pending
    };

    let started_at = results.iter().filter_map(|r| r.started_at).min();
    let ended_at = if phase.is_terminal() {
        results.iter().filter_map(|r| r.ended_at).max()
    } else {
        None
    };

    Aggregate {
        phase,
        report: build_report(results),
        started_at,
        ended_at,
    }
}

fn build_report(results: &[PlatformResult]) -> ArtifactReport {
    let mut report = ArtifactReport::default();

    for result in results {
        let platform = result.platform_key();

        if !result.source_commit.is_empty() {
            report.source_commit = result.source_commit.clone();
        }

        for archive in &result.published_archives {
            let sidecars: BTreeSet<&str> = archive
                .files
                .iter()
                .map(String::as_str)
                .filter(|f| f.ends_with(CHECKSUM_SUFFIX))
                .collect();

            for file in archive.files.iter().filter(|f| !f.ends_with(CHECKSUM_SUFFIX)) {
                let sidecar = format!("{file}{CHECKSUM_SUFFIX}");
                let oci = |file: String| OciFile {
                    repo: archive.repo.clone(),
                    tag: archive.tag.clone(),
                    file,
                };
                report.binaries.push(BinaryArtifact {
                    platform: platform.to_string(),
                    checksum_oci_file: sidecars
                        .contains(sidecar.as_str())
                        .then(|| oci(sidecar.clone())),
                    oci_file: Some(oci(file.clone())),
                    ..Default::default()
                });
            }
        }

        report
            .images
            .extend(result.published_images.iter().map(|image| ImageArtifact {
                platform: platform.to_string(),
                url: image.url.clone(),
                internal_url: None,
            }));
    }

    report
}
