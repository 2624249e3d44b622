//! Dev build data models: records, per-platform results and artifact reports.

pub mod build;
pub mod fanout;
pub mod options;
pub mod report;

pub use build::{BuildMeta, BuildRecord, BuildSpec, BuildStatus, Phase, PipelineEngine};
pub use fanout::{FanoutState, PlatformResult, PublishedArchive};
pub use options::{Caller, GetOptions, ListOptions, SaveOptions};
pub use report::{ArtifactReport, BinaryArtifact, ImageArtifact, OciFile};
