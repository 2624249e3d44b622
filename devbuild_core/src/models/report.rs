//! Published artifacts of a build.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArtifactReport {
    pub source_commit: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub plugin_source_commit: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageArtifact>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub binaries: Vec<BinaryArtifact>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub printed_version: String,
}

impl ArtifactReport {
    pub(crate) fn strip_display_fields(&mut self) {
        for image in &mut self.images {
            image.internal_url = None;
        }
        for binary in &mut self.binaries {
            // Only rendered URLs are dropped; URLs reported without an OCI
            // reference are the sole location and must survive.
            if binary.oci_file.is_some() {
                binary.url.clear();
            }
            if binary.checksum_oci_file.is_some() {
                binary.checksum_url.clear();
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageArtifact {
    pub platform: String,
    pub url: String,
    /// Display only, rendered on read from the image mirror map.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_url: Option<String>,
}

/// A primary binary file and an optional checksum sidecar.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BinaryArtifact {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub component: String,
    pub platform: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(rename = "sha256URL", skip_serializing_if = "String::is_empty")]
    pub checksum_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oci_file: Option<OciFile>,
    #[serde(rename = "sha256OciFile", skip_serializing_if = "Option::is_none")]
    pub checksum_oci_file: Option<OciFile>,
}

/// One file inside an OCI artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciFile {
    pub repo: String,
    pub tag: String,
    pub file: String,
}
