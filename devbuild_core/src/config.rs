//! Dev build configuration, built once at startup and overridable from
//! environment variables, shared by reference.

use std::collections::{BTreeMap, BTreeSet};

use crate::models::PipelineEngine;

#[derive(Clone, Debug)]
pub struct DevBuildConfig {
    /// Known products mapped to their `owner/name` source repository.
    pub product_repos: BTreeMap<String, String>,
    /// Editions accepted by the monolithic engine.
    pub monolithic_editions: BTreeSet<String>,
    /// Editions accepted by the fan-out engine.
    pub fanout_editions: BTreeSet<String>,
    /// Product whose enterprise edition carries a separate plugin source.
    pub plugin_product: String,
    /// Edition that requires the plugin source.
    pub enterprise_edition: String,
    pub fips: FipsDefaults,
    /// Job name in the monolithic job system.
    pub job_name: String,
    /// API account allowed to set privileged fields such as the target image.
    pub admin_account: String,
    /// Base URL for per-platform fan-out run pages.
    pub fanout_dashboard_url: String,
    /// Base URL of the OCI file download service.
    pub oci_download_url: String,
    /// Image URL prefix → internal mirror prefix.
    pub image_mirrors: BTreeMap<String, String>,
    /// CloudEvent type of the outbound fan-out trigger.
    pub trigger_event_type: String,
    /// CloudEvent source prefix; the record id is appended.
    pub trigger_event_source: String,
    /// Reject merges that would overwrite a terminal per-platform result.
    pub reject_terminal_regressions: bool,
    /// Attempts before a contended merge gives up with an internal error.
    pub merge_conflict_retries: usize,
}

/// Substitutions applied when the `fips` feature is requested.
#[derive(Clone, Debug)]
pub struct FipsDefaults {
    pub feature: String,
    pub build_env: String,
    /// Products built with a dedicated FIPS builder image.
    pub builder_images: BTreeMap<String, String>,
    /// Products shipped on a dedicated FIPS base image.
    pub base_images: BTreeMap<String, String>,
    /// Dockerfile URL for every other product; `{name}` is replaced.
    pub dockerfile_url_template: String,
}

impl FipsDefaults {
    pub fn dockerfile_url(&self, name: &str) -> String {
        self.dockerfile_url_template.replace("{name}", name)
    }
}

impl Default for FipsDefaults {
    fn default() -> Self {
        Self {
            feature: "fips".to_string(),
            build_env: "ENABLE_FIPS=1".to_string(),
            builder_images: BTreeMap::from([(
                "tikv".to_string(),
                "hub.pingcap.net/jenkins/tikv-builder:fips".to_string(),
            )]),
            base_images: BTreeMap::from([(
                "tikv".to_string(),
                "hub.pingcap.net/bases/tikv-base:v1-fips".to_string(),
            )]),
            dockerfile_url_template:
                "https://raw.githubusercontent.com/PingCAP-QE/artifacts/main/dockerfiles/{name}.Dockerfile"
                    .to_string(),
        }
    }
}

impl Default for DevBuildConfig {
    fn default() -> Self {
        let product_repos = [
            ("br", "pingcap/tidb"),
            ("dm", "pingcap/tiflow"),
            ("drainer", "pingcap/tidb-binlog"),
            ("dumpling", "pingcap/tidb"),
            ("ng-monitoring", "pingcap/ng-monitoring"),
            ("pd", "tikv/pd"),
            ("pump", "pingcap/tidb-binlog"),
            ("ticdc", "pingcap/tiflow"),
            ("ticdc-newarch", "pingcap/ticdc"),
            ("tidb", "pingcap/tidb"),
            ("tidb-binlog", "pingcap/tidb-binlog"),
            ("tidb-dashboard", "pingcap/tidb-dashboard"),
            ("tidb-lightning", "pingcap/tidb"),
            ("tidb-tools", "pingcap/tidb-tools"),
            ("tiflash", "pingcap/tiflash"),
            ("tikv", "tikv/tikv"),
            ("tiproxy", "pingcap/tiproxy"),
        ]
        .into_iter()
        .map(|(product, repo)| (product.to_string(), repo.to_string()))
        .collect();

        let editions = |names: &[&str]| names.iter().map(|s| s.to_string()).collect();

        Self {
            product_repos,
            monolithic_editions: editions(&["enterprise", "community"]),
            fanout_editions: editions(&[
                "enterprise",
                "community",
                "failpoint",
                "fips",
                "next-gen",
                "experiment",
            ]),
            plugin_product: "tidb".to_string(),
            enterprise_edition: "enterprise".to_string(),
            fips: FipsDefaults::default(),
            job_name: "devbuild".to_string(),
            admin_account: "admin".to_string(),
            fanout_dashboard_url: "https://do.pingcap.net/tekton/#/namespaces/ee-cd/pipelineruns"
                .to_string(),
            oci_download_url: "https://internal.do.pingcap.net:30443/dl/oci-file".to_string(),
            image_mirrors: BTreeMap::new(),
            trigger_event_type: "net.pingcap.tibuild.devbuild.push".to_string(),
            trigger_event_source: "https://tibuild.pingcap.net/api/devbuilds/".to_string(),
            reject_terminal_regressions: false,
            merge_conflict_retries: 3,
        }
    }
}

impl DevBuildConfig {
    /// Defaults overridden by `DEVBUILD_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("DEVBUILD_JOB_NAME") {
            config.job_name = v;
        }
        if let Ok(v) = std::env::var("DEVBUILD_ADMIN_ACCOUNT") {
            config.admin_account = v;
        }
        if let Ok(v) = std::env::var("DEVBUILD_FANOUT_DASHBOARD_URL") {
            config.fanout_dashboard_url = v;
        }
        if let Ok(v) = std::env::var("DEVBUILD_OCI_DOWNLOAD_URL") {
            config.oci_download_url = v;
        }
        if let Ok(v) = std::env::var("DEVBUILD_TRIGGER_EVENT_SOURCE") {
            config.trigger_event_source = v;
        }
        // Format: "src=dst,src2=dst2"
        if let Ok(v) = std::env::var("DEVBUILD_IMAGE_MIRRORS") {
            config.image_mirrors = parse_pairs(&v);
        }
        // Format: "product=owner/repo,..." merged over the built-in map.
        if let Ok(v) = std::env::var("DEVBUILD_PRODUCT_REPOS") {
            config.product_repos.extend(parse_pairs(&v));
        }
        config.reject_terminal_regressions = std::env::var("DEVBUILD_REJECT_TERMINAL_REGRESSIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(config.reject_terminal_regressions);
        config.merge_conflict_retries = std::env::var("DEVBUILD_MERGE_CONFLICT_RETRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(config.merge_conflict_retries);

        if config.merge_conflict_retries == 0 {
            tracing::warn!("DEVBUILD_MERGE_CONFLICT_RETRIES is 0 -- merges will attempt once");
        }

        config
    }

    pub fn is_known_product(&self, product: &str) -> bool {
        self.product_repos.contains_key(product)
    }

    pub fn repo_for(&self, product: &str) -> Option<&str> {
        self.product_repos.get(product).map(String::as_str)
    }

    pub fn editions_for(&self, engine: PipelineEngine) -> &BTreeSet<String> {
        match engine {
            PipelineEngine::Monolithic => &self.monolithic_editions,
            PipelineEngine::Fanout => &self.fanout_editions,
        }
    }

    pub fn is_admin(&self, account: Option<&str>) -> bool {
        account == Some(self.admin_account.as_str())
    }

    /// Internal mirror URL for an image, if a mirror prefix matches.
    pub fn mirror_for(&self, image: &str) -> Option<String> {
        self.image_mirrors.iter().find_map(|(src, dst)| {
            image
                .strip_prefix(src.as_str())
                .map(|rest| format!("{dst}{rest}"))
        })
    }
}

fn parse_pairs(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let (k, v) = (k.trim(), v.trim());
            (!k.is_empty() && !v.is_empty()).then(|| (k.to_string(), v.to_string()))
        })
        .collect()
}
