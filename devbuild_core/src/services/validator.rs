//! Request defaulting and validation.
//!
//! `normalize` is a pure transform: it fills derived fields first, then
//! rejects anything malformed. Nothing here touches storage or the network.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::DevBuildConfig;
use crate::error::{DevBuildError, Result};
use crate::models::{BuildSpec, PipelineEngine};

static VERSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v(\d+\.\d+)\.\d+.*$").unwrap());
static HOTFIX_VERSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v(\d+\.\d+\.\d+)-\d{8,}.*$").unwrap());
static GIT_REF_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^((v\d.*)|(pull/\d+)|([0-9a-fA-F]{40})|(release-.*)|master|main|(tag/.+)|(branch/.+))$",
    )
    .unwrap()
});
static REPO_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^([\w_-]+/[\w_-]+)$").unwrap());
static COMMIT_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{40}$").unwrap());

/// Fill derived fields, then validate. Returns the normalised spec.
pub fn normalize(mut spec: BuildSpec, config: &DevBuildConfig) -> Result<BuildSpec> {
    fill_defaults(&mut spec, config);
    validate(&spec, config)?;
    Ok(spec)
}

/// True if `git_ref` already names a full commit.
pub fn is_commit_hash(git_ref: &str) -> bool {
    COMMIT_REGEX.is_match(git_ref)
}

fn fill_defaults(spec: &mut BuildSpec, config: &DevBuildConfig) {
    if needs_plugin(spec, config) && spec.plugin_git_ref.is_empty() {
        if let Some(branch) = plugin_release_branch(&spec.version, spec.is_hotfix) {
            spec.plugin_git_ref = branch;
        }
    }

    if spec.source_repo.is_empty() {
        if let Some(repo) = config.repo_for(&spec.product) {
            spec.source_repo = repo.to_string();
        }
    }

    if spec.has_feature(&config.fips.feature) {
        fill_fips(spec, config);
    }
}

fn needs_plugin(spec: &BuildSpec, config: &DevBuildConfig) -> bool {
    spec.product == config.plugin_product && spec.edition == config.enterprise_edition
}

/// `release-X.Y` for regular builds, `release-X.Y.Z` for dated hotfixes.
fn plugin_release_branch(version: &str, hotfix: bool) -> Option<String> {
    let regex = if hotfix {
        &*HOTFIX_VERSION_REGEX
    } else {
        &*VERSION_REGEX
    };
    regex
        .captures(version)
        .and_then(|caps| caps.get(1))
        .map(|m| format!("release-{}", m.as_str()))
}

fn fill_fips(spec: &mut BuildSpec, config: &DevBuildConfig) {
    let fips = &config.fips;
    if !spec.build_env.contains(&fips.build_env) {
        spec.build_env = if spec.build_env.is_empty() {
            fips.build_env.clone()
        } else {
            format!("{} {}", fips.build_env, spec.build_env)
        };
    }

    let builder = fips.builder_images.get(&spec.product);
    let base = fips.base_images.get(&spec.product);
    if builder.is_some() || base.is_some() {
        if spec.builder_image.is_empty() {
            spec.builder_image = builder.cloned().unwrap_or_default();
        }
        if spec.base_image.is_empty() {
            spec.base_image = base.cloned().unwrap_or_default();
        }
    } else {
        let name = if needs_plugin(spec, config) {
            format!("{}-{}", spec.product, config.enterprise_edition)
        } else {
            spec.product.clone()
        };
        spec.dockerfile = fips.dockerfile_url(&name);
    }
}

fn validate(spec: &BuildSpec, config: &DevBuildConfig) -> Result<()> {
    if !config.is_known_product(&spec.product) {
        return Err(DevBuildError::invalid("product is not valid"));
    }
    if !config
        .editions_for(spec.pipeline_engine)
        .contains(&spec.edition)
    {
        return Err(DevBuildError::invalid(format!(
            "edition is not valid for the {} engine",
            spec.pipeline_engine.as_str()
        )));
    }
    if !VERSION_REGEX.is_match(&spec.version) {
        return Err(DevBuildError::invalid("version is not valid"));
    }
    if !GIT_REF_REGEX.is_match(&spec.git_ref) {
        return Err(DevBuildError::invalid("gitRef is not valid"));
    }
    if !spec.source_repo.is_empty() && !REPO_REGEX.is_match(&spec.source_repo) {
        return Err(DevBuildError::invalid(
            "sourceRepo is not valid, should be like org/repo",
        ));
    }
    if needs_plugin(spec, config) && !GIT_REF_REGEX.is_match(&spec.plugin_git_ref) {
        return Err(DevBuildError::invalid("pluginGitRef is not valid"));
    }
    if spec.pipeline_engine == PipelineEngine::Monolithic && !spec.platform.is_empty() {
        return Err(DevBuildError::invalid(
            "platform must be empty for the jenkins engine",
        ));
    }
    if spec.is_hotfix {
        if !HOTFIX_VERSION_REGEX.is_match(&spec.version) {
            return Err(DevBuildError::invalid(
                "version must be dated like v7.0.0-20230102... for hotfix",
            ));
        }
        if !spec.target_image.is_empty() {
            return Err(DevBuildError::invalid("target image must be empty for hotfix"));
        }
    }
    Ok(())
}
