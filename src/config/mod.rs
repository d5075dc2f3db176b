//! # Config Loading
//!
//! Reads the user's YAML config from a local file or from the bucket once
//! bootstrapped, merges in the optional base profile fetched from the
//! module library, and validates the result. After this module is done the
//! config is read-only for the rest of the run.

pub mod merge;
pub mod validate;

use crate::constants;
use crate::errors::{AgentError, AgentResult};
use crate::model::{Config, VersionSpec};
use crate::provider::Bucket;
use crate::sources::{ModuleSource as _, SourceSet};
use std::path::Path;
use tracing::info;

pub use validate::validate_config;

/// Read the raw config document from a file, or from `config.yaml` at the
/// bucket root when no path is given.
pub async fn load_document(
    path: Option<&Path>,
    bucket: Option<&dyn Bucket>,
) -> AgentResult<serde_yaml::Value> {
    let bytes = match (path, bucket) {
        (Some(path), _) => tokio::fs::read(path).await.map_err(|e| {
            AgentError::Validation(format!("cannot read config file {}: {e}", path.display()))
        })?,
        (None, Some(bucket)) => bucket
            .get_file(constants::CONFIG_KEY)
            .await?
            .ok_or_else(|| {
                AgentError::Validation(format!(
                    "no {} in the state bucket; pass --config or bootstrap first",
                    constants::CONFIG_KEY
                ))
            })?,
        (None, None) => {
            return Err(AgentError::Validation(
                "no config file given and no bucket to read it from".into(),
            ))
        }
    };
    Ok(serde_yaml::from_slice(&bytes)?)
}

/// Parse, merge the base profile if one is configured, and build the final
/// source set. Validation runs separately, against the loaded state.
pub async fn load_config(
    path: Option<&Path>,
    bucket: Option<&dyn Bucket>,
    cache_root: &Path,
) -> AgentResult<(Config, SourceSet)> {
    let user_doc = load_document(path, bucket).await?;
    let mut config: Config = parse_document(user_doc.clone())?;

    if let Some(base) = config.base_config.clone() {
        info!(profile = %base.profile, "merging base profile");
        let bootstrap_sources = SourceSet::from_config(&config, cache_root)?;
        let primary = bootstrap_sources.primary();

        let release = match &base.version {
            Some(VersionSpec::Pinned(v)) => primary.client.release(&v.to_string()).await?,
            _ => primary.client.latest_release().await?,
        };

        let profile_path = format!("{}/{}.yaml", constants::PROFILES_DIR, base.profile);
        if !primary.client.file_exists(&profile_path, &release).await? {
            return Err(AgentError::Validation(format!(
                "base profile '{}' does not exist in {} at release {release}",
                base.profile, primary.url
            )));
        }
        let bytes = primary
            .client
            .file(&profile_path, &release)
            .await
            .map_err(|e| {
                e.context(&format!(
                    "fetching base profile '{}' at release {release}",
                    base.profile
                ))
            })?;
        let base_doc: serde_yaml::Value = serde_yaml::from_slice(&bytes)?;

        let merged = merge::merge_documents(base_doc, user_doc);
        config = parse_document(merged)?;
    }

    let sources = SourceSet::from_config(&config, cache_root)?;
    Ok((config, sources))
}

fn parse_document(doc: serde_yaml::Value) -> AgentResult<Config> {
    serde_yaml::from_value(doc)
        .map_err(|e| AgentError::Validation(format!("invalid config document: {e}")))
}
