//! # Module Sources
//!
//! Resolves versioned module sources from one or more git repositories.
//! The [`ModuleSource`] trait is the contract the executor and generator
//! depend on; [`git::GitSource`] implements it over a command-line git
//! working copy. [`SourceSet`] owns the ordered repository list and the
//! version-resolution rules.

pub mod git;

use crate::errors::{AgentError, AgentResult};
use crate::model::{Config, Module, Source, Step, VersionSpec};
use async_trait::async_trait;
use semver::Version;
use std::path::Path;
use std::sync::Arc;

/// A module repository at some URL, exposing files at specific release tags.
#[async_trait]
pub trait ModuleSource: Send + Sync {
    fn url(&self) -> &str;

    /// Greatest semver release tag; `Validation` error when none exists.
    async fn latest_release(&self) -> AgentResult<Version>;

    /// Resolve one tag; `NotFound` when absent.
    async fn release(&self, tag: &str) -> AgentResult<Version>;

    /// Ascending releases with `oldest < r ≤ newest`. `oldest = None` means
    /// "from scratch": the walk jumps straight to `newest`.
    async fn releases(&self, oldest: Option<&Version>, newest: &Version)
        -> AgentResult<Vec<Version>>;

    /// File contents at a release; `NotFound` when the path is absent.
    async fn file(&self, path: &str, release: &Version) -> AgentResult<Vec<u8>>;

    async fn file_exists(&self, path: &str, release: &Version) -> AgentResult<bool>;

    /// Directory test at a release.
    async fn path_exists(&self, path: &str, release: &Version) -> AgentResult<bool>;
}

/// One configured repository plus its resolution caps.
#[derive(Clone)]
pub struct SourceEntry {
    pub url: String,
    pub client: Arc<dyn ModuleSource>,
    /// Modules served by this repo never resolve above a forced version.
    pub forced_version: Option<Version>,
}

/// The ordered repository list and the version-resolution rules.
#[derive(Clone)]
pub struct SourceSet {
    entries: Vec<SourceEntry>,
    default_version: VersionSpec,
    /// Base-config release cap: unpinned modules never resolve above it.
    release_limit: Option<Version>,
}

/// Where a module's files come from and the version it resolves to.
#[derive(Clone)]
pub struct ModuleResolution {
    pub repo_url: String,
    pub client: Arc<dyn ModuleSource>,
    pub target: Version,
}

impl SourceSet {
    pub fn new(
        entries: Vec<SourceEntry>,
        default_version: VersionSpec,
        release_limit: Option<Version>,
    ) -> AgentResult<Self> {
        if entries.is_empty() {
            return Err(AgentError::Validation(
                "at least one module source is required".into(),
            ));
        }
        Ok(SourceSet {
            entries,
            default_version,
            release_limit,
        })
    }

    /// Build git-backed sources for every configured repository.
    pub fn from_config(config: &Config, cache_root: &Path) -> AgentResult<Self> {
        if config.sources.is_empty() {
            return Err(AgentError::Validation(
                "at least one module source is required".into(),
            ));
        }
        let entries = config
            .sources
            .iter()
            .map(|source| build_entry(source, cache_root))
            .collect::<AgentResult<Vec<_>>>()?;
        Ok(SourceSet {
            entries,
            default_version: config.version_or_stable(),
            release_limit: config
                .base_config
                .as_ref()
                .and_then(|b| b.version.as_ref())
                .and_then(|v| v.as_pinned().cloned()),
        })
    }

    /// The repository base profiles are fetched from.
    pub fn primary(&self) -> &SourceEntry {
        &self.entries[0]
    }

    /// The base-config release cap, when one is pinned.
    pub fn release_limit(&self) -> Option<&Version> {
        self.release_limit.as_ref()
    }

    /// Resolve one module: pick the desired version (module pin, else step
    /// version, else the config default), clamp unpinned resolutions by the
    /// repo's forced version and the base-config release limit, and return
    /// the first repository that actually contains the module's path at the
    /// resolved release.
    pub async fn resolve_module(
        &self,
        step: &Step,
        module: &Module,
    ) -> AgentResult<ModuleResolution> {
        let spec = module
            .version
            .clone()
            .or_else(|| step.version.clone())
            .unwrap_or_else(|| self.default_version.clone());
        // Only a pin on the module itself bypasses the release limit.
        let explicit_pin = matches!(module.version, Some(VersionSpec::Pinned(_)));

        let mut last_err: Option<AgentError> = None;
        for entry in &self.entries {
            let target = match self.target_for(entry, &spec, explicit_pin).await {
                Ok(v) => v,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            if entry.client.path_exists(&module.source, &target).await? {
                return Ok(ModuleResolution {
                    repo_url: entry.url.clone(),
                    client: Arc::clone(&entry.client),
                    target,
                });
            }
        }

        Err(last_err.unwrap_or_else(|| {
            AgentError::NotFound(format!(
                "module '{}' of step '{}': source path '{}' missing from every configured repository",
                module.name, step.name, module.source
            ))
        }))
    }

    async fn target_for(
        &self,
        entry: &SourceEntry,
        spec: &VersionSpec,
        explicit_pin: bool,
    ) -> AgentResult<Version> {
        let caps = |v: Version| -> Version {
            let mut v = v;
            if let Some(forced) = &entry.forced_version {
                if *forced < v {
                    v = forced.clone();
                }
            }
            if let Some(limit) = &self.release_limit {
                if *limit < v {
                    v = limit.clone();
                }
            }
            v
        };

        match spec {
            VersionSpec::Pinned(v) if explicit_pin => {
                // Confirm the tag exists; the pin wins over every cap.
                entry.client.release(&v.to_string()).await
            }
            VersionSpec::Pinned(v) => {
                let capped = caps(v.clone());
                entry.client.release(&capped.to_string()).await
            }
            VersionSpec::Stable => {
                let latest = entry.client.latest_release().await?;
                Ok(caps(latest))
            }
        }
    }
}

fn build_entry(source: &Source, cache_root: &Path) -> AgentResult<SourceEntry> {
    let client = git::GitSource::open(source, cache_root)?;
    Ok(SourceEntry {
        url: source.url.clone(),
        client: Arc::new(client),
        forced_version: source
            .version
            .as_ref()
            .and_then(|v| v.as_pinned().cloned()),
    })
}
