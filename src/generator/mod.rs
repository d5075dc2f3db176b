//! # File Generator
//!
//! For each step, produces the exact file tree the remote job executes:
//! provider block, main module block and backend config for Terraform
//! steps, one values document per module for Argo CD steps. All templated
//! substitution happens here, through the [`crate::template::Replacer`],
//! immediately before the step runs.

pub mod argocd;
pub mod hcl;
pub mod terraform;

use crate::constants;
use crate::errors::{AgentError, AgentResult};
use crate::model::{Module, Step, StepType};
use crate::provider::{BackendKind, ProviderType};
use crate::template::Replacer;
use semver::Version;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

/// The artifact set of one step: bucket-relative path → content.
pub type FileSet = BTreeMap<String, Vec<u8>>;

/// A module resolved against its repository for one release iteration.
pub struct ModuleRender<'m> {
    pub module: &'m Module,
    pub repo_url: String,
    pub version: Version,
}

pub struct Generator<'a> {
    pub replacer: &'a Replacer<'a>,
    pub provider_type: ProviderType,
    pub backend: &'a BackendKind,
    pub prefix: &'a str,
}

impl Generator<'_> {
    /// Bucket key prefix a step's files live under.
    pub fn step_files_prefix(prefix: &str, step: &Step) -> String {
        format!("{}/{}", constants::STEPS_PREFIX, step.folder(prefix))
    }

    /// Produce the full artifact set for one step at one release.
    pub async fn files_for_step(
        &self,
        step: &Step,
        renders: &[ModuleRender<'_>],
    ) -> AgentResult<FileSet> {
        match step.step_type {
            StepType::Terraform | StepType::TerraformCustom => {
                self.terraform_files(step, renders).await
            }
            StepType::ArgocdApps => self.argocd_files(step, renders).await,
        }
    }

    async fn terraform_files(
        &self,
        step: &Step,
        renders: &[ModuleRender<'_>],
    ) -> AgentResult<FileSet> {
        let mut rendered = Vec::with_capacity(renders.len());
        for render in renders {
            let inputs = self
                .replace_mapping(&render.module.inputs)
                .await
                .map_err(|e| {
                    e.context(&format!(
                        "generating step '{}' module '{}'",
                        step.name, render.module.name
                    ))
                })?;
            rendered.push(terraform::RenderedModule {
                module: render.module,
                repo_url: render.repo_url.clone(),
                version: render.version.clone(),
                inputs,
            });
        }

        let mut files = FileSet::new();
        files.insert(
            "provider.tf".to_string(),
            terraform::provider_tf(self.provider_type, step, self.prefix).into_bytes(),
        );
        files.insert(
            "main.tf".to_string(),
            terraform::main_tf(&rendered).into_bytes(),
        );
        let state_key = Self::step_files_prefix(self.prefix, step);
        files.insert(
            "backend.conf".to_string(),
            terraform::backend_conf(&self.backend.config_vars(&state_key)).into_bytes(),
        );
        Ok(files)
    }

    async fn argocd_files(
        &self,
        step: &Step,
        renders: &[ModuleRender<'_>],
    ) -> AgentResult<FileSet> {
        let mut files = FileSet::new();
        for render in renders {
            let inputs = self
                .replace_mapping(&render.module.inputs)
                .await
                .map_err(|e| {
                    e.context(&format!(
                        "generating step '{}' app '{}'",
                        step.name, render.module.name
                    ))
                })?;
            let yaml = argocd::values_yaml(step, &inputs)?;
            files.insert(format!("{}.yaml", render.module.name), yaml.into_bytes());
        }
        Ok(files)
    }

    async fn replace_mapping(
        &self,
        mapping: &serde_yaml::Mapping,
    ) -> AgentResult<serde_yaml::Mapping> {
        match self
            .replace_value(&serde_yaml::Value::Mapping(mapping.clone()))
            .await?
        {
            serde_yaml::Value::Mapping(m) => Ok(m),
            _ => Err(AgentError::Validation(
                "module inputs must be a mapping".into(),
            )),
        }
    }

    /// Walk a YAML value, expanding replacement tokens in every string.
    fn replace_value<'v>(
        &'v self,
        value: &'v serde_yaml::Value,
    ) -> Pin<Box<dyn Future<Output = AgentResult<serde_yaml::Value>> + Send + 'v>> {
        Box::pin(async move {
            Ok(match value {
                serde_yaml::Value::String(s) => {
                    serde_yaml::Value::String(self.replacer.replace(s).await?)
                }
                serde_yaml::Value::Sequence(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.replace_value(item).await?);
                    }
                    serde_yaml::Value::Sequence(out)
                }
                serde_yaml::Value::Mapping(map) => {
                    let mut out = serde_yaml::Mapping::new();
                    for (k, v) in map {
                        out.insert(k.clone(), self.replace_value(v).await?);
                    }
                    serde_yaml::Value::Mapping(out)
                }
                other => other.clone(),
            })
        })
    }
}
