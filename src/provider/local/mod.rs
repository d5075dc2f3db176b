//! # Local Backend
//!
//! The no-cloud mode: a directory tree stands in for the bucket, a YAML
//! file for the parameter store, and `terraform` subprocesses for the
//! remote jobs. Everything lives under `$INFRA_AGENT_HOME` (default
//! `.infra-agent/`), one subtree per prefix.

mod bucket;
mod job;
mod params;

pub use bucket::LocalBucket;
pub use job::LocalJobRunner;
pub use params::LocalParams;

use crate::constants;
use crate::errors::{AgentError, AgentResult};
use crate::provider::{
    encryption_key_from_outputs, BackendKind, CloudProvider, ParamStore as _, ProviderType,
    Resources,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub struct LocalProvider {
    root: PathBuf,
    cloud_prefix: String,
}

impl LocalProvider {
    pub fn new(prefix: &str) -> AgentResult<Self> {
        let base = std::env::var(constants::LOCAL_ROOT_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".infra-agent"));
        Ok(LocalProvider {
            root: base.join(prefix),
            cloud_prefix: format!("infra-agent-{prefix}"),
        })
    }

    fn build_resources(&self) -> AgentResult<Resources> {
        let bucket_root = self.root.join("bucket");
        let bucket = Arc::new(LocalBucket::new(&bucket_root)?);
        let params = Arc::new(LocalParams::new(&self.root.join("params.yaml"))?);
        let param_root = format!("/{}", self.cloud_prefix);
        let runner = Arc::new(LocalJobRunner::new(
            &self.root,
            bucket.clone(),
            params.clone(),
            &param_root,
        )?);
        Ok(Resources {
            bucket,
            pipeline: runner.clone(),
            builder: runner,
            params,
            provider_type: ProviderType::Local,
            bucket_name: bucket_root.to_string_lossy().into_owned(),
            region: "local".to_string(),
            cloud_prefix: self.cloud_prefix.clone(),
            backend: BackendKind::Local {
                root: self.root.join("tfstate"),
            },
        })
    }
}

#[async_trait]
impl CloudProvider for LocalProvider {
    async fn setup_resources(&self) -> AgentResult<Resources> {
        tokio::fs::create_dir_all(self.root.join("tfstate")).await?;
        self.build_resources()
    }

    async fn get_resources(&self) -> AgentResult<Resources> {
        if !self.root.is_dir() {
            return Err(AgentError::NotFound(format!(
                "local backend at {}; bootstrap first",
                self.root.display()
            )));
        }
        self.build_resources()
    }

    async fn delete_resources(
        &self,
        delete_bucket: bool,
        _delete_service_account: bool,
    ) -> AgentResult<()> {
        for dir in ["jobs", "work", "tfstate"] {
            let path = self.root.join(dir);
            if path.exists() {
                tokio::fs::remove_dir_all(path).await?;
            }
        }
        if delete_bucket {
            let bucket_path = self.root.join("bucket");
            if bucket_path.exists() {
                tokio::fs::remove_dir_all(bucket_path).await?;
            }
            let params_path = self.root.join("params.yaml");
            if params_path.exists() {
                tokio::fs::remove_file(params_path).await?;
            }
            info!(root = %self.root.display(), "local backend deleted");
        }
        Ok(())
    }

    async fn add_encryption(
        &self,
        module_name: &str,
        outputs: &HashMap<String, serde_json::Value>,
    ) -> AgentResult<()> {
        match encryption_key_from_outputs(outputs) {
            Some(key_id) => {
                let resources = self.build_resources()?;
                resources.params.add_encryption_key_id(&key_id).await
            }
            None => {
                warn!(
                    module = module_name,
                    "encryption module produced no recognizable key output"
                );
                Ok(())
            }
        }
    }

    async fn setup_schedule(&self, cron: Option<&str>) -> AgentResult<()> {
        if let Some(cron) = cron {
            info!(
                cron,
                "local backend has no scheduler; run 'infra-agent update' from your own cron"
            );
        }
        Ok(())
    }

    fn is_running_locally(&self) -> bool {
        true
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_output_lookup_prefers_arns() {
        let mut outputs = HashMap::new();
        outputs.insert("key_id".to_string(), serde_json::json!("1234"));
        outputs.insert(
            "key_arn".to_string(),
            serde_json::json!("arn:aws:kms:eu-west-1:1:key/abc"),
        );
        assert_eq!(
            encryption_key_from_outputs(&outputs).unwrap(),
            "arn:aws:kms:eu-west-1:1:key/abc"
        );
        assert_eq!(encryption_key_from_outputs(&HashMap::new()), None);
    }
}
