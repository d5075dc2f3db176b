//! YAML-file parameter store for the no-cloud mode. Parameters and secrets
//! share one document behind a lock; the local backend has no key
//! management, so the encryption-key id is recorded for visibility only.

use crate::errors::{AgentError, AgentResult};
use crate::provider::ParamStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ParamsFile {
    #[serde(default)]
    parameters: BTreeMap<String, String>,
    #[serde(default)]
    secrets: BTreeMap<String, String>,
    #[serde(default)]
    encryption_key_id: Option<String>,
}

pub struct LocalParams {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LocalParams {
    pub fn new(path: &Path) -> AgentResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(LocalParams {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    async fn read(&self) -> AgentResult<ParamsFile> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_yaml::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ParamsFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, file: &ParamsFile) -> AgentResult<()> {
        tokio::fs::write(&self.path, serde_yaml::to_string(file)?).await?;
        Ok(())
    }
}

#[async_trait]
impl ParamStore for LocalParams {
    async fn get_parameter(&self, name: &str) -> AgentResult<String> {
        let _guard = self.lock.lock().await;
        let file = self.read().await?;
        file.parameters
            .get(name)
            .or_else(|| file.secrets.get(name))
            .cloned()
            .ok_or_else(|| AgentError::NotFound(format!("parameter {name}")))
    }

    async fn parameter_exists(&self, name: &str) -> AgentResult<bool> {
        let _guard = self.lock.lock().await;
        let file = self.read().await?;
        Ok(file.parameters.contains_key(name) || file.secrets.contains_key(name))
    }

    async fn put_parameter(&self, name: &str, value: &str) -> AgentResult<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        file.parameters.insert(name.to_string(), value.to_string());
        self.write(&file).await
    }

    async fn list_parameters(&self, prefix: &str) -> AgentResult<Vec<String>> {
        let _guard = self.lock.lock().await;
        let file = self.read().await?;
        Ok(file
            .parameters
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete_parameter(&self, name: &str) -> AgentResult<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        if file.parameters.remove(name).is_none() {
            return Err(AgentError::NotFound(format!("parameter {name}")));
        }
        self.write(&file).await
    }

    async fn put_secret(&self, name: &str, value: &str) -> AgentResult<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        file.secrets.insert(name.to_string(), value.to_string());
        self.write(&file).await
    }

    async fn delete_secret(&self, name: &str) -> AgentResult<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        if file.secrets.remove(name).is_none() {
            return Err(AgentError::NotFound(format!("secret {name}")));
        }
        self.write(&file).await
    }

    async fn add_encryption_key_id(&self, key_id: &str) -> AgentResult<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        info!(key_id, "recording encryption key for the local store");
        file.encryption_key_id = Some(key_id.to_string());
        self.write(&file).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parameters_and_secrets_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let params = LocalParams::new(&dir.path().join("params.yaml")).unwrap();

        params.put_parameter("/t1/custom/team", "platform").await.unwrap();
        params.put_secret("/t1/db/password", "hunter2").await.unwrap();

        assert_eq!(
            params.get_parameter("/t1/custom/team").await.unwrap(),
            "platform"
        );
        assert_eq!(
            params.get_parameter("/t1/db/password").await.unwrap(),
            "hunter2"
        );
        assert!(params.parameter_exists("/t1/custom/team").await.unwrap());

        assert_eq!(
            params.list_parameters("/t1/custom").await.unwrap(),
            vec!["/t1/custom/team".to_string()]
        );

        params.delete_parameter("/t1/custom/team").await.unwrap();
        let err = params.get_parameter("/t1/custom/team").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
