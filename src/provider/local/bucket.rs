//! Filesystem-backed bucket for the no-cloud mode. Keys map to paths under
//! one root directory.

use crate::errors::{AgentError, AgentResult};
use crate::provider::Bucket;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub struct LocalBucket {
    root: PathBuf,
}

impl LocalBucket {
    pub fn new(root: &Path) -> AgentResult<Self> {
        std::fs::create_dir_all(root)?;
        Ok(LocalBucket {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> AgentResult<PathBuf> {
        if key.split('/').any(|segment| segment == "..") {
            return Err(AgentError::Validation(format!(
                "bucket key '{key}' must not traverse upwards"
            )));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl Bucket for LocalBucket {
    async fn put_file(&self, key: &str, content: &[u8]) -> AgentResult<()> {
        let path = self.path_of(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    async fn get_file(&self, key: &str) -> AgentResult<Option<Vec<u8>>> {
        let path = self.path_of(key)?;
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_file(&self, key: &str) -> AgentResult<()> {
        let path = self.path_of(key)?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AgentError::NotFound(format!("bucket object {key}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_folder_files(&self, prefix: &str) -> AgentResult<Vec<String>> {
        let dir = self.path_of(prefix)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let root = self.root.clone();
        let mut keys: Vec<String> = WalkDir::new(&dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                entry
                    .path()
                    .strip_prefix(&root)
                    .ok()
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
            })
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn check_folder_exists(&self, prefix: &str) -> AgentResult<bool> {
        Ok(self.path_of(prefix)?.is_dir())
    }

    async fn bucket_exists(&self) -> AgentResult<bool> {
        Ok(self.root.is_dir())
    }

    async fn delete(&self) -> AgentResult<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_list_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = LocalBucket::new(dir.path()).unwrap();

        bucket
            .put_file("steps/t1-net-dev/main.tf", b"module {}")
            .await
            .unwrap();
        bucket
            .put_file("steps/t1-net-dev/provider.tf", b"provider {}")
            .await
            .unwrap();

        assert_eq!(
            bucket.get_file("steps/t1-net-dev/main.tf").await.unwrap(),
            Some(b"module {}".to_vec())
        );
        assert_eq!(bucket.get_file("missing").await.unwrap(), None);

        let listed = bucket.list_folder_files("steps/t1-net-dev").await.unwrap();
        assert_eq!(
            listed,
            vec![
                "steps/t1-net-dev/main.tf".to_string(),
                "steps/t1-net-dev/provider.tf".to_string(),
            ]
        );

        bucket.delete_file("steps/t1-net-dev/main.tf").await.unwrap();
        let err = bucket
            .delete_file("steps/t1-net-dev/main.tf")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn traversal_keys_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = LocalBucket::new(dir.path()).unwrap();
        assert!(bucket.get_file("../outside").await.is_err());
    }
}
