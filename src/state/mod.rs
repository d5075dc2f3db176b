//! # State Store
//!
//! Loads and persists the applied-version state document from the bucket,
//! reconciles it against the active config, and serializes every mutation
//! behind one lock so readers always see a consistent snapshot. The
//! executor is the only writer; the underlying bucket client is never
//! exposed to it.

use crate::constants;
use crate::errors::{AgentError, AgentResult};
use crate::model::{Config, State};
use crate::provider::Bucket;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct StateStore {
    bucket: Arc<dyn Bucket>,
    inner: Mutex<State>,
    run_id: String,
}

/// Contents of the run-lock object guarding against two concurrent agents.
#[derive(Debug, Serialize, Deserialize)]
struct RunLock {
    run_id: String,
    acquired_at: DateTime<Utc>,
}

impl StateStore {
    /// Load `state.yaml` from the bucket; an absent document is an empty
    /// state (first run).
    pub async fn load(bucket: Arc<dyn Bucket>) -> AgentResult<Self> {
        let state = match bucket.get_file(constants::STATE_KEY).await? {
            Some(bytes) => serde_yaml::from_slice(&bytes)
                .map_err(|e| AgentError::Validation(format!("corrupt state document: {e}")))?,
            None => {
                info!("no state document found, starting from an empty state");
                State::default()
            }
        };
        Ok(StateStore {
            bucket,
            inner: Mutex::new(state),
            run_id: new_run_id(),
        })
    }

    pub async fn snapshot(&self) -> State {
        self.inner.lock().await.clone()
    }

    /// Reconcile against the config and persist the result: stale entries
    /// dropped, placeholders inserted, ordering mirrored.
    pub async fn reconcile(&self, config: &Config) -> AgentResult<()> {
        let mut state = self.inner.lock().await;
        state.reconcile(config);
        self.save(&state).await
    }

    /// Apply one mutation and flush it to the bucket before returning.
    /// At most one mutation is ever in flight.
    pub async fn update<F>(&self, mutate: F) -> AgentResult<()>
    where
        F: FnOnce(&mut State),
    {
        let mut state = self.inner.lock().await;
        mutate(&mut state);
        self.save(&state).await
    }

    async fn save(&self, state: &State) -> AgentResult<()> {
        let yaml = serde_yaml::to_string(state)?;
        self.bucket
            .put_file(constants::STATE_KEY, yaml.as_bytes())
            .await
            .map_err(|e| e.context("persisting state document"))
    }

    /// Take the run lock. A fresh lock held by another agent is fatal; a
    /// lock older than the pipeline timeout is presumed abandoned and
    /// replaced.
    pub async fn acquire_run_lock(&self) -> AgentResult<()> {
        if let Some(bytes) = self.bucket.get_file(constants::STATE_LOCK_KEY).await? {
            match serde_yaml::from_slice::<RunLock>(&bytes) {
                Ok(held) if held.run_id != self.run_id => {
                    let age = Utc::now() - held.acquired_at;
                    if age.to_std().unwrap_or_default() < constants::PIPELINE_TIMEOUT {
                        return Err(AgentError::Validation(format!(
                            "another agent (run {}) holds the state lock since {}; \
                             refusing to run concurrently",
                            held.run_id, held.acquired_at
                        )));
                    }
                    warn!(
                        held_by = %held.run_id,
                        since = %held.acquired_at,
                        "replacing stale state lock"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("unreadable state lock, replacing it: {e}"),
            }
        }
        let lock = RunLock {
            run_id: self.run_id.clone(),
            acquired_at: Utc::now(),
        };
        self.bucket
            .put_file(
                constants::STATE_LOCK_KEY,
                serde_yaml::to_string(&lock)?.as_bytes(),
            )
            .await
    }

    pub async fn release_run_lock(&self) -> AgentResult<()> {
        match self.bucket.delete_file(constants::STATE_LOCK_KEY).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

/// Unique per store instance, so the lock distinguishes agents even inside
/// one process.
fn new_run_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let seed = format!(
        "{}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed),
        Utc::now().to_rfc3339()
    );
    format!("{:x}", md5::compute(seed.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemoryBucket {
        files: StdMutex<BTreeMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl Bucket for MemoryBucket {
        async fn put_file(&self, key: &str, content: &[u8]) -> AgentResult<()> {
            self.files
                .lock()
                .unwrap()
                .insert(key.into(), content.to_vec());
            Ok(())
        }
        async fn get_file(&self, key: &str) -> AgentResult<Option<Vec<u8>>> {
            Ok(self.files.lock().unwrap().get(key).cloned())
        }
        async fn delete_file(&self, key: &str) -> AgentResult<()> {
            self.files.lock().unwrap().remove(key);
            Ok(())
        }
        async fn list_folder_files(&self, prefix: &str) -> AgentResult<Vec<String>> {
            Ok(self
                .files
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }
        async fn check_folder_exists(&self, prefix: &str) -> AgentResult<bool> {
            Ok(!self.list_folder_files(prefix).await?.is_empty())
        }
        async fn bucket_exists(&self) -> AgentResult<bool> {
            Ok(true)
        }
        async fn delete(&self) -> AgentResult<()> {
            self.files.lock().unwrap().clear();
            Ok(())
        }
    }

    fn config_with_step() -> Config {
        serde_yaml::from_str(
            r#"
prefix: t1
steps:
  - name: net
    type: terraform
    workspace: dev
    modules:
      - { name: vpc, source: aws/vpc }
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn load_save_load_round_trips() {
        let bucket = Arc::new(MemoryBucket::default());
        let store = StateStore::load(bucket.clone()).await.unwrap();
        store.reconcile(&config_with_step()).await.unwrap();
        store
            .update(|state| {
                state.steps[0].modules[0].applied_version =
                    Some(semver::Version::new(1, 2, 0));
            })
            .await
            .unwrap();

        let reloaded = StateStore::load(bucket).await.unwrap();
        let state = reloaded.snapshot().await;
        assert_eq!(
            state.steps[0].modules[0].applied_version,
            Some(semver::Version::new(1, 2, 0))
        );
    }

    #[tokio::test]
    async fn every_mutation_is_flushed() {
        let bucket = Arc::new(MemoryBucket::default());
        let store = StateStore::load(bucket.clone()).await.unwrap();
        store.reconcile(&config_with_step()).await.unwrap();

        let persisted = bucket
            .get_file(constants::STATE_KEY)
            .await
            .unwrap()
            .expect("state flushed on reconcile");
        let state: State = serde_yaml::from_slice(&persisted).unwrap();
        assert_eq!(state.steps.len(), 1);
    }

    #[tokio::test]
    async fn foreign_fresh_lock_is_fatal() {
        let bucket = Arc::new(MemoryBucket::default());
        let first = StateStore::load(bucket.clone()).await.unwrap();
        first.acquire_run_lock().await.unwrap();

        let second = StateStore::load(bucket.clone()).await.unwrap();
        let err = second.acquire_run_lock().await.unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));

        first.release_run_lock().await.unwrap();
        second.acquire_run_lock().await.unwrap();
    }
}
