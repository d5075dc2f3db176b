//! Shared in-memory test doubles: a scripted module source, memory-backed
//! bucket and parameter store, a recording pipeline, and a provider bundle
//! tying them together.

use async_trait::async_trait;
use infra_agent::errors::{AgentError, AgentResult};
use infra_agent::model::{Config, MessageType};
use infra_agent::notify::Notifications;
use infra_agent::provider::{
    BackendKind, Bucket, Builder, CloudProvider, JobSpec, Notifier, ParamStore, Pipeline,
    PlanReview, PlanSummary, ProjectInfo, ProviderType, Resources, StepStatus,
};
use infra_agent::sources::{ModuleSource, SourceEntry, SourceSet};
use infra_agent::state::StateStore;
use semver::Version;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A module repository with fixed tags and directory paths.
pub struct FakeSource {
    url: String,
    tags: Vec<Version>,
    paths: HashSet<String>,
    files: HashMap<String, Vec<u8>>,
}

impl FakeSource {
    pub fn new(url: &str, tags: &[&str], paths: &[&str]) -> Self {
        let mut sorted: Vec<Version> = tags.iter().map(|t| Version::parse(t).unwrap()).collect();
        sorted.sort();
        FakeSource {
            url: url.to_string(),
            tags: sorted,
            paths: paths.iter().map(|p| (*p).to_string()).collect(),
            files: HashMap::new(),
        }
    }

}

#[async_trait]
impl ModuleSource for FakeSource {
    fn url(&self) -> &str {
        &self.url
    }

    async fn latest_release(&self) -> AgentResult<Version> {
        self.tags.last().cloned().ok_or_else(|| {
            AgentError::Validation(format!("no valid semver release tag exists in {}", self.url))
        })
    }

    async fn release(&self, tag: &str) -> AgentResult<Version> {
        let wanted = Version::parse(tag.trim_start_matches('v'))
            .map_err(|e| AgentError::Validation(e.to_string()))?;
        self.tags
            .iter()
            .find(|v| **v == wanted)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(format!("release {wanted} in {}", self.url)))
    }

    async fn releases(
        &self,
        oldest: Option<&Version>,
        newest: &Version,
    ) -> AgentResult<Vec<Version>> {
        let Some(oldest) = oldest else {
            return Ok(vec![newest.clone()]);
        };
        Ok(self
            .tags
            .iter()
            .filter(|v| *v > oldest && *v <= newest)
            .cloned()
            .collect())
    }

    async fn file(&self, path: &str, release: &Version) -> AgentResult<Vec<u8>> {
        self.files.get(path).cloned().ok_or_else(|| {
            AgentError::NotFound(format!("file '{path}' at release {release} in {}", self.url))
        })
    }

    async fn file_exists(&self, path: &str, _release: &Version) -> AgentResult<bool> {
        Ok(self.files.contains_key(path))
    }

    async fn path_exists(&self, path: &str, _release: &Version) -> AgentResult<bool> {
        Ok(self.paths.contains(path))
    }
}

#[derive(Default)]
pub struct MemoryBucket {
    pub files: Mutex<BTreeMap<String, Vec<u8>>>,
    pub deleted: Mutex<bool>,
}

#[async_trait]
impl Bucket for MemoryBucket {
    async fn put_file(&self, key: &str, content: &[u8]) -> AgentResult<()> {
        self.files
            .lock()
            .unwrap()
            .insert(key.to_string(), content.to_vec());
        Ok(())
    }

    async fn get_file(&self, key: &str) -> AgentResult<Option<Vec<u8>>> {
        Ok(self.files.lock().unwrap().get(key).cloned())
    }

    async fn delete_file(&self, key: &str) -> AgentResult<()> {
        self.files
            .lock()
            .unwrap()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| AgentError::NotFound(format!("bucket object {key}")))
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
        Ok(!*self.deleted.lock().unwrap())
    }

    async fn delete(&self) -> AgentResult<()> {
        self.files.lock().unwrap().clear();
        *self.deleted.lock().unwrap() = true;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryParams {
    pub values: Mutex<BTreeMap<String, String>>,
    pub encryption_key: Mutex<Option<String>>,
}

#[async_trait]
impl ParamStore for MemoryParams {
    async fn get_parameter(&self, name: &str) -> AgentResult<String> {
        self.values
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(format!("parameter {name}")))
    }

    async fn parameter_exists(&self, name: &str) -> AgentResult<bool> {
        Ok(self.values.lock().unwrap().contains_key(name))
    }

    async fn put_parameter(&self, name: &str, value: &str) -> AgentResult<()> {
        self.values
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn list_parameters(&self, prefix: &str) -> AgentResult<Vec<String>> {
        Ok(self
            .values
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete_parameter(&self, name: &str) -> AgentResult<()> {
        self.values
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| AgentError::NotFound(format!("parameter {name}")))
    }

    async fn put_secret(&self, name: &str, value: &str) -> AgentResult<()> {
        self.put_parameter(name, value).await
    }

    async fn delete_secret(&self, name: &str) -> AgentResult<()> {
        self.delete_parameter(name).await
    }

    async fn add_encryption_key_id(&self, key_id: &str) -> AgentResult<()> {
        *self.encryption_key.lock().unwrap() = Some(key_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingBuilder {
    pub projects: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl Builder for RecordingBuilder {
    async fn create_project(&self, job: &JobSpec) -> AgentResult<()> {
        let mut projects = self.projects.lock().unwrap();
        if projects.contains_key(&job.name) {
            return Err(AgentError::AlreadyExists(format!("job {}", job.name)));
        }
        projects.insert(job.name.clone(), job.image.clone());
        Ok(())
    }

    async fn update_project(&self, job: &JobSpec) -> AgentResult<()> {
        self.projects
            .lock()
            .unwrap()
            .insert(job.name.clone(), job.image.clone());
        Ok(())
    }

    async fn delete_project(&self, name: &str) -> AgentResult<()> {
        self.projects
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| AgentError::NotFound(format!("job {name}")))
    }

    async fn get_project(&self, name: &str) -> AgentResult<Option<ProjectInfo>> {
        Ok(self
            .projects
            .lock()
            .unwrap()
            .get(name)
            .map(|image| ProjectInfo {
                name: name.to_string(),
                image: image.clone(),
            }))
    }

    async fn create_agent_project(&self, name: &str, image: &str) -> AgentResult<()> {
        self.projects
            .lock()
            .unwrap()
            .insert(name.to_string(), image.to_string());
        Ok(())
    }

    async fn update_agent_project(&self, name: &str, image: &str) -> AgentResult<()> {
        self.create_agent_project(name, image).await
    }
}

/// Records every pipeline interaction and serves scripted plan summaries.
#[derive(Default)]
pub struct ScriptedPipeline {
    /// Queued summaries per job name; empty queues fall back to
    /// `1 to add, 0 to change, 0 to destroy`.
    pub summaries: Mutex<HashMap<String, VecDeque<PlanSummary>>>,
    /// `(job, kind)` in invocation order; kind is "start", "destroy",
    /// "approve" or "apply".
    pub events: Mutex<Vec<(String, String)>>,
    /// What `wait_for_manual_approval` answers.
    pub manual_approval_answer: Mutex<bool>,
    /// When a bucket is attached, `wait_for_plan` snapshots the job's
    /// `main.tf` the way a real plan would consume it.
    pub bucket: Mutex<Option<Arc<MemoryBucket>>>,
    /// `(job, main.tf text)` per plan, in order.
    pub plan_snapshots: Mutex<Vec<(String, String)>>,
}

impl ScriptedPipeline {
    pub fn queue_summary(&self, job: &str, summary: PlanSummary) {
        self.summaries
            .lock()
            .unwrap()
            .entry(job.to_string())
            .or_default()
            .push_back(summary);
    }

    fn snapshot_plan_input(&self, job: &str) {
        let Some(bucket) = self.bucket.lock().unwrap().clone() else {
            return;
        };
        let key = format!("steps/{job}/main.tf");
        if let Some(bytes) = bucket.files.lock().unwrap().get(&key) {
            self.plan_snapshots
                .lock()
                .unwrap()
                .push((job.to_string(), String::from_utf8_lossy(bytes).into_owned()));
        };
    }

    pub fn events_of_kind(&self, kind: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, k)| k == kind)
            .map(|(job, _)| job.clone())
            .collect()
    }

    fn record(&self, job: &str, kind: &str) {
        self.events
            .lock()
            .unwrap()
            .push((job.to_string(), kind.to_string()));
    }
}

#[async_trait]
impl Pipeline for ScriptedPipeline {
    async fn create_pipeline(&self, name: &str, _job: &JobSpec) -> AgentResult<Option<String>> {
        self.record(name, "create");
        Ok(None)
    }

    async fn update_pipeline(&self, _name: &str, _job: &JobSpec) -> AgentResult<()> {
        Ok(())
    }

    async fn start_execution(&self, name: &str) -> AgentResult<Option<String>> {
        self.record(name, "start");
        Ok(Some(format!("exec-{}", self.events.lock().unwrap().len())))
    }

    async fn start_destroy_execution(&self, name: &str) -> AgentResult<Option<String>> {
        self.record(name, "destroy");
        Ok(Some(format!("exec-{}", self.events.lock().unwrap().len())))
    }

    async fn start_agent_execution(&self, name: &str) -> AgentResult<()> {
        self.record(name, "agent");
        Ok(())
    }

    async fn wait_for_plan(
        &self,
        name: &str,
        _execution: Option<&str>,
        _destroy: bool,
    ) -> AgentResult<PlanReview> {
        self.snapshot_plan_input(name);
        let summary = self
            .summaries
            .lock()
            .unwrap()
            .get_mut(name)
            .and_then(|q| q.pop_front())
            .unwrap_or(PlanSummary {
                added: 1,
                changed: 0,
                destroyed: 0,
                imported: 0,
            });
        Ok(PlanReview {
            summary,
            console_link: Some(format!("https://console.example/{name}")),
        })
    }

    async fn approve(&self, name: &str, _execution: Option<&str>) -> AgentResult<()> {
        self.record(name, "approve");
        Ok(())
    }

    async fn wait_for_manual_approval(
        &self,
        name: &str,
        _execution: Option<&str>,
        _timeout: Duration,
    ) -> AgentResult<bool> {
        self.record(name, "manual-approval");
        Ok(*self.manual_approval_answer.lock().unwrap())
    }

    async fn wait_for_apply(&self, name: &str, _execution: Option<&str>) -> AgentResult<()> {
        self.record(name, "apply");
        Ok(())
    }

    async fn delete_pipeline(&self, name: &str) -> AgentResult<()> {
        self.record(name, "delete");
        Ok(())
    }

    async fn create_agent_pipelines(&self, _update_job: &JobSpec) -> AgentResult<()> {
        Ok(())
    }
}

pub struct FakeProvider {
    pub resources: Resources,
    pub deleted: Mutex<Option<(bool, bool)>>,
    pub schedules: Mutex<Vec<Option<String>>>,
    pub encrypted_modules: Mutex<Vec<String>>,
}

#[async_trait]
impl CloudProvider for FakeProvider {
    async fn setup_resources(&self) -> AgentResult<Resources> {
        Ok(self.resources.clone())
    }

    async fn get_resources(&self) -> AgentResult<Resources> {
        Ok(self.resources.clone())
    }

    async fn delete_resources(
        &self,
        delete_bucket: bool,
        delete_service_account: bool,
    ) -> AgentResult<()> {
        *self.deleted.lock().unwrap() = Some((delete_bucket, delete_service_account));
        if delete_bucket {
            self.resources.bucket.delete().await?;
        }
        Ok(())
    }

    async fn add_encryption(
        &self,
        module_name: &str,
        _outputs: &HashMap<String, serde_json::Value>,
    ) -> AgentResult<()> {
        self.encrypted_modules
            .lock()
            .unwrap()
            .push(module_name.to_string());
        Ok(())
    }

    async fn setup_schedule(&self, cron: Option<&str>) -> AgentResult<()> {
        self.schedules
            .lock()
            .unwrap()
            .push(cron.map(str::to_string));
        Ok(())
    }

    fn is_running_locally(&self) -> bool {
        true
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Local
    }
}

/// A notifier sink that records everything it receives.
#[derive(Default)]
pub struct RecordingSink {
    pub messages: Mutex<Vec<(MessageType, String)>>,
    pub approvals: Mutex<Vec<(String, PlanSummary, Option<String>)>>,
    pub step_states: Mutex<Vec<(StepStatus, String)>>,
}

#[async_trait]
impl Notifier for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    fn handles(&self, _message_type: MessageType) -> bool {
        true
    }

    async fn message(&self, message_type: MessageType, message: &str) -> AgentResult<()> {
        self.messages
            .lock()
            .unwrap()
            .push((message_type, message.to_string()));
        Ok(())
    }

    async fn manual_approval(
        &self,
        step_name: &str,
        summary: &PlanSummary,
        link: Option<&str>,
    ) -> AgentResult<()> {
        self.approvals.lock().unwrap().push((
            step_name.to_string(),
            *summary,
            link.map(str::to_string),
        ));
        Ok(())
    }

    async fn step_state(
        &self,
        status: StepStatus,
        step_name: &str,
        _workspace: &str,
        _detail: Option<&str>,
    ) -> AgentResult<()> {
        self.step_states
            .lock()
            .unwrap()
            .push((status, step_name.to_string()));
        Ok(())
    }
}

/// Everything an executor test needs, wired onto memory backends.
pub struct Harness {
    pub bucket: Arc<MemoryBucket>,
    pub params: Arc<MemoryParams>,
    pub pipeline: Arc<ScriptedPipeline>,
    pub builder: Arc<RecordingBuilder>,
    pub provider: Arc<FakeProvider>,
    pub sink: Arc<RecordingSink>,
    pub state: Arc<StateStore>,
    pub executor: infra_agent::executor::Executor,
}

pub async fn harness(config_yaml: &str, source: FakeSource) -> Harness {
    let config: Config = serde_yaml::from_str(config_yaml).expect("test config parses");

    let bucket = Arc::new(MemoryBucket::default());
    let params = Arc::new(MemoryParams::default());
    let pipeline = Arc::new(ScriptedPipeline::default());
    *pipeline.bucket.lock().unwrap() = Some(bucket.clone());
    let builder = Arc::new(RecordingBuilder::default());

    let cloud_prefix = format!("infra-agent-{}", config.prefix);
    let resources = Resources {
        bucket: bucket.clone(),
        pipeline: pipeline.clone(),
        builder: builder.clone(),
        params: params.clone(),
        provider_type: ProviderType::Local,
        bucket_name: "memory".to_string(),
        region: "local".to_string(),
        cloud_prefix,
        backend: BackendKind::Local {
            root: PathBuf::from("/tmp/tfstate"),
        },
    };
    let provider = Arc::new(FakeProvider {
        resources: resources.clone(),
        deleted: Mutex::new(None),
        schedules: Mutex::new(Vec::new()),
        encrypted_modules: Mutex::new(Vec::new()),
    });

    let source_url = source.url().to_string();
    let sources = SourceSet::new(
        vec![SourceEntry {
            url: source_url,
            client: Arc::new(source),
            forced_version: None,
        }],
        config.version_or_stable(),
        None,
    )
    .expect("source set");

    let state = Arc::new(StateStore::load(bucket.clone()).await.expect("state"));
    let sink = Arc::new(RecordingSink::default());
    let sinks: Vec<Arc<dyn Notifier>> = vec![sink.clone()];
    let notifier = Notifications::with_sinks(sinks);

    let executor = infra_agent::executor::Executor::new(
        config,
        provider.clone(),
        resources,
        sources,
        state.clone(),
        notifier,
        tokio_util::sync::CancellationToken::new(),
    );

    Harness {
        bucket,
        params,
        pipeline,
        builder,
        provider,
        sink,
        state,
        executor,
    }
}
