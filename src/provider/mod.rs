//! # Cloud Backend Abstraction
//!
//! Capability traits each backend implements: durable blob storage
//! ([`Bucket`]), small parameter/secret values ([`ParamStore`]), the
//! containerized job per step ([`Builder`]), the two-stage plan → approve →
//! apply workflow around it ([`Pipeline`]) and lifecycle notifications
//! ([`Notifier`]). A [`CloudProvider`] factory hands out the bundle; callers
//! hold only the interfaces.

pub mod aws;
pub mod local;
pub mod retry;

use crate::constants;
use crate::errors::{AgentError, AgentResult};
use crate::model::{MessageType, VpcConfig};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Which cloud the agent is talking to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Local,
    Aws,
    Gcp,
    Azure,
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderType::Local => "local",
            ProviderType::Aws => "aws",
            ProviderType::Gcp => "gcp",
            ProviderType::Azure => "azure",
        };
        f.write_str(name)
    }
}

impl FromStr for ProviderType {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(ProviderType::Local),
            "aws" => Ok(ProviderType::Aws),
            "gcp" | "google" => Ok(ProviderType::Gcp),
            "azure" => Ok(ProviderType::Azure),
            other => Err(AgentError::Validation(format!(
                "unknown provider '{other}', expected one of local, aws, gcp, azure"
            ))),
        }
    }
}

/// Decide which backend we are running inside of, from the provider-specific
/// environment sentinels. Absent sentinels mean a workstation run.
pub fn detect_provider_type() -> ProviderType {
    if std::env::var(constants::AWS_JOB_SENTINEL).is_ok() {
        ProviderType::Aws
    } else if std::env::var(constants::GCP_JOB_SENTINEL).is_ok() {
        ProviderType::Gcp
    } else if std::env::var(constants::AZURE_JOB_SENTINEL).is_ok() {
        ProviderType::Azure
    } else {
        ProviderType::Local
    }
}

/// Everything the builder needs to create or update one step's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Cloud resource name, `<prefix>-<step>-<workspace>`.
    pub name: String,

    /// Agent image the job runs.
    pub image: String,

    /// Bucket key prefix holding the step's artifact set.
    pub files_prefix: String,

    /// Extra environment passed to the job container.
    pub env: Vec<(String, String)>,

    /// Optional VPC attachment for jobs that must reach private endpoints.
    pub vpc: Option<VpcConfig>,

    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Identifying facts about an existing build project.
#[derive(Debug, Clone)]
pub struct ProjectInfo {
    pub name: String,
    pub image: String,
}

/// Counts extracted from the remote job's plan output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub added: u32,
    pub changed: u32,
    pub destroyed: u32,
    pub imported: u32,
}

impl PlanSummary {
    pub fn has_changes(&self) -> bool {
        self.added > 0 || self.changed > 0 || self.destroyed > 0 || self.imported > 0
    }

    /// Scan job log text for the Terraform plan line. Returns `None` when
    /// no plan line (or "No changes" marker) appears in the text.
    pub fn parse_from_logs(logs: &str) -> Option<PlanSummary> {
        let plan_line = Regex::new(
            r"Plan: (?:(\d+) to import, )?(\d+) to add, (\d+) to change, (\d+) to destroy",
        )
        .expect("plan line pattern is valid");

        if let Some(caps) = plan_line.captures(logs) {
            let count = |i: usize| {
                caps.get(i)
                    .map(|m| m.as_str().parse::<u32>().unwrap_or(0))
                    .unwrap_or(0)
            };
            return Some(PlanSummary {
                imported: count(1),
                added: count(2),
                changed: count(3),
                destroyed: count(4),
            });
        }

        if logs.contains("No changes.") {
            return Some(PlanSummary::default());
        }

        None
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.imported > 0 {
            write!(
                f,
                "{} to import, {} to add, {} to change, {} to destroy",
                self.imported, self.added, self.changed, self.destroyed
            )
        } else {
            write!(
                f,
                "{} to add, {} to change, {} to destroy",
                self.added, self.changed, self.destroyed
            )
        }
    }
}

/// What the pipeline learned when the plan stage finished.
#[derive(Debug, Clone)]
pub struct PlanReview {
    pub summary: PlanSummary,
    /// Deep link to the cloud console page where a human can approve.
    pub console_link: Option<String>,
}

/// Durable byte blobs addressed by key.
#[async_trait]
pub trait Bucket: Send + Sync {
    async fn put_file(&self, key: &str, content: &[u8]) -> AgentResult<()>;

    /// `Ok(None)` when the key does not exist.
    async fn get_file(&self, key: &str) -> AgentResult<Option<Vec<u8>>>;

    async fn delete_file(&self, key: &str) -> AgentResult<()>;

    /// Keys under a prefix, sorted.
    async fn list_folder_files(&self, prefix: &str) -> AgentResult<Vec<String>>;

    async fn list_folder_files_with_exclude(
        &self,
        prefix: &str,
        exclude: &[String],
    ) -> AgentResult<Vec<String>> {
        let files = self.list_folder_files(prefix).await?;
        Ok(files
            .into_iter()
            .filter(|f| !exclude.iter().any(|e| f.ends_with(e.as_str())))
            .collect())
    }

    async fn delete_folder(&self, prefix: &str) -> AgentResult<()> {
        for key in self.list_folder_files(prefix).await? {
            self.delete_file(&key).await?;
        }
        Ok(())
    }

    async fn check_folder_exists(&self, prefix: &str) -> AgentResult<bool>;

    async fn bucket_exists(&self) -> AgentResult<bool>;

    /// Tear the whole bucket down, contents included.
    async fn delete(&self) -> AgentResult<()>;
}

/// Small parameter and secret values.
#[async_trait]
pub trait ParamStore: Send + Sync {
    /// Surfaces `NotFound` on missing parameters.
    async fn get_parameter(&self, name: &str) -> AgentResult<String>;

    async fn parameter_exists(&self, name: &str) -> AgentResult<bool>;

    async fn put_parameter(&self, name: &str, value: &str) -> AgentResult<()>;

    /// Parameter names under a path prefix, sorted.
    async fn list_parameters(&self, prefix: &str) -> AgentResult<Vec<String>>;

    async fn delete_parameter(&self, name: &str) -> AgentResult<()>;

    async fn put_secret(&self, name: &str, value: &str) -> AgentResult<()>;

    async fn delete_secret(&self, name: &str) -> AgentResult<()>;

    /// Switch subsequent writes to a customer-managed encryption key.
    async fn add_encryption_key_id(&self, key_id: &str) -> AgentResult<()>;
}

/// Creates and maintains the containerized job that runs a step.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn create_project(&self, job: &JobSpec) -> AgentResult<()>;

    async fn update_project(&self, job: &JobSpec) -> AgentResult<()>;

    async fn delete_project(&self, name: &str) -> AgentResult<()>;

    async fn get_project(&self, name: &str) -> AgentResult<Option<ProjectInfo>>;

    /// The agent's own job, so the cloud can re-run the update loop.
    async fn create_agent_project(&self, name: &str, image: &str) -> AgentResult<()>;

    async fn update_agent_project(&self, name: &str, image: &str) -> AgentResult<()>;
}

/// The plan → approve → apply workflow around one step's job.
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Create the pipeline; backends that auto-start the first execution
    /// return its id.
    async fn create_pipeline(&self, name: &str, job: &JobSpec) -> AgentResult<Option<String>>;

    async fn update_pipeline(&self, name: &str, job: &JobSpec) -> AgentResult<()>;

    async fn start_execution(&self, name: &str) -> AgentResult<Option<String>>;

    async fn start_destroy_execution(&self, name: &str) -> AgentResult<Option<String>>;

    /// Kick off the agent's own update job.
    async fn start_agent_execution(&self, name: &str) -> AgentResult<()>;

    /// Poll until the plan stage has finished and its summary is readable
    /// from the job logs.
    async fn wait_for_plan(
        &self,
        name: &str,
        execution: Option<&str>,
        destroy: bool,
    ) -> AgentResult<PlanReview>;

    /// Release the approval gate programmatically.
    async fn approve(&self, name: &str, execution: Option<&str>) -> AgentResult<()>;

    /// Poll until a human released the gate. `Ok(false)` on timeout.
    async fn wait_for_manual_approval(
        &self,
        name: &str,
        execution: Option<&str>,
        timeout: Duration,
    ) -> AgentResult<bool>;

    /// Poll until the apply stage succeeded; `Execution` error on failure.
    async fn wait_for_apply(&self, name: &str, execution: Option<&str>) -> AgentResult<()>;

    async fn delete_pipeline(&self, name: &str) -> AgentResult<()>;

    /// Pipelines that re-run the agent itself (`update` on a schedule).
    async fn create_agent_pipelines(&self, update_job: &JobSpec) -> AgentResult<()>;
}

/// Lifecycle event fan-out target.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    fn handles(&self, message_type: MessageType) -> bool;

    async fn message(&self, message_type: MessageType, message: &str) -> AgentResult<()>;

    async fn manual_approval(
        &self,
        step_name: &str,
        summary: &PlanSummary,
        link: Option<&str>,
    ) -> AgentResult<()>;

    async fn step_state(
        &self,
        status: StepStatus,
        step_name: &str,
        workspace: &str,
        detail: Option<&str>,
    ) -> AgentResult<()>;
}

/// Step lifecycle states reported through [`Notifier::step_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Planning,
    Applying,
    Applied,
    Skipped,
    Failed,
    Destroying,
    Destroyed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepStatus::Planning => "planning",
            StepStatus::Applying => "applying",
            StepStatus::Applied => "applied",
            StepStatus::Skipped => "skipped",
            StepStatus::Failed => "failed",
            StepStatus::Destroying => "destroying",
            StepStatus::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// How the generated `backend.conf` points Terraform at remote state.
#[derive(Debug, Clone)]
pub enum BackendKind {
    S3 {
        bucket: String,
        region: String,
        encrypt: bool,
    },
    Local {
        root: PathBuf,
    },
}

impl BackendKind {
    /// The backend-vars map rendered into a step's `backend.conf`.
    pub fn config_vars(&self, state_key: &str) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        match self {
            BackendKind::S3 {
                bucket,
                region,
                encrypt,
            } => {
                vars.insert("bucket".to_string(), bucket.clone());
                vars.insert("key".to_string(), format!("{state_key}/terraform.tfstate"));
                vars.insert("region".to_string(), region.clone());
                vars.insert("encrypt".to_string(), encrypt.to_string());
                vars.insert("use_lockfile".to_string(), "true".to_string());
            }
            BackendKind::Local { root } => {
                vars.insert(
                    "path".to_string(),
                    root.join(state_key)
                        .join("terraform.tfstate")
                        .to_string_lossy()
                        .into_owned(),
                );
            }
        }
        vars
    }
}

/// The bundle of capabilities a provider hands to the core.
#[derive(Clone)]
pub struct Resources {
    pub bucket: Arc<dyn Bucket>,
    pub pipeline: Arc<dyn Pipeline>,
    pub builder: Arc<dyn Builder>,
    pub params: Arc<dyn ParamStore>,
    pub provider_type: ProviderType,
    pub bucket_name: String,
    pub region: String,
    /// Resource-name prefix every derived cloud object carries.
    pub cloud_prefix: String,
    pub backend: BackendKind,
}

impl Resources {
    /// Parameter-store path prefix for everything the agent owns.
    pub fn param_root(&self) -> String {
        format!("/{}", self.cloud_prefix)
    }

    /// The backend-vars map rendered into a step's `backend.conf`.
    pub fn backend_config_vars(&self, state_key: &str) -> BTreeMap<String, String> {
        self.backend.config_vars(state_key)
    }
}

/// A provider owns the lifecycle of its cloud resources and produces the
/// capability bundle.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Idempotently provision backend resources (bucket, jobs scaffolding)
    /// and return the bundle.
    async fn setup_resources(&self) -> AgentResult<Resources>;

    /// Return the bundle for already-provisioned resources.
    async fn get_resources(&self) -> AgentResult<Resources>;

    /// Tear down scheduler entries, build projects and logging resources;
    /// optionally the state bucket and the agent's service account.
    async fn delete_resources(
        &self,
        delete_bucket: bool,
        delete_service_account: bool,
    ) -> AgentResult<()>;

    /// An encryption-key module applied; use its key for subsequent
    /// parameter writes.
    async fn add_encryption(
        &self,
        module_name: &str,
        outputs: &std::collections::HashMap<String, serde_json::Value>,
    ) -> AgentResult<()>;

    /// Idempotently reconcile the periodic update trigger; `None` removes
    /// any existing schedule.
    async fn setup_schedule(&self, cron: Option<&str>) -> AgentResult<()>;

    fn is_running_locally(&self) -> bool;

    fn provider_type(&self) -> ProviderType;
}

/// Pick the key identifier out of an encryption module's outputs.
pub(crate) fn encryption_key_from_outputs(
    outputs: &std::collections::HashMap<String, serde_json::Value>,
) -> Option<String> {
    for candidate in ["key_arn", "kms_key_arn", "key_id", "kms_key_id"] {
        if let Some(serde_json::Value::String(value)) = outputs.get(candidate) {
            return Some(value.clone());
        }
    }
    None
}

/// Build the provider for the requested backend.
pub fn new_cloud_provider(
    provider_type: ProviderType,
    prefix: &str,
    region: Option<&str>,
) -> AgentResult<Arc<dyn CloudProvider>> {
    match provider_type {
        ProviderType::Local => Ok(Arc::new(local::LocalProvider::new(prefix)?)),
        ProviderType::Aws => Ok(Arc::new(aws::AwsProvider::new(
            prefix,
            region.map(str::to_string),
        ))),
        ProviderType::Gcp | ProviderType::Azure => Err(AgentError::Validation(format!(
            "this build has no {provider_type} backend; run with --provider aws or --provider local"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_line_parses() {
        let logs = "\nTerraform will perform the following actions...\n\
                    Plan: 5 to add, 1 to change, 2 to destroy.\n";
        let summary = PlanSummary::parse_from_logs(logs).unwrap();
        assert_eq!(
            summary,
            PlanSummary {
                added: 5,
                changed: 1,
                destroyed: 2,
                imported: 0
            }
        );
        assert!(summary.has_changes());
    }

    #[test]
    fn plan_line_with_imports_parses() {
        let logs = "Plan: 2 to import, 1 to add, 0 to change, 0 to destroy.";
        let summary = PlanSummary::parse_from_logs(logs).unwrap();
        assert_eq!(summary.imported, 2);
        assert_eq!(summary.added, 1);
    }

    #[test]
    fn no_changes_marker_is_an_empty_summary() {
        let logs = "No changes. Your infrastructure matches the configuration.";
        let summary = PlanSummary::parse_from_logs(logs).unwrap();
        assert!(!summary.has_changes());
    }

    #[test]
    fn missing_plan_line_yields_none() {
        assert!(PlanSummary::parse_from_logs("terraform init output only").is_none());
    }

    #[test]
    fn s3_backend_vars_name_the_state_object() {
        let backend = BackendKind::S3 {
            bucket: "dev-infra-agent-eu-west-1".into(),
            region: "eu-west-1".into(),
            encrypt: true,
        };
        let vars = backend.config_vars("steps/dev-net-dev");
        assert_eq!(
            vars.get("key").unwrap(),
            "steps/dev-net-dev/terraform.tfstate"
        );
        assert_eq!(vars.get("encrypt").unwrap(), "true");
        assert_eq!(vars.get("use_lockfile").unwrap(), "true");
    }

    #[test]
    fn provider_type_parses_and_displays() {
        assert_eq!("aws".parse::<ProviderType>().unwrap(), ProviderType::Aws);
        assert_eq!("LOCAL".parse::<ProviderType>().unwrap(), ProviderType::Local);
        assert!("foo".parse::<ProviderType>().is_err());
        assert_eq!(ProviderType::Gcp.to_string(), "gcp");
    }
}
