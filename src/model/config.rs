//! # Configuration Document
//!
//! The declarative root document the agent reconciles. Loaded from a local
//! file or from `config.yaml` at the bucket root once bootstrapped, merged
//! with an optional base profile, validated, then read-only for the rest of
//! the run. Unknown fields are ignored for forward compatibility.

use super::version::VersionSpec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Short identifier used to name all derived cloud resources.
    #[serde(default)]
    pub prefix: String,

    /// Ordered list of module repositories.
    #[serde(default)]
    pub sources: Vec<Source>,

    /// Global module-version default; `stable` means "latest release tag".
    #[serde(default)]
    pub version: Option<VersionSpec>,

    /// Which agent image the remote jobs run.
    #[serde(default, rename = "agent_version")]
    pub agent_version: Option<String>,

    /// Optional named profile shipped in a source repo, merged under this
    /// config before validation.
    #[serde(default)]
    pub base_config: Option<BaseConfig>,

    #[serde(default)]
    pub schedule: Option<Schedule>,

    #[serde(default)]
    pub notifications: Vec<NotificationConfig>,

    /// Fan independent steps out to concurrent workers.
    #[serde(default)]
    pub allow_parallel: bool,

    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Config {
    /// Desired version default for modules that pin nothing anywhere.
    pub fn version_or_stable(&self) -> VersionSpec {
        self.version.clone().unwrap_or_default()
    }

    pub fn find_step(&self, name: &str, workspace: &str) -> Option<&Step> {
        self.steps
            .iter()
            .find(|s| s.name == name && s.workspace == workspace)
    }

    /// The step owning a module with the given name, if any. Used to turn
    /// `.toutput.<module>.*` references into dependency edges.
    pub fn step_of_module(&self, module_name: &str) -> Option<&Step> {
        self.steps
            .iter()
            .find(|s| s.modules.iter().any(|m| m.name == module_name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub token: Option<String>,

    /// PEM bundle for repositories behind a private CA.
    #[serde(default)]
    pub ca_certificate: Option<String>,

    /// Forced version: modules served by this repo never resolve above it.
    #[serde(default)]
    pub version: Option<VersionSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseConfig {
    pub profile: String,

    #[serde(default)]
    pub version: Option<VersionSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    /// Cron expression for periodic re-triggering of the update loop.
    /// Emptying the field removes any existing schedule.
    #[serde(default)]
    pub update_cron: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: String,

    #[serde(rename = "type")]
    pub step_type: StepType,

    #[serde(default)]
    pub workspace: String,

    #[serde(default)]
    pub approve: ApprovePolicy,

    /// Marks the step for destruction on the next run; elided afterwards.
    #[serde(default)]
    pub remove: bool,

    #[serde(default)]
    pub version: Option<VersionSpec>,

    #[serde(default)]
    pub vpc: Option<VpcConfig>,

    #[serde(default)]
    pub kubernetes_cluster_name: Option<String>,

    #[serde(default)]
    pub argocd_namespace: Option<String>,

    /// Name of a step this step must run before (extra ordering edge).
    #[serde(default)]
    pub before: Option<String>,

    #[serde(default)]
    pub modules: Vec<Module>,
}

impl Step {
    /// `(name, workspace)` is the unique key of a step.
    pub fn key(&self) -> (&str, &str) {
        (&self.name, &self.workspace)
    }

    /// Folder name of the step's artifact set: `<prefix>-<name>-<workspace>`.
    pub fn folder(&self, prefix: &str) -> String {
        format!("{}-{}-{}", prefix, self.name, self.workspace)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepType {
    Terraform,
    ArgocdApps,
    TerraformCustom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovePolicy {
    /// Auto-approve, but refuse outright when the plan destroys anything.
    Never,
    /// Auto-approve minor and patch bumps without destroys.
    Minor,
    /// Auto-approve everything except major-version bumps.
    Major,
    /// Always wait for a human.
    Always,
}

impl Default for ApprovePolicy {
    fn default() -> Self {
        ApprovePolicy::Minor
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpcConfig {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub subnet_ids: Vec<String>,

    #[serde(default)]
    pub security_group_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    pub name: String,

    /// Path of the module within a source repository.
    #[serde(default)]
    pub source: String,

    #[serde(default)]
    pub version: Option<VersionSpec>,

    #[serde(default)]
    pub remove: bool,

    /// Free-form inputs rendered into the step's artifact files. Order is
    /// preserved so generated files are deterministic.
    #[serde(default)]
    pub inputs: serde_yaml::Mapping,

    #[serde(default)]
    pub metadata: Option<serde_yaml::Mapping>,

    /// Optional basic auth for private client modules fetched over HTTP.
    #[serde(default)]
    pub http_username: Option<String>,

    #[serde(default)]
    pub http_password: Option<String>,
}

impl Module {
    /// Custom modules address a registry or another scheme directly instead
    /// of a path inside a library repository.
    pub fn has_custom_source(&self) -> bool {
        self.source.starts_with("http://")
            || self.source.starts_with("https://")
            || self.source.contains("::")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationConfig {
    pub name: String,

    #[serde(flatten)]
    pub target: NotificationTarget,

    /// Which message types this sink receives; empty means all.
    #[serde(default)]
    pub message_types: Vec<MessageType>,
}

/// Externally tagged sink configuration: exactly one of `slack`, `teams` or
/// `api` appears under the notification entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationTarget {
    Slack(SlackTarget),
    Teams(TeamsTarget),
    Api(ApiTarget),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlackTarget {
    pub webhook_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamsTarget {
    pub webhook_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTarget {
    pub url: String,

    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Manual approval is waiting on a human.
    Approvals,
    /// Step lifecycle progress.
    Progress,
    /// Fatal errors.
    Failure,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_documented_example() {
        let yaml = r#"
prefix: dev
sources:
  - url: https://github.com/org/modules
    version: stable
agent_version: latest
schedule:
  updateCron: "0 3 * * *"
steps:
  - name: net
    type: terraform
    workspace: dev
    modules:
      - { name: vpc, source: aws/vpc }
  - name: infra
    type: terraform
    workspace: dev
    approve: minor
    modules:
      - { name: eks, source: aws/eks, inputs: { cluster_name: "{{ .config.prefix }}" } }
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.prefix, "dev");
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].version, Some(VersionSpec::Stable));
        assert_eq!(
            config.schedule.as_ref().unwrap().update_cron.as_deref(),
            Some("0 3 * * *")
        );
        assert_eq!(config.steps.len(), 2);
        assert_eq!(config.steps[0].step_type, StepType::Terraform);
        assert_eq!(config.steps[0].approve, ApprovePolicy::Minor);
        assert_eq!(config.steps[1].modules[0].name, "eks");
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let yaml = "prefix: x\nfutureKnob: true\nsteps: []\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.prefix, "x");
    }

    #[test]
    fn notification_targets_are_externally_tagged() {
        let yaml = r#"
name: ops
slack:
  webhookUrl: https://hooks.slack.com/services/T/B/X
messageTypes: [approvals, failure]
"#;
        let n: NotificationConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(n.target, NotificationTarget::Slack(_)));
        assert_eq!(
            n.message_types,
            vec![MessageType::Approvals, MessageType::Failure]
        );
    }

    #[test]
    fn step_folder_uses_prefix_name_workspace() {
        let step = Step {
            name: "net".into(),
            step_type: StepType::Terraform,
            workspace: "dev".into(),
            approve: ApprovePolicy::default(),
            remove: false,
            version: None,
            vpc: None,
            kubernetes_cluster_name: None,
            argocd_namespace: None,
            before: None,
            modules: vec![],
        };
        assert_eq!(step.folder("t1"), "t1-net-dev");
    }
}
