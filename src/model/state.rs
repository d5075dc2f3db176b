//! # State Document
//!
//! The persisted record of what is currently applied, stored as
//! `state.yaml` at the bucket root. The executor is its only writer; every
//! mutation is flushed back before the next step begins.

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};

use super::config::Config;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    #[serde(default)]
    pub base_config: BaseConfigState,

    #[serde(default)]
    pub steps: Vec<StateStep>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseConfigState {
    #[serde(default)]
    pub version: Option<Version>,

    #[serde(default)]
    pub applied_version: Option<Version>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateStep {
    pub name: String,

    #[serde(default)]
    pub workspace: String,

    /// Unset until the step's first successful apply.
    #[serde(default)]
    pub applied_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub modules: Vec<StateModule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateModule {
    pub name: String,

    /// Desired version recorded at validation time.
    #[serde(default)]
    pub version: Option<Version>,

    /// Greatest release at which the module completed apply.
    #[serde(default)]
    pub applied_version: Option<Version>,
}

impl State {
    pub fn find_step(&self, name: &str, workspace: &str) -> Option<&StateStep> {
        self.steps
            .iter()
            .find(|s| s.name == name && s.workspace == workspace)
    }

    pub fn find_step_mut(&mut self, name: &str, workspace: &str) -> Option<&mut StateStep> {
        self.steps
            .iter_mut()
            .find(|s| s.name == name && s.workspace == workspace)
    }

    /// Drop state entries absent from the config, insert placeholders for
    /// new config entries, and mirror the config's ordering, so that
    /// indexing by `(step, workspace)` and module name is total for
    /// everything in the config.
    pub fn reconcile(&mut self, config: &Config) {
        let mut steps = Vec::with_capacity(config.steps.len());
        for step in &config.steps {
            let mut entry = self
                .steps
                .iter()
                .find(|s| s.name == step.name && s.workspace == step.workspace)
                .cloned()
                .unwrap_or_else(|| StateStep {
                    name: step.name.clone(),
                    workspace: step.workspace.clone(),
                    applied_at: None,
                    modules: Vec::new(),
                });

            let mut modules = Vec::with_capacity(step.modules.len());
            for module in &step.modules {
                let existing = entry
                    .modules
                    .iter()
                    .find(|m| m.name == module.name)
                    .cloned()
                    .unwrap_or_else(|| StateModule {
                        name: module.name.clone(),
                        version: None,
                        applied_version: None,
                    });
                modules.push(existing);
            }
            entry.modules = modules;
            steps.push(entry);
        }
        self.steps = steps;
    }
}

impl StateStep {
    pub fn find_module(&self, name: &str) -> Option<&StateModule> {
        self.modules.iter().find(|m| m.name == name)
    }

    pub fn find_module_mut(&mut self, name: &str) -> Option<&mut StateModule> {
        self.modules.iter_mut().find(|m| m.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::{ApprovePolicy, Module, Step, StepType};

    fn step(name: &str, workspace: &str, modules: &[&str]) -> Step {
        Step {
            name: name.into(),
            step_type: StepType::Terraform,
            workspace: workspace.into(),
            approve: ApprovePolicy::default(),
            remove: false,
            version: None,
            vpc: None,
            kubernetes_cluster_name: None,
            argocd_namespace: None,
            before: None,
            modules: modules
                .iter()
                .map(|m| Module {
                    name: (*m).into(),
                    source: format!("aws/{m}"),
                    version: None,
                    remove: false,
                    inputs: serde_yaml::Mapping::new(),
                    metadata: None,
                    http_username: None,
                    http_password: None,
                })
                .collect(),
        }
    }

    #[test]
    fn reconcile_drops_stale_and_inserts_placeholders() {
        let mut state = State {
            base_config: BaseConfigState::default(),
            steps: vec![StateStep {
                name: "old".into(),
                workspace: "dev".into(),
                applied_at: None,
                modules: vec![StateModule {
                    name: "gone".into(),
                    version: Some(Version::new(1, 0, 0)),
                    applied_version: Some(Version::new(1, 0, 0)),
                }],
            }],
        };
        let config = Config {
            steps: vec![step("net", "dev", &["vpc"])],
            ..Config::default()
        };

        state.reconcile(&config);

        assert_eq!(state.steps.len(), 1);
        assert_eq!(state.steps[0].name, "net");
        assert_eq!(state.steps[0].modules.len(), 1);
        assert_eq!(state.steps[0].modules[0].name, "vpc");
        assert!(state.steps[0].modules[0].applied_version.is_none());
    }

    #[test]
    fn reconcile_keeps_applied_versions_and_mirrors_order() {
        let mut state = State::default();
        state.steps.push(StateStep {
            name: "b".into(),
            workspace: "dev".into(),
            applied_at: None,
            modules: vec![StateModule {
                name: "m".into(),
                version: Some(Version::new(1, 1, 0)),
                applied_version: Some(Version::new(1, 0, 0)),
            }],
        });
        let config = Config {
            steps: vec![step("a", "dev", &["x"]), step("b", "dev", &["m"])],
            ..Config::default()
        };

        state.reconcile(&config);

        assert_eq!(state.steps[0].name, "a");
        assert_eq!(state.steps[1].name, "b");
        assert_eq!(
            state.steps[1].modules[0].applied_version,
            Some(Version::new(1, 0, 0))
        );
    }

    #[test]
    fn yaml_round_trip_is_semantically_stable() {
        let state = State {
            base_config: BaseConfigState {
                version: Some(Version::new(2, 0, 0)),
                applied_version: Some(Version::new(1, 9, 0)),
            },
            steps: vec![StateStep {
                name: "net".into(),
                workspace: "dev".into(),
                applied_at: Some(Utc::now()),
                modules: vec![StateModule {
                    name: "vpc".into(),
                    version: Some(Version::new(1, 2, 0)),
                    applied_version: Some(Version::new(1, 2, 0)),
                }],
            }],
        };
        let yaml = serde_yaml::to_string(&state).unwrap();
        let reloaded: State = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(state, reloaded);
    }
}
