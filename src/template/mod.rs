//! # Template Replacement
//!
//! One expander service resolves every `{{ .namespace... }}` token found in
//! module inputs and selected step fields, just before the step runs:
//!
//! - `.toutput.<module>.<name>` — a Terraform output of a prior step's module
//! - `.ssm.<path>` — a raw parameter-store path
//! - `.output.<module>.<name>` — a module output copied into the store
//! - `.config.<key>` — a top-level config key
//! - `.agent.version` — the agent's own version
//! - `.custom.<key>` — the custom side-channel parameters
//!
//! A missing required replacement fails the step's generation. No other
//! component performs string substitution.

use crate::constants;
use crate::errors::{AgentError, AgentResult};
use crate::model::Config;
use crate::provider::ParamStore;
use regex::Regex;
use std::collections::HashMap;

/// Output values of one module, as published after its step applied.
pub type ModuleOutputs = HashMap<String, serde_json::Value>;

/// In-memory table of Terraform outputs collected during the current run,
/// keyed by module name with the owning step recorded alongside.
#[derive(Debug, Default, Clone)]
pub struct StepOutputs {
    modules: HashMap<String, (String, ModuleOutputs)>,
}

impl StepOutputs {
    pub fn insert_module(&mut self, step: &str, module: &str, outputs: ModuleOutputs) {
        self.modules
            .insert(module.to_string(), (step.to_string(), outputs));
    }

    pub fn get(&self, module: &str, name: &str) -> Option<&serde_json::Value> {
        self.modules.get(module).and_then(|(_, o)| o.get(name))
    }

    pub fn module_outputs(&self, module: &str) -> Option<&ModuleOutputs> {
        self.modules.get(module).map(|(_, o)| o)
    }
}

pub struct Replacer<'a> {
    config_value: serde_yaml::Value,
    agent_version: &'a str,
    params: &'a dyn ParamStore,
    outputs: &'a StepOutputs,
    param_root: String,
    pattern: Regex,
}

impl<'a> Replacer<'a> {
    pub fn new(
        config: &Config,
        agent_version: &'a str,
        params: &'a dyn ParamStore,
        outputs: &'a StepOutputs,
        param_root: &str,
    ) -> Self {
        Replacer {
            config_value: serde_yaml::to_value(config)
                .unwrap_or(serde_yaml::Value::Null),
            agent_version,
            params,
            outputs,
            param_root: param_root.to_string(),
            pattern: token_pattern(),
        }
    }

    /// Expand every replacement token in `input`. Text without tokens is
    /// returned unchanged.
    pub async fn replace(&self, input: &str) -> AgentResult<String> {
        let mut result = String::with_capacity(input.len());
        let mut cursor = 0usize;
        for caps in self.pattern.captures_iter(input) {
            let whole = caps.get(0).expect("capture 0 always present");
            let expr = caps.get(1).expect("token expression group").as_str();
            result.push_str(&input[cursor..whole.start()]);
            result.push_str(&self.resolve(expr).await?);
            cursor = whole.end();
        }
        result.push_str(&input[cursor..]);
        Ok(result)
    }

    async fn resolve(&self, expr: &str) -> AgentResult<String> {
        let (namespace, rest) = expr
            .split_once('.')
            .ok_or_else(|| bad_token(expr, "missing namespace"))?;

        match namespace {
            "toutput" => {
                let (module, name) = rest
                    .split_once('.')
                    .ok_or_else(|| bad_token(expr, "expected .toutput.<module>.<name>"))?;
                let value = self.outputs.get(module, name).ok_or_else(|| {
                    AgentError::Validation(format!(
                        "replacement '{{{{ .{expr} }}}}': no output '{name}' recorded for module '{module}'; \
                         the producing step must run earlier"
                    ))
                })?;
                Ok(render_value(value))
            }
            "ssm" => self.params.get_parameter(rest).await.map_err(|e| {
                e.context(&format!("replacement '{{{{ .{expr} }}}}'"))
            }),
            "output" => {
                let (module, name) = rest
                    .split_once('.')
                    .ok_or_else(|| bad_token(expr, "expected .output.<module>.<name>"))?;
                let path = format!("{}/{module}/{name}", self.param_root);
                self.params
                    .get_parameter(&path)
                    .await
                    .map_err(|e| e.context(&format!("replacement '{{{{ .{expr} }}}}'")))
            }
            "config" => {
                let value = self
                    .config_value
                    .get(rest)
                    .ok_or_else(|| bad_token(expr, "no such config key"))?;
                Ok(render_yaml_scalar(value)
                    .ok_or_else(|| bad_token(expr, "config key is not a scalar"))?)
            }
            "agent" if rest == "version" => Ok(self.agent_version.to_string()),
            "custom" => {
                let path = format!(
                    "{}/{}/{rest}",
                    self.param_root,
                    constants::CUSTOM_PARAMETERS_SEGMENT
                );
                self.params
                    .get_parameter(&path)
                    .await
                    .map_err(|e| e.context(&format!("replacement '{{{{ .{expr} }}}}'")))
            }
            _ => Err(bad_token(expr, "unknown namespace")),
        }
    }
}

/// Module names referenced through `.toutput.<module>.*` in a piece of
/// text. Used to build the step dependency graph before any resolution.
pub fn referenced_output_modules(input: &str) -> Vec<String> {
    let pattern = token_pattern();
    let mut modules = Vec::new();
    for caps in pattern.captures_iter(input) {
        let expr = caps.get(1).expect("token expression group").as_str();
        if let Some(rest) = expr.strip_prefix("toutput.") {
            if let Some((module, _)) = rest.split_once('.') {
                if !modules.iter().any(|m| m == module) {
                    modules.push(module.to_string());
                }
            }
        }
    }
    modules
}

fn token_pattern() -> Regex {
    Regex::new(r"\{\{\s*\.([A-Za-z0-9_][A-Za-z0-9_./-]*)\s*\}\}")
        .expect("replacement token pattern is valid")
}

fn bad_token(expr: &str, reason: &str) -> AgentError {
    AgentError::Validation(format!("replacement '{{{{ .{expr} }}}}': {reason}"))
}

/// Terraform outputs come back as JSON; strings are inserted verbatim,
/// anything structured keeps its JSON text form.
fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_yaml_scalar(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
