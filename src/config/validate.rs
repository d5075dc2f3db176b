//! # Config Validation
//!
//! Every violation is fatal before any side effect. The checks mirror the
//! constraints the cloud backends place on derived resource names, plus the
//! agent's own invariants: unique step keys and no module version
//! regression against the recorded state.

use crate::constants;
use crate::errors::{AgentError, AgentResult};
use crate::model::{Config, State, Step, VersionSpec};
use regex::Regex;
use std::collections::HashSet;

pub fn validate_config(config: &Config, state: &State) -> AgentResult<()> {
    validate_prefix(&config.prefix)?;

    if config.sources.is_empty() {
        return Err(AgentError::Validation(
            "at least one module source is required".into(),
        ));
    }
    for source in &config.sources {
        if source.url.trim().is_empty() {
            return Err(AgentError::Validation("source url must not be empty".into()));
        }
    }

    if let Some(schedule) = &config.schedule {
        if let Some(cron) = &schedule.update_cron {
            if !cron.trim().is_empty() {
                validate_cron(cron)?;
            }
        }
    }

    let mut keys = HashSet::new();
    for step in &config.steps {
        validate_step(step)?;
        if !keys.insert(step.key()) {
            return Err(AgentError::Validation(format!(
                "duplicate step: name '{}' and workspace '{}' are used twice",
                step.name, step.workspace
            )));
        }
        if let Some(before) = &step.before {
            if !config.steps.iter().any(|s| &s.name == before) {
                return Err(AgentError::Validation(format!(
                    "step '{}': before references unknown step '{}'",
                    step.name, before
                )));
            }
        }
    }

    validate_no_version_regression(config, state)?;
    Ok(())
}

fn validate_prefix(prefix: &str) -> AgentResult<()> {
    if prefix.is_empty() {
        return Err(AgentError::Validation("prefix is required".into()));
    }
    if prefix.len() > constants::MAX_PREFIX_LENGTH {
        return Err(AgentError::Validation(format!(
            "prefix '{}' exceeds maximum length of {} characters (got {})",
            prefix,
            constants::MAX_PREFIX_LENGTH,
            prefix.len()
        )));
    }
    let prefix_regex = Regex::new(r"^[a-z][a-z0-9-]*$")
        .map_err(|e| AgentError::Validation(format!("failed to compile regex: {e}")))?;
    if !prefix_regex.is_match(prefix) {
        return Err(AgentError::Validation(format!(
            "prefix '{prefix}' must be lowercase alphanumeric with hyphens and start with a letter"
        )));
    }
    Ok(())
}

fn validate_step(step: &Step) -> AgentResult<()> {
    if step.name.trim().is_empty() {
        return Err(AgentError::Validation("step name must not be empty".into()));
    }
    if step.workspace.trim().is_empty() {
        return Err(AgentError::Validation(format!(
            "step '{}': workspace must not be empty",
            step.name
        )));
    }
    for module in &step.modules {
        if module.name.trim().is_empty() {
            return Err(AgentError::Validation(format!(
                "step '{}': every module needs a name",
                step.name
            )));
        }
        if module.source.trim().is_empty() {
            return Err(AgentError::Validation(format!(
                "step '{}' module '{}': source must not be empty",
                step.name, module.name
            )));
        }
    }
    let mut module_names = HashSet::new();
    for module in &step.modules {
        if !module_names.insert(module.name.as_str()) {
            return Err(AgentError::Validation(format!(
                "step '{}': module name '{}' is used twice",
                step.name, module.name
            )));
        }
    }
    Ok(())
}

/// A module's desired version never regresses below its state-recorded
/// version. Only statically pinned versions can be checked here; `stable`
/// resolves at run time and moves forward by construction.
fn validate_no_version_regression(config: &Config, state: &State) -> AgentResult<()> {
    for step in &config.steps {
        let Some(state_step) = state.find_step(&step.name, &step.workspace) else {
            continue;
        };
        for module in &step.modules {
            let desired = module
                .version
                .as_ref()
                .or(step.version.as_ref())
                .or(config.version.as_ref());
            let Some(VersionSpec::Pinned(desired)) = desired else {
                continue;
            };
            let Some(recorded) = state_step
                .find_module(&module.name)
                .and_then(|m| m.applied_version.as_ref())
            else {
                continue;
            };
            if desired < recorded {
                return Err(AgentError::Validation(format!(
                    "step '{}' module '{}': desired version {} is below the applied version {}; \
                     version downgrades are refused",
                    step.name, module.name, desired, recorded
                )));
            }
        }
    }
    Ok(())
}

/// Five whitespace-separated cron fields.
fn validate_cron(cron: &str) -> AgentResult<()> {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(AgentError::Validation(format!(
            "schedule.updateCron '{cron}' must have five fields (minute hour day month weekday)"
        )));
    }
    let field_regex = Regex::new(r"^[0-9*,/-]+$")
        .map_err(|e| AgentError::Validation(format!("failed to compile regex: {e}")))?;
    for field in fields {
        if !field_regex.is_match(field) {
            return Err(AgentError::Validation(format!(
                "schedule.updateCron '{cron}': invalid field '{field}'"
            )));
        }
    }
    Ok(())
}
