//! Argo CD artifact assembly: one values document per module, consumed as
//! Helm values by the application set the step manages.

use crate::errors::AgentResult;
use crate::model::Step;

/// Render one module's values file. The inputs arrive with replacement
/// tokens already expanded; the step's Argo CD namespace is recorded so the
/// remote job knows where the applications land.
pub fn values_yaml(step: &Step, inputs: &serde_yaml::Mapping) -> AgentResult<String> {
    let mut document = serde_yaml::Mapping::new();
    if let Some(namespace) = &step.argocd_namespace {
        document.insert(
            serde_yaml::Value::String("argocdNamespace".into()),
            serde_yaml::Value::String(namespace.clone()),
        );
    }
    document.insert(
        serde_yaml::Value::String("values".into()),
        serde_yaml::Value::Mapping(inputs.clone()),
    );
    Ok(serde_yaml::to_string(&document)?)
}
