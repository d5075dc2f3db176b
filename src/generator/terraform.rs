//! Terraform artifact assembly: `provider.tf`, `main.tf` and
//! `backend.conf` for one step at one release.

use super::hcl;
use crate::model::{Module, Step};
use crate::provider::ProviderType;
use semver::Version;
use std::collections::BTreeMap;

/// A module with its repository and the release it renders at.
pub struct RenderedModule<'m> {
    pub module: &'m Module,
    pub repo_url: String,
    pub version: Version,
    /// Inputs with every replacement token already expanded.
    pub inputs: serde_yaml::Mapping,
}

const AWS_PROVIDER: &str = r#"terraform {
  backend "s3" {}

  required_providers {
    aws = {
      source = "hashicorp/aws"
    }
  }
}

provider "aws" {}
"#;

const LOCAL_PROVIDER: &str = r#"terraform {
  backend "local" {}
}
"#;

/// Kubernetes provider injected when a step carries a cluster-bearing
/// module, wired to the cluster the step manages.
const KUBERNETES_PROVIDER: &str = r#"
data "aws_eks_cluster" "this" {
  name = "CLUSTER_NAME"
}

data "aws_eks_cluster_auth" "this" {
  name = "CLUSTER_NAME"
}

provider "kubernetes" {
  host                   = data.aws_eks_cluster.this.endpoint
  cluster_ca_certificate = base64decode(data.aws_eks_cluster.this.certificate_authority[0].data)
  token                  = data.aws_eks_cluster_auth.this.token
}
"#;

pub fn provider_tf(provider_type: ProviderType, step: &Step, prefix: &str) -> String {
    let mut content = match provider_type {
        ProviderType::Aws => AWS_PROVIDER.to_string(),
        _ => LOCAL_PROVIDER.to_string(),
    };

    if needs_kubernetes_provider(step) && provider_type == ProviderType::Aws {
        let cluster = step
            .kubernetes_cluster_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", prefix, step.workspace));
        content.push_str(&KUBERNETES_PROVIDER.replace("CLUSTER_NAME", &cluster));
    }
    content
}

fn needs_kubernetes_provider(step: &Step) -> bool {
    step.kubernetes_cluster_name.is_some()
        || step.modules.iter().any(|m| {
            m.source.split('/').any(|segment| segment == "eks")
        })
}

pub fn main_tf(modules: &[RenderedModule<'_>]) -> String {
    let mut content = String::new();
    for rendered in modules {
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str(&format!("module \"{}\" {{\n", rendered.module.name));
        content.push_str(&format!(
            "  source = \"{}\"\n",
            module_source_address(rendered)
        ));
        for (key, value) in &rendered.inputs {
            let key = match key {
                serde_yaml::Value::String(s) => s.clone(),
                other => hcl::render(other, 0),
            };
            content.push_str(&hcl::render_assignment(&key, value, 1));
            content.push('\n');
        }
        content.push_str("}\n");
    }
    content
}

/// Library modules address their repo at the render tag; custom modules
/// pointing at an http registry or another scheme pass through untouched.
fn module_source_address(rendered: &RenderedModule<'_>) -> String {
    if rendered.module.has_custom_source() {
        return rendered.module.source.clone();
    }
    format!(
        "git::{}//{}?ref={}",
        rendered.repo_url, rendered.module.source, rendered.version
    )
}

pub fn backend_conf(vars: &BTreeMap<String, String>) -> String {
    let mut content = String::new();
    for (key, value) in vars {
        content.push_str(&format!("{key} = \"{value}\"\n"));
    }
    content
}
