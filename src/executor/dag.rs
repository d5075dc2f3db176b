//! # Step Dependency Graph
//!
//! Steps that consume another step's Terraform outputs through
//! `.toutput.<module>.*` depend on the step owning that module; an explicit
//! `before` field adds an edge as well. The order is a deterministic Kahn
//! walk with config order breaking ties; a cycle is rejected with the
//! offending step names.

use crate::errors::{AgentError, AgentResult};
use crate::model::Config;
use crate::template::referenced_output_modules;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

/// Compute execution batches for the given step indices: every batch only
/// depends on earlier batches, and batch members are mutually independent
/// (safe to fan out). Sequential mode simply flattens the batches.
pub fn execution_batches(config: &Config, active: &[usize]) -> AgentResult<Vec<Vec<usize>>> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut nodes: HashMap<usize, NodeIndex> = HashMap::new();
    for &index in active {
        nodes.insert(index, graph.add_node(index));
    }

    for &index in active {
        let step = &config.steps[index];

        // Output references: producer before consumer.
        for module_name in referenced_modules_of_step(config, index) {
            if let Some(producer) = config.step_of_module(&module_name) {
                let producer_index = config
                    .steps
                    .iter()
                    .position(|s| s.key() == producer.key())
                    .expect("producer comes from the same config");
                if producer_index != index {
                    if let (Some(&from), Some(&to)) =
                        (nodes.get(&producer_index), nodes.get(&index))
                    {
                        graph.update_edge(from, to, ());
                    }
                }
            }
        }

        // Explicit ordering hint: this step runs before the named one.
        if let Some(before) = &step.before {
            for (other_index, other) in config.steps.iter().enumerate() {
                if &other.name == before && other_index != index {
                    if let (Some(&from), Some(&to)) =
                        (nodes.get(&index), nodes.get(&other_index))
                    {
                        graph.update_edge(from, to, ());
                    }
                }
            }
        }
    }

    kahn_batches(config, &graph)
}

/// Every `.toutput` module name referenced anywhere in a step's inputs.
fn referenced_modules_of_step(config: &Config, index: usize) -> Vec<String> {
    let mut names = Vec::new();
    for module in &config.steps[index].modules {
        let mut texts = Vec::new();
        collect_strings(&serde_yaml::Value::Mapping(module.inputs.clone()), &mut texts);
        for text in texts {
            for name in referenced_output_modules(&text) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
    }
    names
}

fn collect_strings(value: &serde_yaml::Value, out: &mut Vec<String>) {
    match value {
        serde_yaml::Value::String(s) => out.push(s.clone()),
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map {
                collect_strings(v, out);
            }
        }
        _ => {}
    }
}

/// Layered Kahn walk; within a layer, config order. Leftover nodes mean a
/// cycle.
fn kahn_batches(config: &Config, graph: &DiGraph<usize, ()>) -> AgentResult<Vec<Vec<usize>>> {
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
        .collect();
    let mut done: Vec<NodeIndex> = Vec::new();
    let mut batches = Vec::new();

    while done.len() < graph.node_count() {
        let mut ready: Vec<NodeIndex> = in_degree
            .iter()
            .filter(|(n, &d)| d == 0 && !done.contains(n))
            .map(|(&n, _)| n)
            .collect();
        if ready.is_empty() {
            let stuck: Vec<&str> = in_degree
                .keys()
                .filter(|n| !done.contains(n))
                .map(|&n| config.steps[graph[n]].name.as_str())
                .collect();
            return Err(AgentError::Validation(format!(
                "cyclic output references between steps: {}",
                stuck.join(", ")
            )));
        }
        ready.sort_by_key(|&n| graph[n]);

        for &node in &ready {
            for neighbor in graph.neighbors_directed(node, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&neighbor) {
                    *degree -= 1;
                }
            }
        }
        done.extend(ready.iter().copied());
        batches.push(ready.into_iter().map(|n| graph[n]).collect());
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn output_references_order_producer_first() {
        let config = config(
            r#"
prefix: t
steps:
  - name: infra
    type: terraform
    workspace: dev
    modules:
      - name: eks
        source: aws/eks
        inputs:
          vpc_id: "{{ .toutput.vpc.vpc_id }}"
  - name: net
    type: terraform
    workspace: dev
    modules:
      - name: vpc
        source: aws/vpc
"#,
        );
        let batches = execution_batches(&config, &[0, 1]).unwrap();
        assert_eq!(batches, vec![vec![1], vec![0]]);
    }

    #[test]
    fn independent_steps_share_a_batch() {
        let config = config(
            r#"
prefix: t
steps:
  - name: a
    type: terraform
    workspace: dev
    modules: [{ name: m1, source: x/m1 }]
  - name: b
    type: terraform
    workspace: dev
    modules: [{ name: m2, source: x/m2 }]
"#,
        );
        let batches = execution_batches(&config, &[0, 1]).unwrap();
        assert_eq!(batches, vec![vec![0, 1]]);
    }

    #[test]
    fn before_adds_an_edge() {
        let config = config(
            r#"
prefix: t
steps:
  - name: late
    type: terraform
    workspace: dev
    modules: [{ name: m1, source: x/m1 }]
  - name: early
    type: terraform
    workspace: dev
    before: late
    modules: [{ name: m2, source: x/m2 }]
"#,
        );
        let batches = execution_batches(&config, &[0, 1]).unwrap();
        assert_eq!(batches, vec![vec![1], vec![0]]);
    }

    #[test]
    fn cycles_are_rejected_with_step_names() {
        let config = config(
            r#"
prefix: t
steps:
  - name: a
    type: terraform
    workspace: dev
    modules:
      - name: ma
        source: x/ma
        inputs: { ref: "{{ .toutput.mb.out }}" }
  - name: b
    type: terraform
    workspace: dev
    modules:
      - name: mb
        source: x/mb
        inputs: { ref: "{{ .toutput.ma.out }}" }
"#,
        );
        let err = execution_batches(&config, &[0, 1]).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("cyclic"));
        assert!(text.contains('a') && text.contains('b'));
    }

    #[test]
    fn self_references_are_ignored() {
        let config = config(
            r#"
prefix: t
steps:
  - name: solo
    type: terraform
    workspace: dev
    modules:
      - name: vpc
        source: aws/vpc
      - name: eks
        source: aws/eks
        inputs: { vpc_id: "{{ .toutput.vpc.vpc_id }}" }
"#,
        );
        let batches = execution_batches(&config, &[0]).unwrap();
        assert_eq!(batches, vec![vec![0]]);
    }
}
