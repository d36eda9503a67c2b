//! Flow definition parser and compiler.
//!
//! Parses a flow definition TOML string into a [`FlowFile`] and
//! validates:
//! - At least one flow; every flow has edges and at least one start edge.
//! - `to` lists are non-empty.
//! - Condition names resolve in the supplied registry.
//! - Failure combinations reference nodes that appear in the flow's
//!   edges; fallback markers are the literal `"drop"`.
//! - `nowait` entries and storage assignments reference known nodes.
//! - Propagation lists reference subflow names.
//!
//! Compilation resolves node kinds (a name is a subflow iff it names a
//! flow in the same file) and produces the immutable [`FlowRegistry`].

use indexmap::IndexMap;
use std::collections::HashSet;
use thiserror::Error;

use crate::condition::ConditionRegistry;
use crate::graph::failures::{Fallback, FailureTree};
use crate::graph::{Edge, EdgeTable, Node};
use crate::registry::{FlowConfig, FlowRegistry, PropagateRule};

use super::toml_format::{FallbackToml, FlowFile, FlowToml, PropagateToml};

/// Errors that can occur during flow definition parsing and validation.
#[derive(Debug, Error)]
pub enum FlowDefError {
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("definition contains no flows")]
    NoFlows,

    #[error("flow {flow:?} has no edges")]
    NoEdges { flow: String },

    #[error("flow {flow:?} has no start edge (an edge with empty `from`)")]
    NoStartEdge { flow: String },

    #[error("edge {index} of flow {flow:?} has an empty `to` list")]
    EmptyTo { flow: String, index: usize },

    #[error("unknown condition {condition:?} on edge {index} of flow {flow:?}")]
    UnknownCondition {
        flow: String,
        index: usize,
        condition: String,
    },

    #[error("failure handler of flow {flow:?} references unknown node {node:?}")]
    UnknownFailureNode { flow: String, node: String },

    #[error("invalid fallback marker {value:?} in flow {flow:?} (expected \"drop\" or a node list)")]
    InvalidFallbackMarker { flow: String, value: String },

    #[error("nowait list of flow {flow:?} references unknown node {node:?}")]
    UnknownNowaitNode { flow: String, node: String },

    #[error("{switch} of flow {flow:?} references {name:?}, which is not a flow")]
    UnknownPropagateTarget {
        flow: String,
        switch: &'static str,
        name: String,
    },

    #[error("storage is assigned to {task:?}, which is not a task of any flow")]
    UnknownStorageTask { task: String },
}

/// Output of compilation: the registry plus the task → storage-name
/// assignments to feed into a [`crate::storage::StoragePool`].
#[derive(Debug)]
pub struct CompiledFlows {
    pub registry: FlowRegistry,
    pub task_storage: IndexMap<String, String>,
}

/// Parse, validate, and compile a flow definition TOML string.
pub fn compile_flow_toml(
    content: &str,
    conditions: &ConditionRegistry,
) -> Result<CompiledFlows, FlowDefError> {
    let file: FlowFile = toml::from_str(content)?;
    compile(&file, conditions)
}

/// Compile an already-parsed [`FlowFile`].
pub fn compile(
    file: &FlowFile,
    conditions: &ConditionRegistry,
) -> Result<CompiledFlows, FlowDefError> {
    if file.flows.is_empty() {
        return Err(FlowDefError::NoFlows);
    }

    let flow_names: HashSet<&str> = file.flows.keys().map(String::as_str).collect();
    let resolve = |name: &str| -> Node {
        if flow_names.contains(name) {
            Node::subflow(name)
        } else {
            Node::task(name)
        }
    };

    let mut registry = FlowRegistry::new();
    // Every node name seen anywhere, for validating storage assignments.
    let mut all_nodes: HashSet<String> = HashSet::new();

    for (flow_name, flow) in &file.flows {
        let config = compile_flow(flow_name, flow, conditions, &flow_names, &resolve)?;

        for edge in config.edges.edges() {
            for node in edge.from.iter().chain(&edge.to) {
                all_nodes.insert(node.name().to_string());
            }
        }
        for failure in &flow.failures {
            if let FallbackToml::Nodes(nodes) = &failure.fallback {
                all_nodes.extend(nodes.iter().cloned());
            }
        }

        registry.insert(flow_name.clone(), config);
    }

    let mut task_storage = IndexMap::new();
    for (task_name, task) in &file.tasks {
        if !all_nodes.contains(task_name) || flow_names.contains(task_name.as_str()) {
            return Err(FlowDefError::UnknownStorageTask {
                task: task_name.clone(),
            });
        }
        if let Some(storage) = &task.storage {
            task_storage.insert(task_name.clone(), storage.clone());
        }
    }

    Ok(CompiledFlows {
        registry,
        task_storage,
    })
}

fn compile_flow(
    flow_name: &str,
    flow: &FlowToml,
    conditions: &ConditionRegistry,
    flow_names: &HashSet<&str>,
    resolve: &dyn Fn(&str) -> Node,
) -> Result<FlowConfig, FlowDefError> {
    if flow.edges.is_empty() {
        return Err(FlowDefError::NoEdges {
            flow: flow_name.to_string(),
        });
    }

    // Compile edges.
    let mut edges = Vec::with_capacity(flow.edges.len());
    let mut edge_nodes: HashSet<&str> = HashSet::new();
    let mut has_start = false;

    for (index, edge) in flow.edges.iter().enumerate() {
        if edge.to.is_empty() {
            return Err(FlowDefError::EmptyTo {
                flow: flow_name.to_string(),
                index,
            });
        }
        has_start |= edge.from.is_empty();

        let condition =
            conditions
                .get(&edge.condition)
                .ok_or_else(|| FlowDefError::UnknownCondition {
                    flow: flow_name.to_string(),
                    index,
                    condition: edge.condition.clone(),
                })?;

        edge_nodes.extend(edge.from.iter().map(String::as_str));
        edge_nodes.extend(edge.to.iter().map(String::as_str));

        edges.push(Edge::new(
            edge.from.iter().map(|name| resolve(name)).collect(),
            edge.to.iter().map(|name| resolve(name)).collect(),
            condition,
        ));
    }

    if !has_start {
        return Err(FlowDefError::NoStartEdge {
            flow: flow_name.to_string(),
        });
    }

    // Compile failures.
    let mut failures = FailureTree::new();
    let mut fallback_targets: HashSet<&str> = HashSet::new();

    for failure in &flow.failures {
        for node in &failure.nodes {
            if !edge_nodes.contains(node.as_str()) {
                return Err(FlowDefError::UnknownFailureNode {
                    flow: flow_name.to_string(),
                    node: node.clone(),
                });
            }
        }

        let fallback = match &failure.fallback {
            FallbackToml::Nodes(nodes) => {
                fallback_targets.extend(nodes.iter().map(String::as_str));
                Fallback::Run(nodes.iter().map(|name| resolve(name)).collect())
            }
            FallbackToml::Marker(marker) if marker == "drop" => Fallback::Drop,
            FallbackToml::Marker(marker) => {
                return Err(FlowDefError::InvalidFallbackMarker {
                    flow: flow_name.to_string(),
                    value: marker.clone(),
                });
            }
        };
        failures.insert(&failure.nodes, fallback);
    }

    // Validate nowait and propagation switches.
    for node in &flow.nowait {
        if !edge_nodes.contains(node.as_str()) && !fallback_targets.contains(node.as_str()) {
            return Err(FlowDefError::UnknownNowaitNode {
                flow: flow_name.to_string(),
                node: node.clone(),
            });
        }
    }

    let propagate_node_args =
        compile_propagate(flow_name, "propagate_node_args", &flow.propagate_node_args, flow_names)?;
    let propagate_parent =
        compile_propagate(flow_name, "propagate_parent", &flow.propagate_parent, flow_names)?;
    let propagate_finished =
        compile_propagate(flow_name, "propagate_finished", &flow.propagate_finished, flow_names)?;

    Ok(FlowConfig {
        edges: EdgeTable::new(edges),
        failures,
        nowait_nodes: flow.nowait.iter().cloned().collect(),
        propagate_node_args,
        propagate_parent,
        propagate_finished,
    })
}

fn compile_propagate(
    flow_name: &str,
    switch: &'static str,
    toml: &PropagateToml,
    flow_names: &HashSet<&str>,
) -> Result<PropagateRule, FlowDefError> {
    match toml {
        PropagateToml::Flag(false) => Ok(PropagateRule::None),
        PropagateToml::Flag(true) => Ok(PropagateRule::All),
        PropagateToml::Names(names) => {
            for name in names {
                if !flow_names.contains(name.as_str()) {
                    return Err(FlowDefError::UnknownPropagateTarget {
                        flow: flow_name.to_string(),
                        switch,
                        name: name.clone(),
                    });
                }
            }
            Ok(PropagateRule::Only(names.clone()))
        }
    }
}
