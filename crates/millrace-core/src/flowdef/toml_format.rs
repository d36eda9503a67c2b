//! TOML format types for flow definition files.
//!
//! These types map directly to the on-disk format and are deserialized
//! via `serde` + the `toml` crate. Validation and compilation into a
//! [`crate::registry::FlowRegistry`] happen in [`super::parser`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Top-level structure of a flow definition file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowFile {
    /// Flows keyed by name, in declaration order.
    pub flows: IndexMap<String, FlowToml>,
    /// Optional per-task settings, keyed by task name.
    #[serde(default)]
    pub tasks: IndexMap<String, TaskToml>,
}

/// One `[flows.<name>]` block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FlowToml {
    /// Fire-and-forget nodes: scheduled but never tracked.
    #[serde(default)]
    pub nowait: Vec<String>,
    /// Pass the flow's `node_args` into scheduled subflows.
    #[serde(default)]
    pub propagate_node_args: PropagateToml,
    /// Pass the `parent` map into scheduled subflows.
    #[serde(default)]
    pub propagate_parent: PropagateToml,
    /// Flatten finished subflow results into the parent map downstream.
    #[serde(default)]
    pub propagate_finished: PropagateToml,
    /// The flow's edges, in firing-priority order.
    #[serde(default)]
    pub edges: Vec<EdgeToml>,
    /// Fallbacks for combinations of failed nodes.
    #[serde(default)]
    pub failures: Vec<FailureToml>,
}

/// A propagation switch: a plain boolean, or a list of subflow names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PropagateToml {
    Flag(bool),
    Names(Vec<String>),
}

impl Default for PropagateToml {
    fn default() -> Self {
        PropagateToml::Flag(false)
    }
}

/// A single `[[flows.<name>.edges]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeToml {
    /// Source nodes; empty means a start edge.
    #[serde(default)]
    pub from: Vec<String>,
    /// Target nodes, scheduled in declaration order.
    pub to: Vec<String>,
    /// Name of a condition in the [`crate::condition::ConditionRegistry`].
    #[serde(default = "default_condition")]
    pub condition: String,
}

/// A single `[[flows.<name>.failures]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureToml {
    /// The combination of failed nodes this fallback covers.
    pub nodes: Vec<String>,
    /// Either a list of nodes to schedule, or the string `"drop"` to
    /// consume the failure without scheduling anything.
    pub fallback: FallbackToml,
}

/// Fallback specification: recovery nodes or the drop marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FallbackToml {
    Nodes(Vec<String>),
    Marker(String),
}

/// A single `[tasks.<name>]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TaskToml {
    /// Storage name the task's results are written to.
    #[serde(default)]
    pub storage: Option<String>,
}

fn default_condition() -> String {
    "always".to_string()
}
