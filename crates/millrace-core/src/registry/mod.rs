//! The flow registry: every compiled flow in the deployment, immutable
//! after compilation.
//!
//! The registry is an explicit value passed into the dispatcher and the
//! flow state machine -- there is no process-wide configuration
//! singleton. It holds, per flow, the edge table, the failure tree, and
//! the flow's propagation switches.

use std::collections::{HashMap, HashSet};

use crate::error::FlowError;
use crate::graph::failures::FailureTree;
use crate::graph::{EdgeTable, Node};

/// Whether (and for which subflows) a flow forwards a value downstream.
///
/// Flow definitions accept either a boolean or a list of subflow names,
/// mirroring the three propagation switches (`node_args`, `parent`,
/// `finished`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PropagateRule {
    /// Never forward.
    #[default]
    None,
    /// Forward to every subflow.
    All,
    /// Forward only to the named subflows.
    Only(Vec<String>),
}

impl PropagateRule {
    pub fn allows(&self, name: &str) -> bool {
        match self {
            PropagateRule::None => false,
            PropagateRule::All => true,
            PropagateRule::Only(names) => names.iter().any(|n| n == name),
        }
    }
}

/// One flow's compiled shape and switches.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// The ordered edge sequence.
    pub edges: EdgeTable,
    /// Fallbacks keyed by failed-node combinations.
    pub failures: FailureTree,
    /// Fire-and-forget nodes: scheduled but never tracked.
    pub nowait_nodes: HashSet<String>,
    /// Pass `node_args` into scheduled subflows?
    pub propagate_node_args: PropagateRule,
    /// Pass `parent` into scheduled subflows?
    pub propagate_parent: PropagateRule,
    /// Flatten a finished subflow's results into the parent map when an
    /// edge downstream of the subflow fires?
    pub propagate_finished: PropagateRule,
}

impl FlowConfig {
    /// A config with the given edges and all switches at their defaults.
    pub fn new(edges: EdgeTable) -> Self {
        Self {
            edges,
            failures: FailureTree::new(),
            nowait_nodes: HashSet::new(),
            propagate_node_args: PropagateRule::default(),
            propagate_parent: PropagateRule::default(),
            propagate_finished: PropagateRule::default(),
        }
    }

    pub fn is_nowait(&self, node_name: &str) -> bool {
        self.nowait_nodes.contains(node_name)
    }
}

/// All flows known to a deployment.
#[derive(Debug, Clone, Default)]
pub struct FlowRegistry {
    flows: HashMap<String, FlowConfig>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a flow.
    pub fn insert(&mut self, name: impl Into<String>, config: FlowConfig) {
        self.flows.insert(name.into(), config);
    }

    /// Look up a flow's config; unknown names are a terminal
    /// configuration error.
    pub fn flow(&self, name: &str) -> Result<&FlowConfig, FlowError> {
        self.flows
            .get(name)
            .ok_or_else(|| FlowError::UnknownFlow(name.to_string()))
    }

    /// Whether a node name refers to a flow in this registry.
    pub fn is_flow(&self, name: &str) -> bool {
        self.flows.contains_key(name)
    }

    /// Resolve a bare name to a tagged node. Names that are not flows
    /// are tasks.
    pub fn node(&self, name: &str) -> Node {
        if self.is_flow(name) {
            Node::subflow(name)
        } else {
            Node::task(name)
        }
    }

    /// Names of all registered flows, in no particular order.
    pub fn flow_names(&self) -> impl Iterator<Item = &str> {
        self.flows.keys().map(String::as_str)
    }
}
