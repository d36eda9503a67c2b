//! The serializable flow snapshot.
//!
//! A snapshot is the only persisted state of a flow instance: it is
//! carried on the dispatcher's queue message between ticks. Handles are
//! stripped on serialization and re-bound by id when the next tick
//! rehydrates the state machine.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Ancestry propagated to scheduled children: ancestor node name →
/// its id, or, for subflows whose results are propagated, the subflow's
/// flattened finished map.
pub type Parent = IndexMap<String, ParentValue>;

/// One entry of a [`Parent`] map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParentValue {
    /// The id of a single ancestor node run.
    Id(Uuid),
    /// A finished subflow, flattened to task name → ids until only task
    /// names remain.
    Finished(IndexMap<String, Vec<Uuid>>),
}

/// A scheduled-but-not-terminal node as persisted: name and id only,
/// the handle is re-bound on rehydration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveNode {
    pub name: String,
    pub id: Uuid,
}

/// Persisted progress of one flow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    /// Key into the registry.
    pub flow_name: String,
    /// Identity of the currently enqueued dispatcher tick.
    pub dispatcher_id: Uuid,
    /// Flow-scoped argument blob.
    #[serde(default)]
    pub node_args: Option<Value>,
    /// Ancestry inherited from the parent flow.
    #[serde(default)]
    pub parent: Parent,
    /// Scheduled, not yet terminal nodes, in scheduling order.
    #[serde(default)]
    pub active_nodes: Vec<ActiveNode>,
    /// node name → ids of finished runs, insertion order preserved.
    #[serde(default)]
    pub finished_nodes: IndexMap<String, Vec<Uuid>>,
    /// node name → ids of failed runs, insertion order preserved.
    #[serde(default)]
    pub failed_nodes: IndexMap<String, Vec<Uuid>>,
    /// Indices into the flow's edge table of currently armed edges.
    #[serde(default)]
    pub waiting_edges: BTreeSet<usize>,
    /// Next re-enqueue delay in seconds; `None` on start and after
    /// termination.
    #[serde(default)]
    pub retry: Option<u64>,
}

impl FlowSnapshot {
    /// A fresh snapshot for a flow about to start, with a newly minted
    /// dispatcher id.
    pub fn new(flow_name: impl Into<String>, node_args: Option<Value>, parent: Parent) -> Self {
        Self::with_dispatcher_id(Uuid::new_v4(), flow_name, node_args, parent)
    }

    /// A fresh snapshot carrying a caller-chosen dispatcher id (used
    /// when the queue driver keys the flow's result by that id).
    pub fn with_dispatcher_id(
        dispatcher_id: Uuid,
        flow_name: impl Into<String>,
        node_args: Option<Value>,
        parent: Parent,
    ) -> Self {
        Self {
            flow_name: flow_name.into(),
            dispatcher_id,
            node_args,
            parent,
            active_nodes: Vec::new(),
            finished_nodes: IndexMap::new(),
            failed_nodes: IndexMap::new(),
            waiting_edges: BTreeSet::new(),
            retry: None,
        }
    }
}
