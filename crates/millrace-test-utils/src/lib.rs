//! Shared test utilities for millrace integration tests.
//!
//! The central piece is [`ManualQueue`]: a [`QueueDriver`] that records
//! every scheduled node and reports whatever terminal status the test
//! has injected with [`ManualQueue::set_finished`] /
//! [`ManualQueue::set_failed`]. Nothing runs; the test plays the role of
//! the queue's workers, finishing nodes between dispatcher ticks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use indexmap::IndexMap;
use serde_json::Value;
use uuid::Uuid;

use millrace_core::condition::{Always, Never};
use millrace_core::{
    Condition, Edge, EdgeTable, FlowConfig, FlowRegistry, Node, NodeHandle, NodePoll, Parent,
    QueueDriver,
};

/// A node the [`ManualQueue`] was asked to schedule.
#[derive(Debug, Clone)]
pub struct ScheduledNode {
    pub id: Uuid,
    /// Task name, or flow name for subflows.
    pub name: String,
    pub is_flow: bool,
    /// The flow that scheduled the task. `None` for subflow dispatches.
    pub flow_name: Option<String>,
    /// The parent map the node was scheduled with. `None` when parent
    /// propagation was gated off for a subflow.
    pub parent: Option<Parent>,
    pub node_args: Option<Value>,
}

#[derive(Default)]
struct QueueState {
    scheduled: Vec<ScheduledNode>,
    results: HashMap<Uuid, NodePoll>,
}

/// Manually driven queue driver.
#[derive(Clone, Default)]
pub struct ManualQueue {
    state: Arc<Mutex<QueueState>>,
}

impl ManualQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark a node successful with the given result.
    pub fn set_finished(&self, id: Uuid, result: Value) {
        self.lock().results.insert(id, NodePoll::Succeeded(result));
    }

    /// Mark a node failed with the given failure payload.
    pub fn set_failed(&self, id: Uuid, what: Value) {
        self.lock().results.insert(id, NodePoll::Failed(what));
    }

    /// Every node scheduled so far, in scheduling order.
    pub fn scheduled(&self) -> Vec<ScheduledNode> {
        self.lock().scheduled.clone()
    }

    /// Scheduled nodes with the given name, in scheduling order.
    pub fn scheduled_named(&self, name: &str) -> Vec<ScheduledNode> {
        self.lock()
            .scheduled
            .iter()
            .filter(|node| node.name == name)
            .cloned()
            .collect()
    }

    /// The single scheduled node with the given name. Panics if there is
    /// none or more than one -- tests use this when exactly one schedule
    /// is the expectation.
    pub fn only_scheduled(&self, name: &str) -> ScheduledNode {
        let matches = self.scheduled_named(name);
        assert_eq!(
            matches.len(),
            1,
            "expected exactly one scheduled node named {name:?}, found {}",
            matches.len()
        );
        matches.into_iter().next().unwrap()
    }
}

impl QueueDriver for ManualQueue {
    fn delay_task(
        &self,
        task_name: &str,
        flow_name: &str,
        parent: &Parent,
        node_args: Option<&Value>,
    ) -> Result<(Uuid, Box<dyn NodeHandle>)> {
        let id = Uuid::new_v4();
        self.lock().scheduled.push(ScheduledNode {
            id,
            name: task_name.to_string(),
            is_flow: false,
            flow_name: Some(flow_name.to_string()),
            parent: Some(parent.clone()),
            node_args: node_args.cloned(),
        });
        Ok((id, self.reattach(id)))
    }

    fn delay_flow(
        &self,
        flow_name: &str,
        node_args: Option<&Value>,
        parent: Option<&Parent>,
    ) -> Result<(Uuid, Box<dyn NodeHandle>)> {
        let id = Uuid::new_v4();
        self.lock().scheduled.push(ScheduledNode {
            id,
            name: flow_name.to_string(),
            is_flow: true,
            flow_name: None,
            parent: parent.cloned(),
            node_args: node_args.cloned(),
        });
        Ok((id, self.reattach(id)))
    }

    fn reattach(&self, id: Uuid) -> Box<dyn NodeHandle> {
        Box::new(ManualHandle {
            id,
            state: Arc::clone(&self.state),
        })
    }
}

struct ManualHandle {
    id: Uuid,
    state: Arc<Mutex<QueueState>>,
}

impl NodeHandle for ManualHandle {
    fn poll(&self) -> Result<NodePoll> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .results
            .get(&self.id)
            .cloned()
            .unwrap_or(NodePoll::Pending))
    }
}

/// The `always` condition as a shareable trait object.
pub fn always() -> Arc<dyn Condition> {
    Arc::new(Always)
}

/// The `never` condition as a shareable trait object.
pub fn never() -> Arc<dyn Condition> {
    Arc::new(Never)
}

/// An edge between task nodes with the `always` condition.
pub fn task_edge(from: &[&str], to: &[&str]) -> Edge {
    Edge::new(
        from.iter().map(|name| Node::task(*name)).collect(),
        to.iter().map(|name| Node::task(*name)).collect(),
        always(),
    )
}

/// A registry holding a single flow with the given edges and default
/// switches.
pub fn single_flow(name: &str, edges: Vec<Edge>) -> FlowRegistry {
    let mut registry = FlowRegistry::new();
    registry.insert(name, FlowConfig::new(EdgeTable::new(edges)));
    registry
}

/// A finished-node map value, as a subflow's dispatcher would report it.
pub fn finished_map(entries: &[(&str, &[Uuid])]) -> Value {
    let map: IndexMap<String, Vec<Uuid>> = entries
        .iter()
        .map(|(name, ids)| (name.to_string(), ids.to_vec()))
        .collect();
    serde_json::to_value(map).expect("finished map serializes")
}
