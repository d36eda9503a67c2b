//! The `QueueDriver` trait -- the adapter interface for the distributed
//! task queue.
//!
//! A driver enqueues task envelopes and subflow dispatchers and hands
//! back `(id, handle)` pairs. Handles are a small polling capability over
//! the queue's asynchronous results: strictly non-blocking, no async
//! runtime required. Delivery is at-least-once; the orchestrator never
//! assumes exactly-once execution.

use anyhow::Result;
use serde_json::Value;
use uuid::Uuid;

use crate::state::snapshot::Parent;

/// Result of a non-blocking poll of a scheduled node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodePoll {
    /// Not terminal yet.
    Pending,
    /// Terminal success, with the node's result: a task's return value,
    /// or a subflow's finished-node map.
    Succeeded(Value),
    /// Terminal failure, with the failure payload.
    Failed(Value),
}

/// Non-blocking view of one scheduled node's asynchronous result.
pub trait NodeHandle: Send + Sync {
    /// Check the node's status. Must not block; errors propagate
    /// untouched and abort the tick.
    fn poll(&self) -> Result<NodePoll>;
}

/// Adapter interface for the distributed queue.
///
/// Object-safe so the dispatcher can hold it as `&dyn QueueDriver`.
pub trait QueueDriver: Send + Sync {
    /// Enqueue a task envelope. Returns a fresh node id and a handle on
    /// the task's result.
    fn delay_task(
        &self,
        task_name: &str,
        flow_name: &str,
        parent: &Parent,
        node_args: Option<&Value>,
    ) -> Result<(Uuid, Box<dyn NodeHandle>)>;

    /// Enqueue a subflow's dispatcher. Returns the child flow's
    /// dispatcher id and a handle that resolves to the child's
    /// finished-node map.
    fn delay_flow(
        &self,
        flow_name: &str,
        node_args: Option<&Value>,
        parent: Option<&Parent>,
    ) -> Result<(Uuid, Box<dyn NodeHandle>)>;

    /// Re-bind a handle to a previously scheduled node. Called on every
    /// tick when the snapshot is rehydrated.
    fn reattach(&self, id: Uuid) -> Box<dyn NodeHandle>;
}

// Compile-time assertion: QueueDriver must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn QueueDriver) {}
};
