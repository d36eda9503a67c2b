//! The dispatcher: the thin driver that advances one flow instance by
//! one tick.
//!
//! The queue delivers the flow's snapshot; the dispatcher rehydrates the
//! state machine, runs [`FlowState::update`], and either hands back the
//! new snapshot with the delay to re-enqueue under, or reports the flow
//! finished. The queue serializes ticks per flow instance, so exactly one
//! dispatcher per instance is in flight at a time.

use anyhow::Result;
use indexmap::IndexMap;
use uuid::Uuid;

use crate::error::FlowError;
use crate::queue::QueueDriver;
use crate::registry::FlowRegistry;
use crate::state::snapshot::{FlowSnapshot, Parent};
use crate::state::{FlowContext, FlowState, RetryPolicy};
use crate::storage::StoragePool;

/// What the queue driver should do with the flow after a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Persist the snapshot and redeliver it after `delay` seconds.
    Reenqueue { snapshot: FlowSnapshot, delay: u64 },
    /// The flow has no more work; its result is the finished-node map.
    Finished {
        finished_nodes: IndexMap<String, Vec<Uuid>>,
    },
}

/// Per-tick driver over a compiled registry, a queue driver, and the
/// shared storage pool.
pub struct Dispatcher<'a> {
    registry: &'a FlowRegistry,
    queue: &'a dyn QueueDriver,
    storage: &'a StoragePool,
    policy: RetryPolicy,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        registry: &'a FlowRegistry,
        queue: &'a dyn QueueDriver,
        storage: &'a StoragePool,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            queue,
            storage,
            policy,
        }
    }

    /// Build the first-tick snapshot for a flow. Fails if the flow is
    /// not in the registry.
    pub fn start(
        &self,
        flow_name: &str,
        node_args: Option<serde_json::Value>,
        parent: Parent,
    ) -> Result<FlowSnapshot> {
        self.registry.flow(flow_name)?;
        Ok(FlowSnapshot::new(flow_name, node_args, parent))
    }

    /// Advance a flow by one tick.
    ///
    /// On error, the snapshot is untouched: a terminal error (see
    /// [`error_is_terminal`]) means the flow failed and must not be
    /// re-enqueued; anything else aborts the tick for redelivery.
    pub fn tick(&self, snapshot: &FlowSnapshot) -> Result<TickOutcome> {
        let mut state = FlowState::new(snapshot, self.registry, self.queue)?;
        let ctx = FlowContext {
            registry: self.registry,
            queue: self.queue,
            storage: self.storage,
            policy: self.policy,
        };

        match state.update(&ctx)? {
            Some(delay) => Ok(TickOutcome::Reenqueue {
                snapshot: state.to_snapshot(),
                delay,
            }),
            None => Ok(TickOutcome::Finished {
                finished_nodes: state.finished_nodes().clone(),
            }),
        }
    }
}

/// Whether a tick error is terminal for the flow.
///
/// Terminal errors are flow-level: no fallback for a failure set, or a
/// mis-compiled registry. Everything else (storage adapters, handle
/// polls, queue enqueues) is treated as transient and resolved by the
/// queue redelivering the same snapshot.
pub fn error_is_terminal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<FlowError>().is_some()
}
