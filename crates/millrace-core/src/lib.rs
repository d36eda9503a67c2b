//! millrace -- a distributed dataflow orchestrator.
//!
//! Flows are directed graphs whose nodes are tasks or nested flows.
//! Edges fire once all of their source nodes have finished and a
//! condition predicate over upstream storage holds; targets are then
//! scheduled on a distributed task queue. Per flow instance, a
//! [`Dispatcher`] advances the serializable [`FlowState`] one tick at a
//! time and re-enqueues itself with exponential back-off until the flow
//! terminates.
//!
//! The crate is organized around the queue boundary: the core consumes
//! the [`QueueDriver`] and [`DataStorage`] adapter traits and ships an
//! in-process driver ([`LocalQueue`]) plus an in-memory storage adapter
//! for single-process deployments and tests.

pub mod condition;
pub mod dispatcher;
pub mod error;
pub mod flowdef;
pub mod graph;
pub mod queue;
pub mod registry;
pub mod state;
pub mod storage;

pub use condition::{Condition, ConditionRegistry};
pub use dispatcher::{Dispatcher, TickOutcome, error_is_terminal};
pub use error::FlowError;
pub use graph::failures::{FailureTree, Fallback};
pub use graph::{Edge, EdgeTable, Node};
pub use queue::{FlowTask, LocalQueue, NodeHandle, NodePoll, QueueDriver, TaskContext, TaskRegistry};
pub use registry::{FlowConfig, FlowRegistry, PropagateRule};
pub use state::snapshot::{ActiveNode, FlowSnapshot, Parent, ParentValue};
pub use state::{FlowContext, FlowState, RetryPolicy};
pub use storage::{DataStorage, MemoryStorage, StoragePool, StorageView};
