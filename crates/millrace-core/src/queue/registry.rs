//! Task registry -- a named collection of executable task bodies for the
//! in-process queue driver.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use uuid::Uuid;

use crate::state::snapshot::Parent;
use crate::storage::StoragePool;

/// Everything a task body sees when it runs.
pub struct TaskContext<'a> {
    pub flow_name: &'a str,
    pub task_name: &'a str,
    pub task_id: Uuid,
    pub node_args: Option<&'a Value>,
    pub parent: &'a Parent,
    /// Read access to upstream results via the shared pool.
    pub storage: &'a StoragePool,
}

/// A unit of executable work. The returned value becomes the node's
/// result: stored through the task's assigned storage and visible to
/// downstream condition predicates.
pub trait FlowTask: Send + Sync {
    fn run(&self, ctx: &TaskContext<'_>) -> Result<Value>;
}

impl<F> FlowTask for F
where
    F: Fn(&TaskContext<'_>) -> Result<Value> + Send + Sync,
{
    fn run(&self, ctx: &TaskContext<'_>) -> Result<Value> {
        self(ctx)
    }
}

/// A collection of registered [`FlowTask`] implementations, keyed by the
/// task name used in flow definitions.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn FlowTask>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task body under a name. If a task with the same name
    /// is already registered, it is replaced and the old one returned.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        task: impl FlowTask + 'static,
    ) -> Option<Arc<dyn FlowTask>> {
        self.tasks.insert(name.into(), Arc::new(task))
    }

    /// Look up a task body by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn FlowTask>> {
        self.tasks.get(name).cloned()
    }

    /// List the names of all registered tasks. Order is not guaranteed.
    pub fn list(&self) -> Vec<&str> {
        self.tasks.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}
