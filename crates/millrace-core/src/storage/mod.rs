//! User storage adapters and the shared storage pool.
//!
//! Task results live in user-chosen back-ends behind the [`DataStorage`]
//! adapter trait. The [`StoragePool`] owns the registered adapters, maps
//! task names to adapters, and connects each adapter lazily under a
//! per-adapter lock. Condition predicates read through a [`StorageView`],
//! which additionally carries the task-name → task-id mapping of the edge
//! firing under evaluation.

pub mod memory;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde_json::Value;
use uuid::Uuid;

pub use memory::MemoryStorage;

/// User-supplied storage adapter.
///
/// Adapter errors propagate untouched to the caller; the orchestrator
/// does not wrap or retry them. `connect` is called lazily by the pool,
/// never by user code going through the pool.
pub trait DataStorage: Send + Sync {
    /// Connect to the backing resource. No-op adapters may do nothing.
    fn connect(&self) -> Result<()>;

    /// Whether the adapter currently holds a usable connection.
    fn is_connected(&self) -> bool;

    /// Drop the connection.
    fn disconnect(&self) -> Result<()>;

    /// Retrieve the stored result of a task run.
    fn retrieve(&self, flow_name: &str, task_name: &str, task_id: Uuid) -> Result<Value>;

    /// Store the result of a task run. Returns the id of the stored
    /// record.
    fn store(
        &self,
        node_args: Option<&Value>,
        flow_name: &str,
        task_name: &str,
        task_id: Uuid,
        result: &Value,
    ) -> Result<Uuid>;
}

struct AdapterSlot {
    adapter: Arc<dyn DataStorage>,
    connect_lock: Mutex<()>,
}

fn lock_ignoring_poison(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registry of storage adapters shared by all flows in a process.
///
/// Adapters are connected on first use with the double-checked pattern:
/// test `is_connected`, take the adapter's lock, re-test, then `connect`.
/// Reads by condition predicates are side-effect-free from the
/// dispatcher's perspective.
#[derive(Default)]
pub struct StoragePool {
    adapters: HashMap<String, AdapterSlot>,
    /// task name → storage name.
    assignments: HashMap<String, String>,
}

impl StoragePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under a storage name.
    pub fn register_storage(&mut self, name: impl Into<String>, adapter: Arc<dyn DataStorage>) {
        self.adapters.insert(
            name.into(),
            AdapterSlot {
                adapter,
                connect_lock: Mutex::new(()),
            },
        );
    }

    /// Assign a task to a named storage. Tasks without an assignment do
    /// not persist their results.
    pub fn assign_task(&mut self, task_name: impl Into<String>, storage_name: impl Into<String>) {
        self.assignments
            .insert(task_name.into(), storage_name.into());
    }

    /// The storage name a task is assigned to, if any.
    pub fn assignment(&self, task_name: &str) -> Option<&str> {
        self.assignments.get(task_name).map(String::as_str)
    }

    fn connected_adapter(&self, storage_name: &str) -> Result<Arc<dyn DataStorage>> {
        let slot = self
            .adapters
            .get(storage_name)
            .with_context(|| format!("storage {storage_name:?} is not registered"))?;

        if !slot.adapter.is_connected() {
            let _guard = lock_ignoring_poison(&slot.connect_lock);
            if !slot.adapter.is_connected() {
                slot.adapter
                    .connect()
                    .with_context(|| format!("failed to connect storage {storage_name:?}"))?;
            }
        }

        Ok(Arc::clone(&slot.adapter))
    }

    fn adapter_for_task(&self, task_name: &str) -> Result<Arc<dyn DataStorage>> {
        let storage_name = self
            .assignment(task_name)
            .with_context(|| format!("task {task_name:?} has no storage assigned"))?;
        self.connected_adapter(storage_name)
    }

    /// Retrieve the stored result of a task run through its assigned
    /// adapter.
    pub fn retrieve(&self, flow_name: &str, task_name: &str, task_id: Uuid) -> Result<Value> {
        let adapter = self.adapter_for_task(task_name)?;
        adapter.retrieve(flow_name, task_name, task_id)
    }

    /// Store a task result through its assigned adapter.
    pub fn store(
        &self,
        node_args: Option<&Value>,
        flow_name: &str,
        task_name: &str,
        task_id: Uuid,
        result: &Value,
    ) -> Result<Uuid> {
        let adapter = self.adapter_for_task(task_name)?;
        adapter.store(node_args, flow_name, task_name, task_id, result)
    }

    /// A read view scoped to one edge firing: `ids` maps each upstream
    /// task name to the id participating in the firing.
    pub fn view<'a>(&'a self, flow_name: &'a str, ids: IndexMap<String, Uuid>) -> StorageView<'a> {
        StorageView {
            pool: self,
            flow_name,
            ids,
        }
    }
}

impl std::fmt::Debug for StoragePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoragePool")
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .field("assignments", &self.assignments)
            .finish()
    }
}

/// Read access to upstream task results for a single condition
/// evaluation.
pub struct StorageView<'a> {
    pool: &'a StoragePool,
    flow_name: &'a str,
    ids: IndexMap<String, Uuid>,
}

impl StorageView<'_> {
    /// Retrieve the result of the upstream task participating in this
    /// firing. Errors if the task is not an upstream of the edge or has
    /// no storage assigned.
    pub fn get(&self, task_name: &str) -> Result<Value> {
        let id = self.node_id(task_name).with_context(|| {
            format!("task {task_name:?} is not an upstream of the edge under evaluation")
        })?;
        self.pool.retrieve(self.flow_name, task_name, id)
    }

    /// The id of the upstream task participating in this firing.
    pub fn node_id(&self, task_name: &str) -> Option<Uuid> {
        self.ids.get(task_name).copied()
    }

    /// The upstream task names visible to this evaluation.
    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.ids.keys().map(String::as_str)
    }
}
