//! In-memory storage adapter.
//!
//! Keeps results in a process-local map. Useful for dry runs, small
//! single-process deployments, and tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use serde_json::Value;
use uuid::Uuid;

use super::DataStorage;

/// A [`DataStorage`] backed by a `HashMap` keyed on task id.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    connected: AtomicBool,
    records: Mutex<HashMap<Uuid, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records. Test and introspection helper.
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DataStorage for MemoryStorage {
    fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn retrieve(&self, _flow_name: &str, task_name: &str, task_id: Uuid) -> Result<Value> {
        let records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        records
            .get(&task_id)
            .cloned()
            .with_context(|| format!("no stored result for task {task_name:?} id {task_id}"))
    }

    fn store(
        &self,
        _node_args: Option<&Value>,
        _flow_name: &str,
        _task_name: &str,
        task_id: Uuid,
        result: &Value,
    ) -> Result<Uuid> {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        records.insert(task_id, result.clone());
        Ok(task_id)
    }
}
