//! In-process queue driver.
//!
//! `LocalQueue` runs task bodies from a [`TaskRegistry`] on the tokio
//! blocking pool and drives subflows with a nested dispatcher loop on a
//! worker of their own. Results land in a shared map keyed by node id,
//! which is also what `reattach` reads -- so snapshots survive being
//! carried across ticks exactly as they would on a real queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use uuid::Uuid;

use crate::dispatcher::{Dispatcher, TickOutcome, error_is_terminal};
use crate::registry::FlowRegistry;
use crate::state::snapshot::{FlowSnapshot, Parent};
use crate::state::RetryPolicy;
use crate::storage::StoragePool;

use super::registry::{TaskContext, TaskRegistry};
use super::trait_def::{NodeHandle, NodePoll, QueueDriver};

/// Redeliveries of a subflow tick after transient errors before the
/// subflow is declared failed. A real queue would retry indefinitely;
/// in-process we bound it so a broken adapter cannot wedge a worker.
const MAX_REDELIVERIES: u32 = 3;

type ResultMap = Arc<Mutex<HashMap<Uuid, NodePoll>>>;

fn lock_results(results: &ResultMap) -> std::sync::MutexGuard<'_, HashMap<Uuid, NodePoll>> {
    results
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process [`QueueDriver`].
///
/// Cheap to clone; all clones share the same result map and worker pool.
#[derive(Clone)]
pub struct LocalQueue {
    runtime: tokio::runtime::Handle,
    registry: Arc<FlowRegistry>,
    tasks: Arc<TaskRegistry>,
    storage: Arc<StoragePool>,
    policy: RetryPolicy,
    results: ResultMap,
}

impl LocalQueue {
    /// Create a driver on the current tokio runtime.
    pub fn new(
        registry: Arc<FlowRegistry>,
        tasks: Arc<TaskRegistry>,
        storage: Arc<StoragePool>,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("LocalQueue requires a running tokio runtime")?;
        Ok(Self {
            runtime,
            registry,
            tasks,
            storage,
            policy,
            results: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Dispatch a top-level flow and block (asynchronously) until it
    /// terminates. Returns the flow's finished-node map.
    pub async fn run_flow(
        &self,
        flow_name: &str,
        node_args: Option<Value>,
    ) -> Result<indexmap::IndexMap<String, Vec<Uuid>>> {
        let (_, handle) = self.delay_flow(flow_name, node_args.as_ref(), None)?;
        loop {
            match handle.poll()? {
                NodePoll::Pending => tokio::time::sleep(Duration::from_millis(25)).await,
                NodePoll::Succeeded(value) => {
                    return serde_json::from_value(value)
                        .context("flow result is not a finished-node map");
                }
                NodePoll::Failed(what) => bail!("flow {flow_name:?} failed: {what}"),
            }
        }
    }

    fn handle_for(&self, id: Uuid) -> Box<dyn NodeHandle> {
        Box::new(LocalHandle {
            id,
            results: Arc::clone(&self.results),
        })
    }
}

impl QueueDriver for LocalQueue {
    fn delay_task(
        &self,
        task_name: &str,
        flow_name: &str,
        parent: &Parent,
        node_args: Option<&Value>,
    ) -> Result<(Uuid, Box<dyn NodeHandle>)> {
        let task = self
            .tasks
            .get(task_name)
            .with_context(|| format!("task {task_name:?} is not registered"))?;

        let id = Uuid::new_v4();
        let results = Arc::clone(&self.results);
        let storage = Arc::clone(&self.storage);
        let task_name = task_name.to_string();
        let flow_name = flow_name.to_string();
        let parent = parent.clone();
        let node_args = node_args.cloned();

        self.runtime.spawn_blocking(move || {
            let ctx = TaskContext {
                flow_name: &flow_name,
                task_name: &task_name,
                task_id: id,
                node_args: node_args.as_ref(),
                parent: &parent,
                storage: &storage,
            };
            // The envelope stores the result before the node is reported
            // successful, so downstream conditions always see it.
            let outcome = task.run(&ctx).and_then(|result| {
                if storage.assignment(&task_name).is_some() {
                    storage.store(node_args.as_ref(), &flow_name, &task_name, id, &result)?;
                }
                Ok(result)
            });

            let poll = match outcome {
                Ok(result) => NodePoll::Succeeded(result),
                Err(err) => {
                    tracing::warn!(
                        task_name = %task_name,
                        task_id = %id,
                        error = %err,
                        "task body failed"
                    );
                    NodePoll::Failed(Value::String(format!("{err:#}")))
                }
            };
            lock_results(&results).insert(id, poll);
        });

        Ok((id, self.handle_for(id)))
    }

    fn delay_flow(
        &self,
        flow_name: &str,
        node_args: Option<&Value>,
        parent: Option<&Parent>,
    ) -> Result<(Uuid, Box<dyn NodeHandle>)> {
        // Reject unknown flows at schedule time rather than on the
        // worker, where the error would surface one tick later.
        self.registry.flow(flow_name)?;

        let id = Uuid::new_v4();
        let queue = self.clone();
        let results = Arc::clone(&self.results);
        let flow_name = flow_name.to_string();
        let node_args = node_args.cloned();
        let parent = parent.cloned().unwrap_or_default();

        self.runtime.spawn_blocking(move || {
            let dispatcher = Dispatcher::new(
                &queue.registry,
                &queue,
                &queue.storage,
                queue.policy,
            );
            let mut snapshot =
                FlowSnapshot::with_dispatcher_id(id, flow_name.as_str(), node_args, parent);
            let mut redeliveries = 0u32;

            let poll = loop {
                match dispatcher.tick(&snapshot) {
                    Ok(TickOutcome::Reenqueue {
                        snapshot: next,
                        delay,
                    }) => {
                        snapshot = next;
                        std::thread::sleep(Duration::from_secs(delay));
                    }
                    Ok(TickOutcome::Finished { finished_nodes }) => {
                        break match serde_json::to_value(&finished_nodes) {
                            Ok(value) => NodePoll::Succeeded(value),
                            Err(err) => NodePoll::Failed(Value::String(format!("{err:#}"))),
                        };
                    }
                    Err(err) if error_is_terminal(&err) => {
                        tracing::error!(
                            flow_name = %flow_name,
                            dispatcher_id = %id,
                            error = %err,
                            "flow failed"
                        );
                        break NodePoll::Failed(Value::String(format!("{err:#}")));
                    }
                    Err(err) => {
                        redeliveries += 1;
                        if redeliveries > MAX_REDELIVERIES {
                            break NodePoll::Failed(Value::String(format!(
                                "tick kept failing after {MAX_REDELIVERIES} redeliveries: {err:#}"
                            )));
                        }
                        tracing::warn!(
                            flow_name = %flow_name,
                            dispatcher_id = %id,
                            error = %err,
                            "tick aborted, redelivering snapshot"
                        );
                        std::thread::sleep(Duration::from_secs(queue.policy.start_retry));
                    }
                }
            };

            lock_results(&results).insert(id, poll);
        });

        Ok((id, self.handle_for(id)))
    }

    fn reattach(&self, id: Uuid) -> Box<dyn NodeHandle> {
        self.handle_for(id)
    }
}

impl std::fmt::Debug for LocalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalQueue")
            .field("tasks", &self.tasks)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Handle over the shared result map. Unknown ids are pending: the
/// worker has not reported yet.
struct LocalHandle {
    id: Uuid,
    results: ResultMap,
}

impl NodeHandle for LocalHandle {
    fn poll(&self) -> Result<NodePoll> {
        Ok(lock_results(&self.results)
            .get(&self.id)
            .cloned()
            .unwrap_or(NodePoll::Pending))
    }
}
