//! The per-flow state machine.
//!
//! [`FlowState`] is rehydrated from a [`FlowSnapshot`] at the start of
//! every dispatcher tick, advanced exactly once by [`FlowState::update`],
//! and serialized back. One tick: poll the active nodes, arm and fire
//! edges for the newly finished ones, run fallbacks once the flow has
//! quiesced with failures, and compute the next re-enqueue delay.
//!
//! A tick is synchronous. The only I/O it performs is non-blocking
//! handle polling and enqueueing new node messages on the queue driver.

pub mod snapshot;

use std::collections::{BTreeSet, HashSet};

use anyhow::{Context, Result, bail};
use indexmap::IndexMap;
use itertools::Itertools;
use serde_json::Value;
use uuid::Uuid;

use crate::error::FlowError;
use crate::graph::failures::Fallback;
use crate::graph::{EdgeTable, Node};
use crate::queue::{NodeHandle, NodePoll, QueueDriver};
use crate::registry::FlowRegistry;
use crate::storage::StoragePool;

pub use snapshot::{ActiveNode, FlowSnapshot, Parent, ParentValue};

/// Re-enqueue delay bounds, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after a tick that scheduled work, and the first delay of a
    /// fresh flow.
    pub start_retry: u64,
    /// Cap for the exponential back-off while waiting on active nodes.
    pub max_retry: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            start_retry: 2,
            max_retry: 120,
        }
    }
}

/// Everything a tick needs besides the flow's own state: the compiled
/// registry, the queue driver, the storage pool, and the retry bounds.
#[derive(Clone, Copy)]
pub struct FlowContext<'a> {
    pub registry: &'a FlowRegistry,
    pub queue: &'a dyn QueueDriver,
    pub storage: &'a StoragePool,
    pub policy: RetryPolicy,
}

/// A scheduled node with its live handle, valid for the current tick
/// only. Handles are re-bound by id on rehydration.
struct ActiveNodeRef {
    node: Node,
    id: Uuid,
    handle: Box<dyn NodeHandle>,
}

/// A node that turned successful during the current tick, with the
/// result captured at poll time.
struct FinishedNode {
    node: Node,
    id: Uuid,
    result: Value,
}

/// The running state of one flow instance.
pub struct FlowState {
    flow_name: String,
    dispatcher_id: Uuid,
    node_args: Option<Value>,
    parent: Parent,
    active_nodes: Vec<ActiveNodeRef>,
    finished_nodes: IndexMap<String, Vec<Uuid>>,
    failed_nodes: IndexMap<String, Vec<Uuid>>,
    waiting_edges: BTreeSet<usize>,
    retry: Option<u64>,
}

impl FlowState {
    /// Rehydrate from a snapshot, re-binding a handle for every active
    /// node. Fails if the snapshot references a flow the registry does
    /// not know.
    pub fn new(
        snapshot: &FlowSnapshot,
        registry: &FlowRegistry,
        queue: &dyn QueueDriver,
    ) -> Result<Self> {
        registry.flow(&snapshot.flow_name)?;

        let active_nodes = snapshot
            .active_nodes
            .iter()
            .map(|active| ActiveNodeRef {
                node: registry.node(&active.name),
                id: active.id,
                handle: queue.reattach(active.id),
            })
            .collect();

        Ok(Self {
            flow_name: snapshot.flow_name.clone(),
            dispatcher_id: snapshot.dispatcher_id,
            node_args: snapshot.node_args.clone(),
            parent: snapshot.parent.clone(),
            active_nodes,
            finished_nodes: snapshot.finished_nodes.clone(),
            failed_nodes: snapshot.failed_nodes.clone(),
            waiting_edges: snapshot.waiting_edges.clone(),
            retry: snapshot.retry,
        })
    }

    /// Serialize back to the persisted form, stripping handles.
    pub fn to_snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            flow_name: self.flow_name.clone(),
            dispatcher_id: self.dispatcher_id,
            node_args: self.node_args.clone(),
            parent: self.parent.clone(),
            active_nodes: self
                .active_nodes
                .iter()
                .map(|active| ActiveNode {
                    name: active.node.name().to_string(),
                    id: active.id,
                })
                .collect(),
            finished_nodes: self.finished_nodes.clone(),
            failed_nodes: self.failed_nodes.clone(),
            waiting_edges: self.waiting_edges.clone(),
            retry: self.retry,
        }
    }

    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    pub fn node_args(&self) -> Option<&Value> {
        self.node_args.as_ref()
    }

    pub fn finished_nodes(&self) -> &IndexMap<String, Vec<Uuid>> {
        &self.finished_nodes
    }

    pub fn failed_nodes(&self) -> &IndexMap<String, Vec<Uuid>> {
        &self.failed_nodes
    }

    pub fn retry(&self) -> Option<u64> {
        self.retry
    }

    /// Advance the flow by one tick.
    ///
    /// Returns the next re-enqueue delay in seconds, or `None` once the
    /// flow has no more work. Terminal failures surface as a
    /// downcastable [`FlowError`]; any other error aborts the tick so
    /// the queue's redelivery retries the same snapshot.
    pub fn update(&mut self, ctx: &FlowContext<'_>) -> Result<Option<u64>> {
        // Starting up. Failed nodes disqualify: a flow whose only nodes
        // all failed before arming anything is quiesced, not fresh.
        if self.active_nodes.is_empty()
            && self.finished_nodes.is_empty()
            && self.waiting_edges.is_empty()
            && self.failed_nodes.is_empty()
        {
            return self.start_flow(ctx);
        }

        let new_finished = self.poll_active()?;

        let cfg = ctx.registry.flow(&self.flow_name)?;
        for finished in &new_finished {
            Self::arm_edges(&mut self.waiting_edges, &cfg.edges, finished.node.name());
        }

        // Recovery waits for quiescence: only once every in-flight node
        // has settled do failed nodes get a fallback pass.
        let mut fallback_started = 0;
        if self.active_nodes.is_empty() && !self.failed_nodes.is_empty() {
            fallback_started = self.run_fallback(ctx)?;
            if fallback_started == 0 && !self.failed_nodes.is_empty() {
                let nodes: Vec<String> = self.failed_nodes.keys().cloned().collect();
                return Err(FlowError::NoFallback {
                    flow: self.flow_name.clone(),
                    nodes,
                }
                .into());
            }
        }

        let started = self.fire_edges(ctx, new_finished)?;

        self.retry = if started > 0 || fallback_started > 0 {
            Some(ctx.policy.start_retry)
        } else if !self.active_nodes.is_empty() {
            let current = self.retry.unwrap_or(ctx.policy.start_retry);
            Some(current.saturating_mul(2).min(ctx.policy.max_retry))
        } else {
            None
        };
        Ok(self.retry)
    }

    /// First tick of a fresh flow: evaluate every start edge and arm the
    /// edges referencing the scheduled names.
    fn start_flow(&mut self, ctx: &FlowContext<'_>) -> Result<Option<u64>> {
        tracing::info!(
            flow_name = %self.flow_name,
            dispatcher_id = %self.dispatcher_id,
            args = ?self.node_args,
            "flow started"
        );

        let cfg = ctx.registry.flow(&self.flow_name)?;
        let start_edges: Vec<&crate::graph::Edge> =
            cfg.edges.start_edges().map(|(_, edge)| edge).collect();
        if start_edges.is_empty() {
            return Err(FlowError::NoStartEdge(self.flow_name.clone()).into());
        }

        let flow_name = self.flow_name.clone();
        let node_args = self.node_args.clone();
        let parent = self.parent.clone();

        for edge in start_edges {
            let view = ctx.storage.view(&flow_name, IndexMap::new());
            if edge.condition.evaluate(&view, node_args.as_ref())? {
                for target in &edge.to {
                    self.schedule_node(ctx, target, &parent, node_args.as_ref())?;
                    Self::arm_edges(&mut self.waiting_edges, &cfg.edges, target.name());
                }
            }
        }

        self.retry = if self.active_nodes.is_empty() {
            None
        } else {
            Some(ctx.policy.start_retry)
        };
        Ok(self.retry)
    }

    /// Poll every active node, partitioning into successful (returned),
    /// failed (recorded), and pending (kept active), in scan order.
    fn poll_active(&mut self) -> Result<Vec<FinishedNode>> {
        let mut newly_finished = Vec::new();
        let mut still_active = Vec::new();

        for active in std::mem::take(&mut self.active_nodes) {
            match active.handle.poll()? {
                NodePoll::Succeeded(result) => {
                    tracing::info!(
                        flow_name = %self.flow_name,
                        dispatcher_id = %self.dispatcher_id,
                        node_name = %active.node.name(),
                        node_id = %active.id,
                        "node successful"
                    );
                    newly_finished.push(FinishedNode {
                        node: active.node,
                        id: active.id,
                        result,
                    });
                }
                NodePoll::Failed(what) => {
                    tracing::warn!(
                        flow_name = %self.flow_name,
                        dispatcher_id = %self.dispatcher_id,
                        node_name = %active.node.name(),
                        node_id = %active.id,
                        what = %what,
                        "node failed"
                    );
                    self.failed_nodes
                        .entry(active.node.name().to_string())
                        .or_default()
                        .push(active.id);
                }
                NodePoll::Pending => still_active.push(active),
            }
        }

        self.active_nodes = still_active;
        Ok(newly_finished)
    }

    /// Arm every edge whose `from` set contains `node_name`. Armed edges
    /// stay armed until the flow terminates.
    fn arm_edges(waiting_edges: &mut BTreeSet<usize>, edges: &EdgeTable, node_name: &str) {
        for (idx, _) in edges.edges_from(node_name) {
            waiting_edges.insert(idx);
        }
    }

    /// Fire armed edges for each newly finished node, then record the
    /// node as finished. Returns how many target nodes were scheduled.
    fn fire_edges(&mut self, ctx: &FlowContext<'_>, new_finished: Vec<FinishedNode>) -> Result<usize> {
        // A single task finishing as the very first progress of the flow
        // seeds `node_args` with its result.
        if self.node_args.is_none()
            && new_finished.len() == 1
            && self.active_nodes.is_empty()
            && self.finished_nodes.is_empty()
            && !new_finished[0].node.is_subflow()
        {
            self.node_args = Some(new_finished[0].result.clone());
        }

        let flow_name = self.flow_name.clone();
        let node_args = self.node_args.clone();
        let mut started = 0;

        for finished in &new_finished {
            let cfg = ctx.registry.flow(&flow_name)?;
            let armed: Vec<usize> = self.waiting_edges.iter().copied().collect();

            for idx in armed {
                let edge = cfg.edges.get(idx).ok_or(FlowError::EdgeIndexOutOfBounds {
                    flow: flow_name.clone(),
                    index: idx,
                })?;
                if !edge.sources_contain(finished.node.name()) {
                    continue;
                }

                // Source roster, in `from` declaration order: the
                // just-finished id is the sole candidate for its own
                // name; every other upstream contributes all of its
                // finished ids.
                let mut roster: Vec<(&Node, Vec<Uuid>)> = Vec::new();
                let mut seen = HashSet::new();
                for upstream in &edge.from {
                    if !seen.insert(upstream.name()) {
                        continue;
                    }
                    let ids = if upstream.name() == finished.node.name() {
                        vec![finished.id]
                    } else {
                        self.finished_nodes
                            .get(upstream.name())
                            .cloned()
                            .unwrap_or_default()
                    };
                    roster.push((upstream, ids));
                }

                // An upstream with no finished run yet means no candidate
                // firing exists.
                if roster.iter().any(|(_, ids)| ids.is_empty()) {
                    continue;
                }

                let candidates: Vec<Vec<Uuid>> = roster
                    .iter()
                    .map(|(_, ids)| ids.clone())
                    .multi_cartesian_product()
                    .collect();

                for combo in candidates {
                    // Each candidate tuple must contain the just-finished
                    // id; the roster construction guarantees it.
                    debug_assert!(combo.contains(&finished.id));

                    let mut parent = Parent::new();
                    let mut id_mapping = IndexMap::new();
                    for ((upstream, _), id) in roster.iter().zip(combo.iter()) {
                        match upstream {
                            Node::Subflow(name) => {
                                if cfg.propagate_finished.allows(name) {
                                    let mut flattened = IndexMap::new();
                                    Self::flatten_finished(ctx, &mut flattened, *id)?;
                                    parent.insert(name.clone(), ParentValue::Finished(flattened));
                                }
                            }
                            Node::Task(name) => {
                                parent.insert(name.clone(), ParentValue::Id(*id));
                                id_mapping.insert(name.clone(), *id);
                            }
                        }
                    }

                    let view = ctx.storage.view(&flow_name, id_mapping);
                    if edge.condition.evaluate(&view, node_args.as_ref())? {
                        for target in &edge.to {
                            self.schedule_node(ctx, target, &parent, node_args.as_ref())?;
                            started += 1;
                        }
                    }
                }
            }

            self.finished_nodes
                .entry(finished.node.name().to_string())
                .or_default()
                .push(finished.id);
        }

        Ok(started)
    }

    /// Resolve a finished subflow's result into a flat task-name → ids
    /// map, recursing through nested subflows until only task names
    /// remain.
    fn flatten_finished(
        ctx: &FlowContext<'_>,
        acc: &mut IndexMap<String, Vec<Uuid>>,
        flow_id: Uuid,
    ) -> Result<()> {
        let handle = ctx.queue.reattach(flow_id);
        let result = match handle.poll()? {
            NodePoll::Succeeded(value) => value,
            NodePoll::Pending => bail!("finished subflow {flow_id} has no result available yet"),
            NodePoll::Failed(what) => {
                bail!("finished subflow {flow_id} reports failure: {what}")
            }
        };

        let finished: IndexMap<String, Vec<Uuid>> = serde_json::from_value(result)
            .with_context(|| format!("subflow {flow_id} result is not a finished-node map"))?;

        for (name, ids) in finished {
            if ctx.registry.is_flow(&name) {
                for child_id in ids {
                    Self::flatten_finished(ctx, acc, child_id)?;
                }
            } else {
                acc.entry(name).or_default().extend(ids);
            }
        }
        Ok(())
    }

    /// Schedule one node, gating `node_args` and `parent` for subflows
    /// and skipping tracking for nowait nodes.
    fn schedule_node(
        &mut self,
        ctx: &FlowContext<'_>,
        node: &Node,
        parent: &Parent,
        node_args: Option<&Value>,
    ) -> Result<Uuid> {
        let cfg = ctx.registry.flow(&self.flow_name)?;

        let (id, handle) = match node {
            Node::Subflow(child) => {
                let child_args = if cfg.propagate_node_args.allows(child) {
                    node_args
                } else {
                    None
                };
                let child_parent = if cfg.propagate_parent.allows(child) {
                    Some(parent)
                } else {
                    None
                };
                let (id, handle) = ctx.queue.delay_flow(child, child_args, child_parent)?;
                tracing::info!(
                    flow_name = %self.flow_name,
                    dispatcher_id = %self.dispatcher_id,
                    child_flow_name = %child,
                    child_dispatcher_id = %id,
                    parent = ?child_parent,
                    args = ?child_args,
                    "subflow scheduled"
                );
                (id, handle)
            }
            Node::Task(task) => {
                let (id, handle) =
                    ctx.queue
                        .delay_task(task, &self.flow_name, parent, node_args)?;
                tracing::info!(
                    flow_name = %self.flow_name,
                    dispatcher_id = %self.dispatcher_id,
                    task_name = %task,
                    task_id = %id,
                    parent = ?parent,
                    args = ?node_args,
                    "task scheduled"
                );
                (id, handle)
            }
        };

        if !cfg.is_nowait(node.name()) {
            self.active_nodes.push(ActiveNodeRef {
                node: node.clone(),
                id,
                handle,
            });
        }

        Ok(id)
    }

    /// One fallback pass over the quiesced failure set.
    ///
    /// Failed names are sorted alphabetically and their combinations
    /// enumerated from the largest down, so the most specific registered
    /// fallback wins. A sequence fallback schedules its nodes and returns
    /// immediately -- the flow waits for it before evaluating the
    /// remaining failures. A drop fallback consumes one failure id per
    /// name and the search continues.
    fn run_fallback(&mut self, ctx: &FlowContext<'_>) -> Result<usize> {
        let cfg = ctx.registry.flow(&self.flow_name)?;

        let mut names: Vec<String> = self.failed_nodes.keys().cloned().collect();
        names.sort();

        let node_args = self.node_args.clone();
        let mut started = 0;

        for k in (1..=names.len()).rev() {
            for combination in names.iter().combinations(k) {
                // Earlier drop matches may have consumed some of these
                // failures already; every name must still hold one.
                let front_ids: Option<Vec<Uuid>> = combination
                    .iter()
                    .map(|name| {
                        self.failed_nodes
                            .get(name.as_str())
                            .and_then(|ids| ids.first().copied())
                    })
                    .collect();
                let Some(front_ids) = front_ids else {
                    continue;
                };

                let key: Vec<&str> = combination.iter().map(|name| name.as_str()).collect();
                let Some(fallback) = cfg.failures.lookup(&key) else {
                    continue;
                };

                let consumed: Vec<(String, Uuid)> = combination
                    .iter()
                    .zip(front_ids)
                    .map(|(name, id)| ((*name).clone(), id))
                    .collect();

                match fallback {
                    Fallback::Run(nodes) => {
                        let mut parent = Parent::new();
                        for (name, id) in &consumed {
                            self.consume_failure(name);
                            parent.insert(name.clone(), ParentValue::Id(*id));
                        }
                        tracing::info!(
                            flow_name = %self.flow_name,
                            dispatcher_id = %self.dispatcher_id,
                            nodes = ?consumed,
                            fallback = ?nodes,
                            "fallback started"
                        );
                        for node in nodes {
                            self.schedule_node(ctx, node, &parent, node_args.as_ref())?;
                            started += 1;
                        }
                        // Wait for this fallback to finish before
                        // evaluating further failures; anything else
                        // makes recovery order time-dependent.
                        return Ok(started);
                    }
                    Fallback::Drop => {
                        for (name, _) in &consumed {
                            self.consume_failure(name);
                        }
                        tracing::info!(
                            flow_name = %self.flow_name,
                            dispatcher_id = %self.dispatcher_id,
                            nodes = ?consumed,
                            fallback = "drop",
                            "fallback started"
                        );
                    }
                }
            }
        }

        Ok(started)
    }

    /// Pop the oldest failure id for a name, removing the entry once
    /// empty.
    fn consume_failure(&mut self, name: &str) -> Option<Uuid> {
        let ids = self.failed_nodes.get_mut(name)?;
        if ids.is_empty() {
            return None;
        }
        let id = ids.remove(0);
        if ids.is_empty() {
            self.failed_nodes.shift_remove(name);
        }
        Some(id)
    }
}

impl std::fmt::Debug for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowState")
            .field("flow_name", &self.flow_name)
            .field("dispatcher_id", &self.dispatcher_id)
            .field("node_args", &self.node_args)
            .field("parent", &self.parent)
            .field(
                "active_nodes",
                &self
                    .active_nodes
                    .iter()
                    .map(|active| (active.node.name(), active.id))
                    .collect::<Vec<_>>(),
            )
            .field("finished_nodes", &self.finished_nodes)
            .field("failed_nodes", &self.failed_nodes)
            .field("waiting_edges", &self.waiting_edges)
            .field("retry", &self.retry)
            .finish()
    }
}
