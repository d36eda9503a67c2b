//! `millrace simulate` command: run a flow from a definition file on the
//! in-process queue, with an echo body standing in for every task.
//!
//! The simulation exercises the real orchestration path -- edge firing,
//! argument propagation, subflow dispatch, fallbacks, back-off -- while
//! each task simply returns its `node_args`. Results land in in-memory
//! storage adapters registered under the definition's storage names.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;

use millrace_core::flowdef::{FallbackToml, FlowFile, compile};
use millrace_core::{
    ConditionRegistry, LocalQueue, MemoryStorage, RetryPolicy, StoragePool, TaskContext,
    TaskRegistry,
};

/// Run the simulate command.
pub async fn run_simulate(
    path: &str,
    flow_name: &str,
    args: Option<&str>,
    start_retry: u64,
    max_retry: u64,
) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read flow definition {path}"))?;
    let file: FlowFile = toml::from_str(&content)
        .with_context(|| format!("invalid flow definition {path}"))?;

    let compiled = compile(&file, &ConditionRegistry::with_builtins())
        .with_context(|| format!("invalid flow definition {path}"))?;
    compiled.registry.flow(flow_name)?;

    let node_args: Option<Value> = args
        .map(serde_json::from_str)
        .transpose()
        .context("--args is not valid JSON")?;

    // In-memory storage under every assigned storage name.
    let mut pool = StoragePool::new();
    let storage_names: BTreeSet<&String> = compiled.task_storage.values().collect();
    for name in storage_names {
        pool.register_storage(name.clone(), Arc::new(MemoryStorage::new()));
    }
    for (task, storage) in &compiled.task_storage {
        pool.assign_task(task.clone(), storage.clone());
    }

    // Echo bodies for every task named anywhere in the definition.
    let mut tasks = TaskRegistry::new();
    for name in task_names(&file) {
        tasks.register(name, echo_task);
    }

    let queue = LocalQueue::new(
        Arc::new(compiled.registry),
        Arc::new(tasks),
        Arc::new(pool),
        RetryPolicy {
            start_retry,
            max_retry,
        },
    )?;

    tracing::info!(flow_name = %flow_name, "simulation starting");
    let finished = queue.run_flow(flow_name, node_args).await?;

    println!("{}", serde_json::to_string_pretty(&finished)?);
    Ok(())
}

fn echo_task(ctx: &TaskContext<'_>) -> Result<Value> {
    Ok(ctx.node_args.cloned().unwrap_or(Value::Null))
}

/// Every task name in the definition: edge endpoints plus fallback
/// targets, minus flow names.
fn task_names(file: &FlowFile) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for flow in file.flows.values() {
        for edge in &flow.edges {
            names.extend(edge.from.iter().cloned());
            names.extend(edge.to.iter().cloned());
        }
        for failure in &flow.failures {
            if let FallbackToml::Nodes(nodes) = &failure.fallback {
                names.extend(nodes.iter().cloned());
            }
        }
    }
    for flow_name in file.flows.keys() {
        names.remove(flow_name);
    }
    names
}
