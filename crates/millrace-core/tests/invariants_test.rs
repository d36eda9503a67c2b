//! Property tests over generated two-layer edge tables.
//!
//! For arbitrary fan-in DAGs driven to completion in arbitrary finish
//! orders, after every tick:
//! - per node name, active / finished / failed id sets are disjoint;
//! - the re-enqueue delay stays within the policy bounds;
//! - armed edges stay armed and are bounded by the edge count;
//! - the snapshot survives a serde round-trip unchanged;
//! - a join target is only scheduled once every source has finished, and
//!   its parent map names exactly its sources.

use std::collections::{BTreeSet, HashSet};

use proptest::prelude::*;
use serde_json::json;
use uuid::Uuid;

use millrace_core::{
    Dispatcher, FlowSnapshot, Parent, ParentValue, RetryPolicy, StoragePool, TickOutcome,
};
use millrace_test_utils::{ManualQueue, single_flow, task_edge};

/// Layer-two sources: for each B task, the indices of the A tasks it
/// joins on. Plus a seed list deciding the finish order.
fn dag_strategy() -> impl Strategy<Value = (usize, Vec<Vec<usize>>, Vec<usize>)> {
    (1usize..=4).prop_flat_map(|n_sources| {
        let subset = prop::collection::vec(any::<bool>(), n_sources).prop_map(|mask| {
            let mut subset: Vec<usize> = mask
                .iter()
                .enumerate()
                .filter(|(_, keep)| **keep)
                .map(|(idx, _)| idx)
                .collect();
            if subset.is_empty() {
                subset.push(0);
            }
            subset
        });
        (
            Just(n_sources),
            prop::collection::vec(subset, 0..=3),
            prop::collection::vec(0usize..1000, 1..=40),
        )
    })
}

fn source_name(idx: usize) -> String {
    format!("A{idx}")
}

fn join_name(idx: usize) -> String {
    format!("B{idx}")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn generated_dags_uphold_tick_invariants(
        (n_sources, joins, seeds) in dag_strategy()
    ) {
        let sources: Vec<String> = (0..n_sources).map(source_name).collect();
        let source_refs: Vec<&str> = sources.iter().map(String::as_str).collect();

        // Edge 0 is the start edge into every source task.
        let mut edges = vec![task_edge(&[], &source_refs)];
        for (join_idx, join_sources) in joins.iter().enumerate() {
            let from: Vec<String> = join_sources.iter().map(|&idx| source_name(idx)).collect();
            let from_refs: Vec<&str> = from.iter().map(String::as_str).collect();
            let to = join_name(join_idx);
            edges.push(task_edge(&from_refs, &[to.as_str()]));
        }
        let edge_count = edges.len();

        let registry = single_flow("flow1", edges);
        let queue = ManualQueue::new();
        let storage = StoragePool::new();
        let policy = RetryPolicy::default();
        let dispatcher = Dispatcher::new(&registry, &queue, &storage, policy);

        let mut snapshot = dispatcher.start("flow1", None, Parent::new()).unwrap();
        let mut finished_ids: HashSet<Uuid> = HashSet::new();
        let mut prev_waiting: BTreeSet<usize> = BTreeSet::new();
        let mut seed_cursor = 0usize;

        let final_nodes = loop {
            prop_assert!(seed_cursor < 200, "flow did not terminate");

            match dispatcher.tick(&snapshot).unwrap() {
                TickOutcome::Finished { finished_nodes } => break finished_nodes,
                TickOutcome::Reenqueue { snapshot: next, delay } => {
                    // Delay bounds.
                    prop_assert!(delay >= policy.start_retry && delay <= policy.max_retry);
                    prop_assert_eq!(next.retry, Some(delay));

                    // Disjointness per node name.
                    for (name, ids) in &next.finished_nodes {
                        for id in ids {
                            prop_assert!(!next.active_nodes.iter().any(|a| a.id == *id),
                                "{} id {} both finished and active", name, id);
                            if let Some(failed) = next.failed_nodes.get(name) {
                                prop_assert!(!failed.contains(id));
                            }
                        }
                    }

                    // Armed edges only grow, bounded by the table size.
                    prop_assert!(next.waiting_edges.is_superset(&prev_waiting));
                    prop_assert!(next.waiting_edges.iter().all(|&idx| idx < edge_count));
                    prev_waiting = next.waiting_edges.clone();

                    // Wire round-trip is lossless.
                    let wire = serde_json::to_string(&next).unwrap();
                    let rehydrated: FlowSnapshot = serde_json::from_str(&wire).unwrap();
                    prop_assert_eq!(&next, &rehydrated);
                    snapshot = rehydrated;

                    // Finish one pending node, if any, picked by seed.
                    let pending: Vec<Uuid> = queue
                        .scheduled()
                        .iter()
                        .map(|node| node.id)
                        .filter(|id| !finished_ids.contains(id))
                        .collect();
                    if !pending.is_empty() {
                        let seed = seeds[seed_cursor % seeds.len()];
                        let id = pending[seed % pending.len()];
                        queue.set_finished(id, json!(seed));
                        finished_ids.insert(id);
                    }
                    seed_cursor += 1;
                }
            }
        };

        // Every source ran exactly once.
        for source in &sources {
            prop_assert_eq!(final_nodes[source.as_str()].len(), 1);
        }

        // Every join target ran once per edge naming it, and each
        // scheduled join carried exactly its sources as parents, with
        // ids that were finished source runs.
        for (join_idx, join_sources) in joins.iter().enumerate() {
            let name = join_name(join_idx);
            let instances = queue.scheduled_named(&name);
            prop_assert_eq!(instances.len(), 1, "join {} instances", name);

            let parent = instances[0].parent.as_ref().unwrap();
            let expected: HashSet<String> =
                join_sources.iter().map(|&idx| source_name(idx)).collect();
            let got: HashSet<String> = parent.keys().cloned().collect();
            prop_assert_eq!(&got, &expected);

            for (source, value) in parent {
                match value {
                    ParentValue::Id(id) => {
                        prop_assert!(final_nodes[source.as_str()].contains(id),
                            "parent id of {} is not a finished {} run", name, source);
                    }
                    other => prop_assert!(false, "unexpected parent value {:?}", other),
                }
            }
        }
    }
}
