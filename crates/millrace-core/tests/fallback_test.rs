//! Integration tests for failure handling: quiescence, the fallback
//! combination search, the drop marker, and the terminal no-fallback
//! error.

use serde_json::json;
use uuid::Uuid;

use millrace_core::{
    Dispatcher, Fallback, FlowRegistry, FlowSnapshot, Node, Parent, ParentValue, RetryPolicy,
    StoragePool, TickOutcome, error_is_terminal,
};
use millrace_test_utils::{ManualQueue, single_flow, task_edge};

// ===========================================================================
// Helpers
// ===========================================================================

fn tick_running(dispatcher: &Dispatcher<'_>, snapshot: &FlowSnapshot) -> (FlowSnapshot, u64) {
    match dispatcher.tick(snapshot).expect("tick should succeed") {
        TickOutcome::Reenqueue { snapshot, delay } => (snapshot, delay),
        TickOutcome::Finished { finished_nodes } => {
            panic!("flow finished early with {finished_nodes:?}")
        }
    }
}

/// Register a fallback for a combination of failed names on an existing
/// single-flow registry.
fn with_fallback(mut registry: FlowRegistry, combination: &[&str], fallback: Fallback) -> FlowRegistry {
    let mut config = registry.flow("flow1").unwrap().clone();
    let names: Vec<String> = combination.iter().map(|name| name.to_string()).collect();
    config.failures.insert(&names, fallback);
    registry.insert("flow1", config);
    registry
}

// ===========================================================================
// No fallback: terminal failure
// ===========================================================================

#[test]
fn failure_without_fallback_raises_flow_error() {
    let registry = single_flow(
        "flow1",
        vec![task_edge(&["T1"], &["T2"]), task_edge(&[], &["T1"])],
    );
    let queue = ManualQueue::new();
    let storage = StoragePool::new();
    let dispatcher = Dispatcher::new(&registry, &queue, &storage, RetryPolicy::default());

    let snapshot = dispatcher.start("flow1", None, Parent::new()).unwrap();
    let (snapshot, _) = tick_running(&dispatcher, &snapshot);
    let t1 = queue.only_scheduled("T1");

    queue.set_failed(t1.id, json!("boom"));
    let err = dispatcher.tick(&snapshot).unwrap_err();
    assert!(error_is_terminal(&err));
    assert!(err.to_string().contains("no fallback for failure"));
    assert!(err.to_string().contains("T1"));
}

//  Recovery waits for quiescence: a failure with other nodes still in
//  flight does not trigger the fallback search.
#[test]
fn fallback_search_waits_for_active_nodes_to_settle() {
    let registry = single_flow(
        "flow1",
        vec![task_edge(&["B"], &["C"]), task_edge(&[], &["A", "B"])],
    );
    let queue = ManualQueue::new();
    let storage = StoragePool::new();
    let dispatcher = Dispatcher::new(&registry, &queue, &storage, RetryPolicy::default());

    let snapshot = dispatcher.start("flow1", None, Parent::new()).unwrap();
    let (snapshot, _) = tick_running(&dispatcher, &snapshot);
    let a = queue.only_scheduled("A");
    let b = queue.only_scheduled("B");

    // A fails while B is still pending: no error yet.
    queue.set_failed(a.id, json!("boom"));
    let (snapshot, _) = tick_running(&dispatcher, &snapshot);
    assert_eq!(snapshot.failed_nodes["A"], vec![a.id]);

    // B settles: the flow is quiesced with a failure and no fallback.
    // The failure verdict lands before B's own edge gets to fire.
    queue.set_finished(b.id, json!(null));
    let err = dispatcher.tick(&snapshot).unwrap_err();
    assert!(error_is_terminal(&err));
    assert!(queue.scheduled_named("C").is_empty());
}

// ===========================================================================
// Sequence fallbacks
// ===========================================================================

#[test]
fn fallback_schedules_recovery_with_failed_id_as_parent() {
    let registry = with_fallback(
        single_flow(
            "flow1",
            vec![task_edge(&["T1"], &["T2"]), task_edge(&[], &["T1"])],
        ),
        &["T1"],
        Fallback::Run(vec![Node::task("Recover")]),
    );
    let queue = ManualQueue::new();
    let storage = StoragePool::new();
    let dispatcher = Dispatcher::new(&registry, &queue, &storage, RetryPolicy::default());

    let snapshot = dispatcher.start("flow1", None, Parent::new()).unwrap();
    let (snapshot, _) = tick_running(&dispatcher, &snapshot);
    let t1 = queue.only_scheduled("T1");

    queue.set_failed(t1.id, json!("boom"));
    let (snapshot, delay) = tick_running(&dispatcher, &snapshot);
    assert_eq!(delay, RetryPolicy::default().start_retry);

    let recover = queue.only_scheduled("Recover");
    assert_eq!(
        recover.parent.as_ref().unwrap()["T1"],
        ParentValue::Id(t1.id)
    );
    // The failure record was consumed.
    assert!(snapshot.failed_nodes.is_empty());

    // The fallback finishing completes the flow.
    queue.set_finished(recover.id, json!(null));
    match dispatcher.tick(&snapshot).unwrap() {
        TickOutcome::Finished { finished_nodes } => {
            assert_eq!(finished_nodes["Recover"], vec![recover.id]);
        }
        other => panic!("expected flow to finish, got {other:?}"),
    }
}

//  The most specific fallback wins: with A and B both failed, the
//  two-name combination is matched before either single-name one.
#[test]
fn larger_failure_combinations_win_over_smaller() {
    let registry = with_fallback(
        with_fallback(
            single_flow("flow1", vec![task_edge(&[], &["A", "B"])]),
            &["A"],
            Fallback::Run(vec![Node::task("RecoverA")]),
        ),
        &["A", "B"],
        Fallback::Run(vec![Node::task("RecoverBoth")]),
    );
    let queue = ManualQueue::new();
    let storage = StoragePool::new();
    let dispatcher = Dispatcher::new(&registry, &queue, &storage, RetryPolicy::default());

    let snapshot = dispatcher.start("flow1", None, Parent::new()).unwrap();
    let (snapshot, _) = tick_running(&dispatcher, &snapshot);
    let a = queue.only_scheduled("A");
    let b = queue.only_scheduled("B");

    queue.set_failed(a.id, json!("a boom"));
    queue.set_failed(b.id, json!("b boom"));
    let (snapshot, _) = tick_running(&dispatcher, &snapshot);

    let recover = queue.only_scheduled("RecoverBoth");
    assert!(queue.scheduled_named("RecoverA").is_empty());
    let parent = recover.parent.as_ref().unwrap();
    assert_eq!(parent["A"], ParentValue::Id(a.id));
    assert_eq!(parent["B"], ParentValue::Id(b.id));
    assert!(snapshot.failed_nodes.is_empty());
}

//  A matched sequence fallback ends the pass immediately: remaining
//  failures wait for the fallback to finish before being evaluated.
#[test]
fn sequence_fallback_returns_immediately_leaving_other_failures() {
    let registry = with_fallback(
        with_fallback(
            single_flow("flow1", vec![task_edge(&[], &["A", "B"])]),
            &["A"],
            Fallback::Run(vec![Node::task("RecoverA")]),
        ),
        &["B"],
        Fallback::Run(vec![Node::task("RecoverB")]),
    );
    let queue = ManualQueue::new();
    let storage = StoragePool::new();
    let dispatcher = Dispatcher::new(&registry, &queue, &storage, RetryPolicy::default());

    let snapshot = dispatcher.start("flow1", None, Parent::new()).unwrap();
    let (snapshot, _) = tick_running(&dispatcher, &snapshot);
    let a = queue.only_scheduled("A");
    let b = queue.only_scheduled("B");

    queue.set_failed(a.id, json!("a boom"));
    queue.set_failed(b.id, json!("b boom"));
    let (snapshot, _) = tick_running(&dispatcher, &snapshot);

    // Alphabetical order: A's fallback runs first, B's failure is still
    // on the books.
    let recover_a = queue.only_scheduled("RecoverA");
    assert!(queue.scheduled_named("RecoverB").is_empty());
    assert_eq!(snapshot.failed_nodes["B"], vec![b.id]);

    // Once RecoverA settles, the next quiesced tick evaluates B.
    queue.set_finished(recover_a.id, json!(null));
    let (snapshot, _) = tick_running(&dispatcher, &snapshot);
    let recover_b = queue.only_scheduled("RecoverB");
    assert_eq!(
        recover_b.parent.as_ref().unwrap()["B"],
        ParentValue::Id(b.id)
    );
    assert!(snapshot.failed_nodes.is_empty());
}

//  Failure ids are consumed oldest-first when the same node failed more
//  than once.
#[test]
fn repeated_failures_are_consumed_in_order() {
    let registry = with_fallback(
        single_flow("flow1", vec![task_edge(&[], &["A"])]),
        &["A"],
        Fallback::Run(vec![Node::task("Recover")]),
    );
    let queue = ManualQueue::new();
    let storage = StoragePool::new();
    let dispatcher = Dispatcher::new(&registry, &queue, &storage, RetryPolicy::default());

    let a1 = Uuid::new_v4();
    let a2 = Uuid::new_v4();
    let mut snapshot = FlowSnapshot::new("flow1", None, Parent::new());
    snapshot.failed_nodes.insert("A".to_string(), vec![a1, a2]);
    snapshot.waiting_edges.insert(0);
    snapshot.retry = Some(2);

    let (snapshot, _) = tick_running(&dispatcher, &snapshot);
    let first = queue.only_scheduled("Recover");
    assert_eq!(first.parent.as_ref().unwrap()["A"], ParentValue::Id(a1));
    assert_eq!(snapshot.failed_nodes["A"], vec![a2]);

    queue.set_finished(first.id, json!(null));
    let (snapshot, _) = tick_running(&dispatcher, &snapshot);
    let recovers = queue.scheduled_named("Recover");
    assert_eq!(recovers.len(), 2);
    assert_eq!(
        recovers[1].parent.as_ref().unwrap()["A"],
        ParentValue::Id(a2)
    );
    assert!(snapshot.failed_nodes.is_empty());
}

// ===========================================================================
// Drop marker
// ===========================================================================

//  A drop fallback consumes the failure without scheduling; the flow can
//  then terminate cleanly.
#[test]
fn drop_marker_consumes_failure_and_flow_finishes() {
    let registry = with_fallback(
        single_flow(
            "flow1",
            vec![task_edge(&["T1"], &["T2"]), task_edge(&[], &["T1"])],
        ),
        &["T1"],
        Fallback::Drop,
    );
    let queue = ManualQueue::new();
    let storage = StoragePool::new();
    let dispatcher = Dispatcher::new(&registry, &queue, &storage, RetryPolicy::default());

    let snapshot = dispatcher.start("flow1", None, Parent::new()).unwrap();
    let (snapshot, _) = tick_running(&dispatcher, &snapshot);
    let t1 = queue.only_scheduled("T1");

    queue.set_failed(t1.id, json!("boom"));
    match dispatcher.tick(&snapshot).unwrap() {
        TickOutcome::Finished { finished_nodes } => {
            assert!(finished_nodes.is_empty());
        }
        other => panic!("expected flow to finish after drop, got {other:?}"),
    }
    // Nothing beyond T1 was ever scheduled.
    assert_eq!(queue.scheduled().len(), 1);
}

//  Drop matches keep the search going: a drop on A followed by a
//  sequence fallback on B, in one pass.
#[test]
fn drop_then_sequence_in_single_pass() {
    let registry = with_fallback(
        with_fallback(
            single_flow("flow1", vec![task_edge(&[], &["A", "B"])]),
            &["A"],
            Fallback::Drop,
        ),
        &["B"],
        Fallback::Run(vec![Node::task("RecoverB")]),
    );
    let queue = ManualQueue::new();
    let storage = StoragePool::new();
    let dispatcher = Dispatcher::new(&registry, &queue, &storage, RetryPolicy::default());

    let snapshot = dispatcher.start("flow1", None, Parent::new()).unwrap();
    let (snapshot, _) = tick_running(&dispatcher, &snapshot);
    let a = queue.only_scheduled("A");
    let b = queue.only_scheduled("B");

    queue.set_failed(a.id, json!("a boom"));
    queue.set_failed(b.id, json!("b boom"));
    let (snapshot, _) = tick_running(&dispatcher, &snapshot);

    // A was dropped, B's fallback scheduled, all in the same pass.
    let recover_b = queue.only_scheduled("RecoverB");
    assert_eq!(
        recover_b.parent.as_ref().unwrap()["B"],
        ParentValue::Id(b.id)
    );
    assert!(snapshot.failed_nodes.is_empty());
}
