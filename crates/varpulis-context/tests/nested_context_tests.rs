//! End-to-end tests for a two-level keyed context:
//! `context ctx context segByString partition by theString from SupportBean,
//!  context segByInt partition by intPrimitive from SupportBean`.

mod common;

use common::{bean, keyed, statement, RecordingRuntime};
use std::sync::Arc;
use varpulis_context::{
    ContextPartitionSelector, InstanceHandle, ManagerConfig, NestedContextManager, PartitionKey,
    PartitionLifecycle, Value,
};

fn manager(runtime: Arc<RecordingRuntime>) -> NestedContextManager {
    NestedContextManager::new(
        "ctx",
        vec![keyed("segByString", "theString"), keyed("segByInt", "intPrimitive")],
        runtime,
    )
    .unwrap()
}

fn key(v: impl Into<Value>) -> PartitionKey {
    PartitionKey::Keyed(vec![v.into()])
}

// ==========================================================================
// Partition creation
// ==========================================================================

#[test]
fn test_first_statement_activates_root_only() {
    let runtime = RecordingRuntime::new();
    let mut mgr = manager(runtime.clone());
    assert!(!mgr.is_active());

    mgr.add_statement(statement(1, "s0")).unwrap();
    assert!(mgr.is_active());
    assert_eq!(mgr.tree_size(), 1);
    assert_eq!(mgr.partition_count(), 0);
    assert!(runtime.started().is_empty());
}

#[test]
fn test_events_create_one_leaf_per_key_pair() {
    let runtime = RecordingRuntime::new();
    let mut mgr = manager(runtime.clone());
    let s0 = statement(1, "s0");
    mgr.add_statement(Arc::clone(&s0)).unwrap();

    mgr.process_event(&bean("E1", 1)).unwrap();
    mgr.process_event(&bean("E1", 2)).unwrap();
    mgr.process_event(&bean("E2", 1)).unwrap();

    assert_eq!(mgr.partition_count(), 3);
    assert_eq!(mgr.allocated_ids(), vec![0, 1, 2]);
    // root + one branch per distinct theString
    assert_eq!(mgr.tree_size(), 3);
    assert!(mgr.is_consistent());

    // every triggering event reached its own partition exactly once
    assert_eq!(mgr.safe_iterator(s0.id, None).unwrap().count(), 3);

    assert_eq!(
        runtime.addenda("s0"),
        vec![
            (0, "SupportBean(theString = \"E1\", intPrimitive = 1)".to_string()),
            (1, "SupportBean(theString = \"E1\", intPrimitive = 2)".to_string()),
            (2, "SupportBean(theString = \"E2\", intPrimitive = 1)".to_string()),
        ]
    );
    assert_eq!(
        mgr.partition_path(2),
        Some(vec![key("E2"), key(1i64)])
    );
}

#[test]
fn test_builtin_properties_expose_every_level() {
    let runtime = RecordingRuntime::new();
    let mut mgr = manager(runtime.clone());
    mgr.add_statement(statement(1, "s0")).unwrap();
    mgr.process_event(&bean("E2", 7)).unwrap();

    let props = runtime.builtin(0).unwrap();
    assert_eq!(&*props.event_type, "ContextProperties_ctx");
    assert_eq!(props.get_str("name"), Some("ctx"));
    assert_eq!(props.get_int("id"), Some(0));
    assert_eq!(
        props.get("segByString").and_then(|v| v.get("key1")),
        Some(&Value::from("E2"))
    );
    assert_eq!(
        props.get("segByInt").and_then(|v| v.get("key1")),
        Some(&Value::Int(7))
    );
}

// ==========================================================================
// Termination
// ==========================================================================

#[test]
fn test_terminating_a_branch_leaves_siblings_running() {
    let runtime = RecordingRuntime::new();
    let mut mgr = manager(runtime.clone());
    let s0 = statement(1, "s0");
    mgr.add_statement(Arc::clone(&s0)).unwrap();
    mgr.process_event(&bean("E1", 1)).unwrap();
    mgr.process_event(&bean("E1", 2)).unwrap();
    mgr.process_event(&bean("E2", 1)).unwrap();

    let handle = mgr.find_handle(&[key("E1")]).unwrap();
    assert!(matches!(handle, InstanceHandle::Branch { .. }));
    mgr.terminate(&handle, None).unwrap();

    assert_eq!(mgr.partition_count(), 1);
    assert_eq!(mgr.allocated_ids(), vec![2]);
    assert_eq!(mgr.tree_size(), 2);
    assert!(mgr.is_consistent());
    let stopped: Vec<u32> = runtime.stopped().iter().map(|s| s.partition_id).collect();
    assert_eq!(stopped, vec![0, 1]);

    // E2/1 keeps receiving events
    mgr.process_event(&bean("E2", 1)).unwrap();
    let only_e2 = ContextPartitionSelector::by_id([2]);
    assert_eq!(mgr.safe_iterator(s0.id, Some(&only_e2)).unwrap().count(), 2);

    // a terminated key comes back as a fresh partition
    mgr.process_event(&bean("E1", 1)).unwrap();
    assert_eq!(mgr.allocated_ids(), vec![2, 3]);
    assert!(mgr.is_consistent());
}

#[test]
fn test_stale_handles_are_ignored() {
    let runtime = RecordingRuntime::new();
    let mut mgr = manager(runtime.clone());
    mgr.add_statement(statement(1, "s0")).unwrap();
    mgr.process_event(&bean("E1", 1)).unwrap();

    let branch = mgr.find_handle(&[key("E1")]).unwrap();
    let leaf = mgr.find_handle(&[key("E1"), key(1i64)]).unwrap();
    assert!(matches!(leaf, InstanceHandle::Leaf { partition_id: 0, .. }));

    mgr.terminate(&leaf, None).unwrap();
    mgr.terminate(&leaf, None).unwrap();
    mgr.terminate(&branch, None).unwrap();
    mgr.terminate(&branch, None).unwrap();

    assert_eq!(runtime.stopped().len(), 1);
    assert_eq!(mgr.tree_size(), 1);
    assert!(mgr.is_consistent());
}

#[test]
fn test_stale_leaf_handle_spares_partition_reusing_its_id() {
    let runtime = RecordingRuntime::new();
    let mut mgr = manager(runtime.clone()).with_options(ManagerConfig {
        reuse_partition_ids: true,
        ..Default::default()
    });
    let s0 = statement(1, "s0");
    mgr.add_statement(Arc::clone(&s0)).unwrap();
    mgr.add_statement(statement(2, "s1")).unwrap();
    mgr.process_event(&bean("E1", 1)).unwrap();

    let first = mgr.find_handle(&[key("E1"), key(1i64)]).unwrap();
    mgr.terminate(&first, None).unwrap();
    assert_eq!(runtime.stopped().len(), 2);

    // same leaf controller, same released id
    mgr.process_event(&bean("E1", 2)).unwrap();
    let second = mgr.find_handle(&[key("E1"), key(2i64)]).unwrap();
    assert!(matches!(second, InstanceHandle::Leaf { partition_id: 0, .. }));
    assert_ne!(first, second);

    mgr.terminate(&first, None).unwrap();
    assert_eq!(mgr.allocated_ids(), vec![0]);
    assert_eq!(runtime.stopped().len(), 2);
    assert!(mgr.is_consistent());

    // trigger plus this event
    mgr.process_event(&bean("E1", 2)).unwrap();
    assert_eq!(mgr.safe_iterator(s0.id, None).unwrap().count(), 2);

    mgr.terminate(&second, None).unwrap();
    assert!(mgr.allocated_ids().is_empty());
    assert_eq!(runtime.stopped().len(), 4);
}

// ==========================================================================
// Statements
// ==========================================================================

#[test]
fn test_second_statement_joins_existing_partitions() {
    let runtime = RecordingRuntime::new();
    let mut mgr = manager(runtime.clone());
    mgr.add_statement(statement(1, "s0")).unwrap();
    mgr.process_event(&bean("E1", 1)).unwrap();
    mgr.process_event(&bean("E2", 1)).unwrap();
    let before = mgr.allocated_ids();

    let s1 = statement(2, "s1");
    mgr.add_statement(Arc::clone(&s1)).unwrap();
    assert_eq!(mgr.allocated_ids(), before);
    assert_eq!(mgr.tree_size(), 3);
    assert_eq!(runtime.addenda("s1").len(), 2);

    // s1 sees events from now on, not the triggers that preceded it
    mgr.process_event(&bean("E1", 1)).unwrap();
    assert_eq!(mgr.safe_iterator(s1.id, None).unwrap().count(), 1);
    assert_eq!(mgr.statements_in_partition(0).len(), 2);
}

#[test]
fn test_destroying_statements() {
    let runtime = RecordingRuntime::new();
    let mut mgr = manager(runtime.clone());
    let s0 = statement(1, "s0");
    let s1 = statement(2, "s1");
    mgr.add_statement(Arc::clone(&s0)).unwrap();
    mgr.add_statement(Arc::clone(&s1)).unwrap();
    mgr.process_event(&bean("E1", 1)).unwrap();
    mgr.process_event(&bean("E2", 2)).unwrap();

    mgr.destroy_statement("s1", s1.id).unwrap();
    assert_eq!(mgr.partition_count(), 2);
    assert!(runtime
        .stopped()
        .iter()
        .all(|s| s.statement == "s1" && s.statement_level));

    mgr.destroy_statement("s0", s0.id).unwrap();
    assert!(!mgr.is_active());
    assert_eq!(mgr.tree_size(), 0);
    assert!(mgr.allocated_ids().is_empty());
    assert_eq!(runtime.stopped().len(), 4);

    // attaching again starts over
    mgr.add_statement(Arc::clone(&s0)).unwrap();
    mgr.process_event(&bean("E9", 9)).unwrap();
    assert_eq!(mgr.allocated_ids(), vec![0]);
}

#[test]
fn test_iterator_borrows_rows_of_selected_partitions() {
    let runtime = RecordingRuntime::new();
    let mut mgr = manager(runtime);
    let s0 = statement(1, "s0");
    mgr.add_statement(Arc::clone(&s0)).unwrap();
    mgr.process_event(&bean("E1", 1)).unwrap();
    mgr.process_event(&bean("E2", 1)).unwrap();
    mgr.process_event(&bean("E2", 1)).unwrap();

    let selector = ContextPartitionSelector::Nested(vec![vec![
        ContextPartitionSelector::Segmented(vec![vec![Value::from("E2")]]),
        ContextPartitionSelector::All,
    ]]);
    let rows: Vec<_> = mgr.iterator(s0.id, Some(&selector)).unwrap().collect();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|e| e.get_str("theString") == Some("E2")));
}
