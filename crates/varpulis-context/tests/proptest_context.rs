//! Property-based tests for nested contexts.
//!
//! Covers: tree/allocator consistency under arbitrary event and termination
//! sequences, and one-partition-per-key-path for keyed nesting.

mod common;

use common::{bean, keyed, statement, RecordingRuntime};
use proptest::prelude::*;
use std::collections::BTreeSet;
use varpulis_context::{NestedContextManager, PartitionKey, PartitionLifecycle, Value};

#[derive(Debug, Clone)]
enum Op {
    Event(u8, u8),
    TerminateOuter(u8),
    TerminateLeaf(u8, u8),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..4, 0u8..4).prop_map(|(s, i)| Op::Event(s, i)),
        1 => (0u8..4).prop_map(Op::TerminateOuter),
        1 => (0u8..4, 0u8..4).prop_map(|(s, i)| Op::TerminateLeaf(s, i)),
    ]
}

fn outer(s: u8) -> PartitionKey {
    PartitionKey::Keyed(vec![Value::from(format!("E{}", s))])
}

fn inner(i: u8) -> PartitionKey {
    PartitionKey::Keyed(vec![Value::Int(i as i64)])
}

proptest! {
    /// Whatever happens, live partitions match the distinct key paths seen
    /// since their branch was last terminated, and tree and allocator agree.
    #[test]
    fn prop_tree_tracks_live_key_paths(ops in prop::collection::vec(arb_op(), 1..80), reuse in any::<bool>()) {
        let mut mgr = NestedContextManager::new(
            "ctx",
            vec![keyed("segByString", "theString"), keyed("segByInt", "intPrimitive")],
            RecordingRuntime::new(),
        )
        .unwrap()
        .with_options(varpulis_context::ManagerConfig {
            reuse_partition_ids: reuse,
            ..Default::default()
        });
        mgr.add_statement(statement(1, "s0")).unwrap();

        let mut live: BTreeSet<(u8, u8)> = BTreeSet::new();
        for op in ops {
            match op {
                Op::Event(s, i) => {
                    mgr.process_event(&bean(&format!("E{}", s), i as i64)).unwrap();
                    live.insert((s, i));
                }
                Op::TerminateOuter(s) => {
                    if let Some(handle) = mgr.find_handle(&[outer(s)]) {
                        mgr.terminate(&handle, None).unwrap();
                    }
                    live.retain(|(ls, _)| *ls != s);
                }
                Op::TerminateLeaf(s, i) => {
                    if let Some(handle) = mgr.find_handle(&[outer(s), inner(i)]) {
                        mgr.terminate(&handle, None).unwrap();
                    }
                    live.remove(&(s, i));
                }
            }
            prop_assert!(mgr.is_consistent());
            prop_assert_eq!(mgr.partition_count(), live.len());
        }

        for (s, i) in &live {
            prop_assert!(mgr.find_handle(&[outer(*s), inner(*i)]).is_some());
        }
    }
}
