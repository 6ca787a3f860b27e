//! Thread-safe handle to one nested context instance.

use crate::controller::{
    ExternalState, InstanceHandle, PartitionId, PartitionKey, PartitionLifecycle, PropertyMap,
};
use crate::error::Result;
use crate::event::SharedEvent;
use crate::manager::NestedContextManager;
use crate::selector::ContextPartitionSelector;
use crate::statement::{StatementDescriptor, StatementId};
use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};

/// A [`NestedContextManager`] behind one exclusive lock. Every operation,
/// including any re-entrant instantiation it causes, runs under that lock.
#[derive(Debug, Clone)]
pub struct SharedContextManager {
    inner: Arc<Mutex<NestedContextManager>>,
}

impl SharedContextManager {
    pub fn new(manager: NestedContextManager) -> Self {
        Self {
            inner: Arc::new(Mutex::new(manager)),
        }
    }

    /// Lock the manager, recovering the guard if a holder panicked.
    pub fn lock(&self) -> MutexGuard<'_, NestedContextManager> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_statement(&self, statement: Arc<StatementDescriptor>) -> Result<()> {
        self.lock().add_statement(statement)
    }

    pub fn destroy_statement(&self, name: &str, id: StatementId) -> Result<()> {
        self.lock().destroy_statement(name, id)
    }

    pub fn process_event(&self, event: &SharedEvent) -> Result<()> {
        self.lock().process_event(event)
    }

    pub fn advance_time(&self, now_ms: i64) -> Result<()> {
        self.lock().advance_time(now_ms)
    }

    pub fn set_context_partition_range(&self, level: usize, ranges: &[Range<i64>]) -> Result<()> {
        self.lock().set_context_partition_range(level, ranges)
    }

    pub fn terminate(&self, handle: &InstanceHandle, properties: Option<&PropertyMap>) -> Result<()> {
        self.lock().terminate(handle, properties)
    }

    pub fn find_handle(&self, keys: &[PartitionKey]) -> Option<InstanceHandle> {
        self.lock().find_handle(keys)
    }

    pub fn selected_partition_ids(
        &self,
        selector: &ContextPartitionSelector,
    ) -> Result<BTreeSet<PartitionId>> {
        self.lock().selected_partition_ids(selector)
    }

    /// Rows of a statement, copied out under the lock.
    pub fn safe_iterator(
        &self,
        statement: StatementId,
        selector: Option<&ContextPartitionSelector>,
    ) -> Result<std::vec::IntoIter<SharedEvent>> {
        self.lock().safe_iterator(statement, selector)
    }

    pub fn partition_count(&self) -> usize {
        self.lock().partition_count()
    }

    pub fn export_state(&self) -> ExternalState {
        self.lock().export_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{ControllerFactory, KeyedFactory, KeyedItem};
    use crate::event::Event;
    use crate::filter::FilterSpec;
    use crate::statement::CollectingRuntime;
    use std::thread;

    #[test]
    fn test_concurrent_events_share_one_tree() {
        let factories: Vec<Arc<dyn ControllerFactory>> = vec![Arc::new(
            KeyedFactory::new("seg", vec![KeyedItem::new("SupportBean", ["theString"])]).unwrap(),
        )];
        let manager =
            NestedContextManager::new("ctx", factories, Arc::new(CollectingRuntime)).unwrap();
        let shared = SharedContextManager::new(manager);
        let stmt = Arc::new(
            StatementDescriptor::new(1, "s0").with_filter(FilterSpec::new("SupportBean").shared()),
        );
        shared.add_statement(Arc::clone(&stmt)).unwrap();

        let workers: Vec<_> = (0..4)
            .map(|t| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        let event = Event::new("SupportBean")
                            .with_field("theString", format!("K{}", (t * 25 + i) % 10))
                            .into_shared();
                        shared.process_event(&event).unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(shared.partition_count(), 10);
        assert_eq!(shared.safe_iterator(stmt.id, None).unwrap().count(), 100);
        assert!(shared.lock().is_consistent());
    }
}
