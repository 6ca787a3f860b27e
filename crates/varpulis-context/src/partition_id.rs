//! Partition id allocation scoped to one nested context instance.

use crate::controller::PartitionId;
use std::collections::{BTreeSet, VecDeque};

/// Monotonic partition id generator with explicit registration.
///
/// Ids are "in use" from assignment until [`remove`](Self::remove). Ids can
/// also be registered from outside ([`add`](Self::add)) when a partition is
/// recovered or replayed with a known id; the generator skips those. When
/// reuse is enabled, released ids are handed out again before fresh ones.
#[derive(Debug, Default)]
pub struct PartitionIdAllocator {
    next: PartitionId,
    in_use: BTreeSet<PartitionId>,
    released: VecDeque<PartitionId>,
    reuse: bool,
}

impl PartitionIdAllocator {
    pub fn new(reuse: bool) -> Self {
        Self {
            reuse,
            ..Self::default()
        }
    }

    /// Assign the next free id and mark it in use.
    pub fn allocate(&mut self) -> PartitionId {
        if self.reuse {
            while let Some(id) = self.released.pop_front() {
                if self.in_use.insert(id) {
                    return id;
                }
            }
        }
        loop {
            let id = self.next;
            self.next = self.next.wrapping_add(1);
            if self.in_use.insert(id) {
                return id;
            }
        }
    }

    /// Register an externally supplied id. Returns `false` if it is already in use.
    pub fn add(&mut self, id: PartitionId) -> bool {
        self.in_use.insert(id)
    }

    /// Release an id. Returns `false` if it was not in use.
    pub fn remove(&mut self, id: PartitionId) -> bool {
        let removed = self.in_use.remove(&id);
        if removed && self.reuse {
            self.released.push_back(id);
        }
        removed
    }

    pub fn contains(&self, id: PartitionId) -> bool {
        self.in_use.contains(&id)
    }

    /// Ids currently in use, ascending.
    pub fn ids(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.in_use.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.in_use.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_use.is_empty()
    }

    /// Release every id and restart numbering.
    pub fn clear(&mut self) {
        self.in_use.clear();
        self.released.clear();
        self.next = 0;
    }
}
