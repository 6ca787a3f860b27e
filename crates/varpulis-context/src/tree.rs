//! Arena of controller tree entries.

use crate::controller::{
    ContextController, ControllerId, PartitionId, PartitionKey, PathId, PropertyMap,
};
use crate::error::{ContextError, Result};
use crate::statement::AgentInstance;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, VecDeque};

/// A live leaf partition: its key, the properties captured at creation, and
/// one agent instance per registered statement in registration order.
#[derive(Debug)]
pub(crate) struct RunningInstance {
    pub generation: u64,
    pub key: PartitionKey,
    pub properties: PropertyMap,
    pub agents: Vec<AgentInstance>,
}

/// Bookkeeping for one live controller.
pub(crate) struct TreeEntry {
    /// `None` while the controller is lent out to run a callback
    pub controller: Option<Box<dyn ContextController>>,
    pub parent: Option<ControllerId>,
    pub path_id: PathId,
    pub level: usize,
    /// Key under which the parent created this branch (`None` for the root)
    pub partition_key: Option<PartitionKey>,
    pub context_properties: PropertyMap,
    pub children: BTreeMap<PathId, ControllerId>,
    /// Leaf level only
    pub instances: BTreeMap<PartitionId, RunningInstance>,
}

impl TreeEntry {
    pub fn root(controller: Box<dyn ContextController>) -> Self {
        Self {
            controller: Some(controller),
            parent: None,
            path_id: 0,
            level: 1,
            partition_key: None,
            context_properties: PropertyMap::new(),
            children: BTreeMap::new(),
            instances: BTreeMap::new(),
        }
    }

    pub fn branch(
        controller: Box<dyn ContextController>,
        parent: ControllerId,
        path_id: PathId,
        level: usize,
        partition_key: PartitionKey,
        context_properties: PropertyMap,
    ) -> Self {
        Self {
            controller: Some(controller),
            parent: Some(parent),
            path_id,
            level,
            partition_key: Some(partition_key),
            context_properties,
            children: BTreeMap::new(),
            instances: BTreeMap::new(),
        }
    }
}

#[derive(Default)]
pub(crate) struct ControllerTree {
    entries: FxHashMap<ControllerId, TreeEntry>,
    root: Option<ControllerId>,
    next_id: u64,
}

impl ControllerTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh controller id. Ids are never reused within one tree.
    pub fn next_id(&mut self) -> ControllerId {
        let id = ControllerId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn root(&self) -> Option<ControllerId> {
        self.root
    }

    pub fn insert_root(&mut self, id: ControllerId, entry: TreeEntry) {
        self.entries.insert(id, entry);
        self.root = Some(id);
    }

    /// Insert a child entry and link it under its parent.
    pub fn insert_child(&mut self, id: ControllerId, entry: TreeEntry) -> Result<()> {
        let parent_id = entry
            .parent
            .ok_or_else(|| ContextError::InvalidDeclaration(format!("{} has no parent", id)))?;
        let parent = self
            .entries
            .get_mut(&parent_id)
            .ok_or(ContextError::UnknownController(parent_id))?;
        if parent.children.contains_key(&entry.path_id) {
            return Err(ContextError::PathInUse {
                controller: parent_id,
                path_id: entry.path_id,
            });
        }
        parent.children.insert(entry.path_id, id);
        self.entries.insert(id, entry);
        Ok(())
    }

    pub fn get(&self, id: ControllerId) -> Option<&TreeEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: ControllerId) -> Option<&mut TreeEntry> {
        self.entries.get_mut(&id)
    }

    /// Remove one entry and unlink it from its parent. Children are not
    /// touched; remove them first (see [`subtree`](Self::subtree)).
    pub fn remove(&mut self, id: ControllerId) -> Option<TreeEntry> {
        let entry = self.entries.remove(&id)?;
        match entry.parent {
            Some(parent_id) => {
                if let Some(parent) = self.entries.get_mut(&parent_id) {
                    if parent.children.get(&entry.path_id) == Some(&id) {
                        parent.children.remove(&entry.path_id);
                    }
                }
            }
            None => {
                if self.root == Some(id) {
                    self.root = None;
                }
            }
        }
        Some(entry)
    }

    /// Take a controller out of its entry for the duration of a callback.
    pub fn lend(&mut self, id: ControllerId) -> Option<Box<dyn ContextController>> {
        self.entries.get_mut(&id)?.controller.take()
    }

    /// Put a lent controller back. Hands it back if its entry was removed
    /// while it was out.
    pub fn restore(
        &mut self,
        id: ControllerId,
        controller: Box<dyn ContextController>,
    ) -> std::result::Result<(), Box<dyn ContextController>> {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.controller = Some(controller);
                Ok(())
            }
            None => Err(controller),
        }
    }

    /// `id` and all its descendants, children before parents.
    pub fn subtree(&self, id: ControllerId) -> Vec<ControllerId> {
        let mut out = Vec::new();
        self.collect_post_order(id, &mut out);
        out
    }

    fn collect_post_order(&self, id: ControllerId, out: &mut Vec<ControllerId>) {
        if let Some(entry) = self.entries.get(&id) {
            for child in entry.children.values() {
                self.collect_post_order(*child, out);
            }
            out.push(id);
        }
    }

    /// Every controller, breadth-first from the root, siblings by path id.
    pub fn ids_top_down(&self) -> Vec<ControllerId> {
        let mut out = Vec::with_capacity(self.entries.len());
        let mut queue: VecDeque<ControllerId> = self.root.into_iter().collect();
        while let Some(id) = queue.pop_front() {
            if let Some(entry) = self.entries.get(&id) {
                out.push(id);
                queue.extend(entry.children.values().copied());
            }
        }
        out
    }

    pub fn ids_at_level(&self, level: usize) -> Vec<ControllerId> {
        self.ids_top_down()
            .into_iter()
            .filter(|id| self.entries.get(id).is_some_and(|e| e.level == level))
            .collect()
    }

    /// `(leaf controller, partition id)` for every running partition, in
    /// tree order.
    pub fn leaf_partitions(&self) -> Vec<(ControllerId, PartitionId)> {
        self.ids_top_down()
            .into_iter()
            .filter_map(|id| self.entries.get(&id).map(|e| (id, e)))
            .flat_map(|(id, e)| e.instances.keys().map(move |pid| (id, *pid)))
            .collect()
    }

    /// Every running partition record, in tree order.
    pub fn records(&self) -> impl Iterator<Item = (PartitionId, &RunningInstance)> + '_ {
        self.ids_top_down()
            .into_iter()
            .filter_map(move |id| self.entries.get(&id))
            .flat_map(|e| e.instances.iter().map(|(pid, r)| (*pid, r)))
    }

    /// `id` followed by each of its ancestors up to the root.
    pub fn ancestry(&self, id: ControllerId) -> Vec<ControllerId> {
        let mut out = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            match self.entries.get(&current) {
                Some(entry) => {
                    out.push(current);
                    cursor = entry.parent;
                }
                None => break,
            }
        }
        out
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.root = None;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Every entry is reachable from the root, every non-root entry's parent
    /// links back to it, and levels increase by one per edge.
    pub fn is_consistent(&self) -> bool {
        let reachable = self.ids_top_down();
        if reachable.len() != self.entries.len() {
            return false;
        }
        self.entries.iter().all(|(id, entry)| match entry.parent {
            None => self.root == Some(*id) && entry.level == 1,
            Some(parent_id) => self.entries.get(&parent_id).is_some_and(|parent| {
                parent.children.get(&entry.path_id) == Some(id) && parent.level + 1 == entry.level
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{
        Activation, ContextController, ControllerFactory, InstanceHandle, PartitionLifecycle,
    };
    use crate::controller::{CategoryFactory, CategoryItem};
    use crate::event::SharedEvent;
    use crate::selector::ContextPartitionSelector;
    use std::sync::Arc;

    /// Controller that does nothing; the tree never calls into it.
    struct Inert {
        id: ControllerId,
        factory: Arc<dyn ControllerFactory>,
    }

    impl ContextController for Inert {
        fn id(&self) -> ControllerId {
            self.id
        }
        fn path_id(&self) -> PathId {
            0
        }
        fn nesting_level(&self) -> usize {
            1
        }
        fn factory(&self) -> Arc<dyn ControllerFactory> {
            Arc::clone(&self.factory)
        }
        fn activate(&mut self, _: &mut dyn PartitionLifecycle, _: Activation<'_>) -> Result<()> {
            Ok(())
        }
        fn deactivate(&mut self) {}
        fn on_event(
            &mut self,
            _: &mut dyn PartitionLifecycle,
            _: &SharedEvent,
        ) -> Result<Vec<InstanceHandle>> {
            Ok(Vec::new())
        }
        fn select(&self, _: &ContextPartitionSelector) -> Result<Vec<u32>> {
            Ok(Vec::new())
        }
        fn child_terminated(&mut self, _: &InstanceHandle) {}
    }

    fn inert(id: ControllerId) -> Box<dyn ContextController> {
        let factory: Arc<dyn ControllerFactory> = Arc::new(
            CategoryFactory::new("c", "T", vec![CategoryItem::new("a", Vec::new())]).unwrap(),
        );
        Box::new(Inert { id, factory })
    }

    fn branch(tree: &mut ControllerTree, parent: ControllerId, path_id: PathId) -> ControllerId {
        let level = tree.get(parent).unwrap().level + 1;
        let id = tree.next_id();
        tree.insert_child(
            id,
            TreeEntry::branch(
                inert(id),
                parent,
                path_id,
                level,
                PartitionKey::Hash(path_id as i64),
                PropertyMap::new(),
            ),
        )
        .unwrap();
        id
    }

    #[test]
    fn test_insert_and_remove_keep_links() {
        let mut tree = ControllerTree::new();
        let root = tree.next_id();
        tree.insert_root(root, TreeEntry::root(inert(root)));
        let a = branch(&mut tree, root, 0);
        let b = branch(&mut tree, root, 1);
        let a1 = branch(&mut tree, a, 0);
        assert!(tree.is_consistent());
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.ids_top_down(), vec![root, a, b, a1]);
        assert_eq!(tree.ids_at_level(2), vec![a, b]);
        assert_eq!(tree.ancestry(a1), vec![a1, a, root]);

        assert_eq!(tree.subtree(a), vec![a1, a]);
        for id in tree.subtree(a) {
            tree.remove(id);
        }
        assert!(tree.is_consistent());
        assert_eq!(tree.get(root).unwrap().children.len(), 1);
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let mut tree = ControllerTree::new();
        let root = tree.next_id();
        tree.insert_root(root, TreeEntry::root(inert(root)));
        branch(&mut tree, root, 3);
        let id = tree.next_id();
        let err = tree
            .insert_child(
                id,
                TreeEntry::branch(inert(id), root, 3, 2, PartitionKey::Hash(3), PropertyMap::new()),
            )
            .unwrap_err();
        assert!(matches!(err, ContextError::PathInUse { path_id: 3, .. }));
    }

    #[test]
    fn test_restore_after_removal_hands_controller_back() {
        let mut tree = ControllerTree::new();
        let root = tree.next_id();
        tree.insert_root(root, TreeEntry::root(inert(root)));
        let a = branch(&mut tree, root, 0);

        let lent = tree.lend(a).unwrap();
        assert!(tree.lend(a).is_none());
        tree.remove(a);
        assert!(tree.restore(a, lent).is_err());
    }
}
