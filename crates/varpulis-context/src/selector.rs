//! Context partition selectors and their resolution against a live tree.

use crate::controller::{ControllerId, PartitionId, PartitionKey};
use crate::error::{ContextError, Result};
use crate::manager::NestedContextManager;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use varpulis_core::Value;

/// What a filtered selector sees of one child partition.
#[derive(Debug, Clone, Copy)]
pub struct PartitionIdentifier<'a> {
    pub key: &'a PartitionKey,
    /// Path id for a sub-branch, partition id for a leaf
    pub id: u32,
}

/// Caller-supplied predicate over partition identifiers.
#[derive(Clone)]
pub struct PartitionFilter(Arc<dyn Fn(&PartitionIdentifier<'_>) -> bool + Send + Sync>);

impl PartitionFilter {
    pub fn accepts(&self, identifier: &PartitionIdentifier<'_>) -> bool {
        (self.0)(identifier)
    }
}

/// Selects a subset of the partition tree.
#[derive(Clone)]
pub enum ContextPartitionSelector {
    All,
    /// Leaf partition ids; unknown ids are dropped silently
    ById(BTreeSet<PartitionId>),
    /// One selector per nesting level, one stack per branch of interest
    Nested(Vec<Vec<ContextPartitionSelector>>),
    Category(Vec<String>),
    Hash(Vec<i64>),
    Segmented(Vec<Vec<Value>>),
    Filtered(PartitionFilter),
}

impl ContextPartitionSelector {
    pub fn by_id(ids: impl IntoIterator<Item = PartitionId>) -> Self {
        ContextPartitionSelector::ById(ids.into_iter().collect())
    }

    pub fn category<S: Into<String>>(labels: impl IntoIterator<Item = S>) -> Self {
        ContextPartitionSelector::Category(labels.into_iter().map(Into::into).collect())
    }

    pub fn filtered<F>(predicate: F) -> Self
    where
        F: Fn(&PartitionIdentifier<'_>) -> bool + Send + Sync + 'static,
    {
        ContextPartitionSelector::Filtered(PartitionFilter(Arc::new(predicate)))
    }

    /// Short name used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ContextPartitionSelector::All => "all",
            ContextPartitionSelector::ById(_) => "by_id",
            ContextPartitionSelector::Nested(_) => "nested",
            ContextPartitionSelector::Category(_) => "category",
            ContextPartitionSelector::Hash(_) => "hash",
            ContextPartitionSelector::Segmented(_) => "segmented",
            ContextPartitionSelector::Filtered(_) => "filtered",
        }
    }
}

impl fmt::Debug for ContextPartitionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextPartitionSelector::All => write!(f, "All"),
            ContextPartitionSelector::ById(ids) => f.debug_tuple("ById").field(ids).finish(),
            ContextPartitionSelector::Nested(stacks) => {
                f.debug_tuple("Nested").field(stacks).finish()
            }
            ContextPartitionSelector::Category(labels) => {
                f.debug_tuple("Category").field(labels).finish()
            }
            ContextPartitionSelector::Hash(buckets) => {
                f.debug_tuple("Hash").field(buckets).finish()
            }
            ContextPartitionSelector::Segmented(keys) => {
                f.debug_tuple("Segmented").field(keys).finish()
            }
            ContextPartitionSelector::Filtered(_) => write!(f, "Filtered(..)"),
        }
    }
}

const NESTED_KINDS: &[&str] = &["all", "by_id", "nested"];

impl NestedContextManager {
    /// Resolve a selector to the ids of the leaf partitions it designates.
    pub fn selected_partition_ids(
        &self,
        selector: &ContextPartitionSelector,
    ) -> Result<BTreeSet<PartitionId>> {
        match selector {
            ContextPartitionSelector::All => Ok(self.ids.ids().collect()),
            ContextPartitionSelector::ById(wanted) => Ok(wanted
                .iter()
                .copied()
                .filter(|id| self.ids.contains(*id))
                .collect()),
            ContextPartitionSelector::Nested(stacks) => {
                let mut out = BTreeSet::new();
                let Some(root) = self.tree.root() else {
                    return Ok(out);
                };
                for stack in stacks {
                    if stack.len() != self.depth() {
                        return Err(ContextError::InvalidSelector {
                            found: format!("nested selector with {} levels", stack.len()),
                            expected: format!("nested selector with {} levels", self.depth()),
                        });
                    }
                    self.select_nested(root, stack, &mut out)?;
                }
                Ok(out)
            }
            other if self.depth() > 1 => {
                Err(ContextError::invalid_selector(other.kind_name(), NESTED_KINDS))
            }
            other => {
                let Some(root) = self.tree.root() else {
                    return Ok(BTreeSet::new());
                };
                self.select_leaves(root, other)
            }
        }
    }

    fn select_nested(
        &self,
        id: ControllerId,
        stack: &[ContextPartitionSelector],
        out: &mut BTreeSet<PartitionId>,
    ) -> Result<()> {
        let (Some(entry), Some(selector)) = (self.tree.get(id), stack.first()) else {
            return Ok(());
        };
        if matches!(selector, ContextPartitionSelector::Nested(_)) {
            return Err(ContextError::invalid_selector(
                selector.kind_name(),
                &["all", "by_id", "category", "hash", "segmented", "filtered"],
            ));
        }

        if stack.len() == 1 {
            out.extend(self.select_leaves(id, selector)?);
            return Ok(());
        }

        let path_ids: Vec<u32> = match (selector, entry.controller.as_ref()) {
            (ContextPartitionSelector::All, _) => entry.children.keys().copied().collect(),
            (_, Some(controller)) => controller.select(selector)?,
            (_, None) => Vec::new(),
        };
        for path_id in path_ids {
            if let Some(child) = entry.children.get(&path_id) {
                self.select_nested(*child, &stack[1..], out)?;
            }
        }
        Ok(())
    }

    /// Partition ids running under leaf controller `id` that match.
    fn select_leaves(
        &self,
        id: ControllerId,
        selector: &ContextPartitionSelector,
    ) -> Result<BTreeSet<PartitionId>> {
        let Some(entry) = self.tree.get(id) else {
            return Ok(BTreeSet::new());
        };
        let candidates: Vec<u32> = match (selector, entry.controller.as_ref()) {
            (ContextPartitionSelector::All, _) => entry.instances.keys().copied().collect(),
            (_, Some(controller)) => controller.select(selector)?,
            (_, None) => Vec::new(),
        };
        Ok(candidates
            .into_iter()
            .filter(|pid| entry.instances.contains_key(pid))
            .collect())
    }
}
