//! Context controllers: one partitioning strategy per nesting level.
//!
//! A [`ControllerFactory`] exists once per declared nesting level and holds
//! that level's scheme parameters. It creates one [`ContextController`] per
//! node of the context tree at that level. Controllers decide *when*
//! partitions start and end (a key seen for the first time, a category
//! declared, a hash bucket touched, an initiating event, a time range) and
//! report those decisions through the [`PartitionLifecycle`] callback. The
//! orchestrator behind that callback decides whether a new child is a
//! sub-branch or a statement-bearing leaf; controllers never know which.
//!
//! Controllers do not hold a reference to the orchestrator. Every method that
//! may start or end partitions receives the lifecycle as a parameter, which
//! makes re-entrant instantiation (a child's activation instantiating its own
//! children) an ordinary nested call on the same stack.

pub mod category;
pub mod hash;
pub mod initterm;
pub mod keyed;
pub mod temporal;

pub use category::{CategoryController, CategoryFactory, CategoryItem};
pub use hash::{HashController, HashFactory};
pub use initterm::{EndCondition, InitTermController, InitTermFactory, StartCondition};
pub use keyed::{KeyedController, KeyedFactory, KeyedItem};
pub use temporal::{TemporalController, TemporalFactory};

use crate::error::{ContextError, Result};
use crate::event::SharedEvent;
use crate::filter::{FilterAddendum, FilterSpec};
use crate::selector::{ContextPartitionSelector, PartitionIdentifier};
use crate::statement::StatementDescriptor;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use varpulis_core::{PropertyType, Value};

/// Identifier of a child among the siblings created by the same controller.
pub type PathId = u32;

/// Identifier of a leaf context partition (one set of agent instances).
pub type PartitionId = u32;

/// Context properties captured when a partition is created.
pub type PropertyMap = IndexMap<String, Value>;

/// Tagged events of the pattern that initiated a partition.
pub type PatternMatch = IndexMap<String, SharedEvent>;

/// Stable identity of a controller inside one context tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControllerId(pub(crate) u64);

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctl-{}", self.0)
    }
}

/// The key a controller assigned to one of its child partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKey {
    /// Segmented context: one value per key property
    Keyed(Vec<Value>),
    /// Category context: the category label
    Category(String),
    /// Hash-coalesced context: the bucket number
    Hash(i64),
    /// Initiated/terminated context: one episode
    Episode { start_ms: i64, seq: u64 },
    /// Fixed time range
    Temporal { start_ms: i64, end_ms: i64 },
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKey::Keyed(values) if values.len() == 1 => write!(f, "{}", values[0]),
            PartitionKey::Keyed(values) => write!(f, "{}", Value::Array(values.clone())),
            PartitionKey::Category(label) => write!(f, "{}", label),
            PartitionKey::Hash(bucket) => write!(f, "bucket {}", bucket),
            PartitionKey::Episode { start_ms, seq } => write!(f, "episode {}@{}", seq, start_ms),
            PartitionKey::Temporal { start_ms, end_ms } => write!(f, "[{}, {})", start_ms, end_ms),
        }
    }
}

/// Handle returned from instantiation. Branch and leaf handles are opaque to
/// the controller that receives them; it only stores them and hands them
/// back for routing or termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceHandle {
    /// A sub-branch: `child` controller created under `parent` at `path_id`
    Branch {
        parent: ControllerId,
        path_id: PathId,
        child: ControllerId,
    },
    /// A statement-bearing partition owned by leaf `controller`.
    /// `generation` is unique per started partition, so a handle kept past
    /// termination never matches a partition that later reuses its id.
    Leaf {
        controller: ControllerId,
        partition_id: PartitionId,
        generation: u64,
    },
}

impl InstanceHandle {
    /// The id a selector matches on: the path id for branches, the partition
    /// id for leaves.
    pub fn id(&self) -> u32 {
        match self {
            InstanceHandle::Branch { path_id, .. } => *path_id,
            InstanceHandle::Leaf { partition_id, .. } => *partition_id,
        }
    }

    /// The controller that owns (created) this instance.
    pub fn owner(&self) -> ControllerId {
        match self {
            InstanceHandle::Branch { parent, .. } => *parent,
            InstanceHandle::Leaf { controller, .. } => *controller,
        }
    }
}

/// Partition assignments carried over from a previous run, used to recreate
/// the same partitions with the same ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalState {
    pub partitions: Vec<RecoveredPartition>,
}

/// One recovered child: its key, its partition id if it is a leaf, and the
/// recovered state of its own children if it is a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveredPartition {
    pub key: PartitionKey,
    #[serde(default)]
    pub partition_id: Option<PartitionId>,
    #[serde(default)]
    pub children: ExternalState,
}

impl ExternalState {
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Find the recovered entry for a key.
    pub fn find(&self, key: &PartitionKey) -> Option<&RecoveredPartition> {
        self.partitions.iter().find(|p| &p.key == key)
    }
}

/// Request sent by a controller when it decides a child should exist.
#[derive(Debug)]
pub struct InstantiateRequest<'a> {
    /// Caller-supplied partition id; wins over allocation for leaves
    pub assigned_id: Option<PartitionId>,
    pub path_id: PathId,
    pub originator: ControllerId,
    /// Evaluated against the new agent instances (leaf) or handed to the
    /// new controller's activation (branch)
    pub trigger_event: Option<&'a SharedEvent>,
    pub trigger_match: Option<&'a PatternMatch>,
    pub partition_key: PartitionKey,
    pub context_properties: PropertyMap,
    pub external_state: Option<ExternalState>,
}

impl<'a> InstantiateRequest<'a> {
    pub fn new(originator: ControllerId, path_id: PathId, partition_key: PartitionKey) -> Self {
        Self {
            assigned_id: None,
            path_id,
            originator,
            trigger_event: None,
            trigger_match: None,
            partition_key,
            context_properties: PropertyMap::new(),
            external_state: None,
        }
    }

    pub fn with_trigger(mut self, event: Option<&'a SharedEvent>) -> Self {
        self.trigger_event = event;
        self
    }

    pub fn with_match(mut self, pattern: Option<&'a PatternMatch>) -> Self {
        self.trigger_match = pattern;
        self
    }

    pub fn with_properties(mut self, properties: PropertyMap) -> Self {
        self.context_properties = properties;
        self
    }

    /// Apply a recovered entry: its id and the state of its children.
    pub fn with_recovered(mut self, recovered: Option<&RecoveredPartition>) -> Self {
        if let Some(r) = recovered {
            self.assigned_id = r.partition_id;
            self.external_state = Some(r.children.clone());
        }
        self
    }
}

/// Inputs to [`ContextController::activate`].
#[derive(Debug, Clone, Copy)]
pub struct Activation<'a> {
    pub trigger_event: Option<&'a SharedEvent>,
    pub trigger_match: Option<&'a PatternMatch>,
    pub external_state: Option<&'a ExternalState>,
    /// Current time as last supplied to the orchestrator
    pub now_ms: i64,
}

/// Callback through which controllers start and end child partitions.
///
/// Implemented by the orchestrator. Both methods may be called from inside
/// any controller method that receives the lifecycle, including during
/// activation of a freshly created controller.
pub trait PartitionLifecycle {
    /// Create a sub-branch or a leaf partition.
    fn instantiate(&mut self, request: InstantiateRequest<'_>) -> Result<InstanceHandle>;

    /// End a sub-branch or leaf partition. Stale handles are ignored.
    fn terminate(
        &mut self,
        handle: &InstanceHandle,
        termination_properties: Option<&PropertyMap>,
    ) -> Result<()>;
}

/// Kind of partitioning strategy, used for logging and descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKind {
    Keyed,
    Category,
    Hash,
    InitiatedTerminated,
    Temporal,
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerKind::Keyed => "keyed",
            ControllerKind::Category => "category",
            ControllerKind::Hash => "hash",
            ControllerKind::InitiatedTerminated => "initiated-terminated",
            ControllerKind::Temporal => "temporal",
        };
        write!(f, "{}", name)
    }
}

/// What a level's factory learned about one statement during validation.
///
/// Each binding ties one of the statement's filters to the event properties
/// the level partitions on; the factory later turns bindings into filter
/// constraints for a concrete partition key.
#[derive(Debug, Clone, Default)]
pub struct ValidationCache {
    pub bindings: Vec<FilterBinding>,
}

#[derive(Debug, Clone)]
pub struct FilterBinding {
    pub filter: Arc<FilterSpec>,
    pub properties: Vec<String>,
}

/// Per-level partitioning scheme, shared by every controller at that level.
pub trait ControllerFactory: Send + Sync + fmt::Debug {
    /// Declared name of this nesting level.
    fn name(&self) -> &str;

    fn kind(&self) -> ControllerKind;

    /// Create the controller for one tree node at `level` (root = 1).
    fn create(
        self: Arc<Self>,
        id: ControllerId,
        path_id: PathId,
        level: usize,
    ) -> Box<dyn ContextController>;

    /// Check that a statement can run under this level and remember how its
    /// filters relate to the partitioning properties.
    fn validate_statement(&self, statement: &StatementDescriptor) -> Result<ValidationCache>;

    /// Contribute this level's constraints for one partition.
    fn populate_filter_addendum(
        &self,
        addendum: &mut FilterAddendum,
        cache: &ValidationCache,
        key: &PartitionKey,
        partition_id: Option<PartitionId>,
    );

    /// Built-in properties this level exposes, with their types.
    fn builtin_properties(&self) -> Vec<(String, PropertyType)>;

    /// Values of the built-in properties for one partition.
    fn partition_properties(&self, key: &PartitionKey, context_properties: &PropertyMap) -> PropertyMap;
}

/// One node of the context tree implementing a partitioning strategy.
pub trait ContextController: Send {
    fn id(&self) -> ControllerId;

    fn path_id(&self) -> PathId;

    /// Depth in the tree, fixed at creation (root = 1).
    fn nesting_level(&self) -> usize;

    fn factory(&self) -> Arc<dyn ControllerFactory>;

    /// Start partitioning. May instantiate children immediately.
    fn activate(
        &mut self,
        lifecycle: &mut dyn PartitionLifecycle,
        activation: Activation<'_>,
    ) -> Result<()>;

    /// Stop partitioning and forget every child handle. The orchestrator
    /// tears the children down itself.
    fn deactivate(&mut self);

    /// Decide which existing children receive an event. Children created
    /// for this event receive it as their trigger and are not returned.
    fn on_event(
        &mut self,
        lifecycle: &mut dyn PartitionLifecycle,
        event: &SharedEvent,
    ) -> Result<Vec<InstanceHandle>>;

    /// Time advanced to `now_ms`.
    fn on_time(&mut self, _lifecycle: &mut dyn PartitionLifecycle, _now_ms: i64) -> Result<()> {
        Ok(())
    }

    /// Ids of children matching a selector: path ids for a branch
    /// controller, partition ids for a leaf controller.
    fn select(&self, selector: &ContextPartitionSelector) -> Result<Vec<u32>>;

    /// Restrict the partitions this controller maintains to `ranges`.
    fn set_partition_range(
        &mut self,
        _lifecycle: &mut dyn PartitionLifecycle,
        _ranges: &[Range<i64>],
    ) -> Result<()> {
        Err(ContextError::Unsupported(format!(
            "{} context '{}' does not support partition ranges",
            self.factory().kind(),
            self.factory().name()
        )))
    }

    /// A child was terminated by someone other than this controller.
    fn child_terminated(&mut self, handle: &InstanceHandle);
}

/// Selection shared by every controller kind: `All`, `ById` and `Filtered`.
/// Returns `None` for selector kinds the caller must handle itself.
pub(crate) fn select_common<'a, I>(
    children: I,
    selector: &ContextPartitionSelector,
) -> Option<Vec<u32>>
where
    I: Iterator<Item = (&'a PartitionKey, &'a InstanceHandle)>,
{
    match selector {
        ContextPartitionSelector::All => Some(children.map(|(_, h)| h.id()).collect()),
        ContextPartitionSelector::ById(ids) => Some(
            children
                .map(|(_, h)| h.id())
                .filter(|id| ids.contains(id))
                .collect(),
        ),
        ContextPartitionSelector::Filtered(filter) => Some(
            children
                .filter(|(key, h)| {
                    filter.accepts(&PartitionIdentifier {
                        key: *key,
                        id: h.id(),
                    })
                })
                .map(|(_, h)| h.id())
                .collect(),
        ),
        _ => None,
    }
}

/// Validation helper: bind every statement filter whose event type is
/// `event_type`, failing with `reason` when none does.
pub(crate) fn bind_filters(
    context: &str,
    statement: &StatementDescriptor,
    event_type: &str,
    properties: &[String],
    reason: impl FnOnce() -> String,
) -> Result<ValidationCache> {
    let bindings: Vec<FilterBinding> = statement
        .filters
        .iter()
        .filter(|f| f.event_type == event_type)
        .map(|f| FilterBinding {
            filter: Arc::clone(f),
            properties: properties.to_vec(),
        })
        .collect();
    if bindings.is_empty() {
        return Err(ContextError::Validation {
            context: context.to_string(),
            statement: statement.name.clone(),
            reason: reason(),
        });
    }
    Ok(ValidationCache { bindings })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_partition_key_display() {
        assert_eq!(PartitionKey::Keyed(vec![Value::from("E1")]).to_string(), "\"E1\"");
        assert_eq!(
            PartitionKey::Keyed(vec![Value::from("E1"), Value::Int(2)]).to_string(),
            "[\"E1\", 2]"
        );
        assert_eq!(PartitionKey::Category("g1".into()).to_string(), "g1");
        assert_eq!(PartitionKey::Hash(3).to_string(), "bucket 3");
    }

    #[test]
    fn test_handle_id_and_owner() {
        let branch = InstanceHandle::Branch {
            parent: ControllerId(1),
            path_id: 4,
            child: ControllerId(2),
        };
        let leaf = InstanceHandle::Leaf {
            controller: ControllerId(2),
            partition_id: 9,
            generation: 0,
        };
        assert_eq!(branch.id(), 4);
        assert_eq!(branch.owner(), ControllerId(1));
        assert_eq!(leaf.id(), 9);
        assert_eq!(leaf.owner(), ControllerId(2));
    }

    #[test]
    fn test_select_common() {
        let k1 = PartitionKey::Category("a".into());
        let k2 = PartitionKey::Category("b".into());
        let h1 = InstanceHandle::Leaf {
            controller: ControllerId(1),
            partition_id: 0,
            generation: 0,
        };
        let h2 = InstanceHandle::Leaf {
            controller: ControllerId(1),
            partition_id: 1,
            generation: 1,
        };
        let children = [(&k1, &h1), (&k2, &h2)];

        let all = select_common(children.iter().copied(), &ContextPartitionSelector::All);
        assert_eq!(all, Some(vec![0, 1]));

        let by_id = ContextPartitionSelector::ById(BTreeSet::from([1, 7]));
        assert_eq!(select_common(children.iter().copied(), &by_id), Some(vec![1]));

        let filtered = ContextPartitionSelector::filtered(|p| p.key.to_string() == "a");
        assert_eq!(select_common(children.iter().copied(), &filtered), Some(vec![0]));

        let category = ContextPartitionSelector::Category(vec!["a".into()]);
        assert_eq!(select_common(children.iter().copied(), &category), None);
    }

    #[test]
    fn test_recovered_request() {
        let recovered = RecoveredPartition {
            key: PartitionKey::Hash(1),
            partition_id: Some(5),
            children: ExternalState::default(),
        };
        let req = InstantiateRequest::new(ControllerId(0), 0, PartitionKey::Hash(1))
            .with_recovered(Some(&recovered));
        assert_eq!(req.assigned_id, Some(5));
        assert_eq!(req.external_state, Some(ExternalState::default()));
    }
}
