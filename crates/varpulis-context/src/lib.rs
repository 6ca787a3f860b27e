//! Varpulis Context - nested context-partition orchestration
//!
//! A context declaration splits the event stream into partitions, one level
//! per partitioning scheme (keyed, category, hash, initiated/terminated,
//! temporal). Every leaf partition runs its own instance of every statement
//! attached to the context. This crate keeps that tree of partitions alive:
//! it creates and ends partitions as controllers decide, starts and stops
//! statement instances, narrows each instance's filters to its partition, and
//! resolves selectors that address subsets of the tree.

pub mod config;
pub mod controller;
pub mod descriptor;
pub mod error;
pub mod event;
pub mod filter;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod partition_id;
pub mod selector;
pub mod shared;
pub mod statement;
mod tree;

pub use config::{ContextConfig, LevelConfig, LevelKind, LoggingConfig, ManagerConfig};
pub use controller::{
    Activation, ContextController, ControllerFactory, ControllerId, ControllerKind,
    ExternalState, InstanceHandle, InstantiateRequest, PartitionId, PartitionKey,
    PartitionLifecycle, PathId, PatternMatch, PropertyMap, RecoveredPartition, ValidationCache,
};
pub use descriptor::{BuiltinProperties, ContextDescriptor, LevelDescriptor, PartitionResourceRegistry};
pub use error::{ConfigError, ContextError, Result};
pub use event::{Event, SharedEvent};
pub use filter::{FilterAddendum, FilterConstraint, FilterOp, FilterSpec};
pub use manager::NestedContextManager;
pub use metrics::ContextMetrics;
pub use partition_id::PartitionIdAllocator;
pub use selector::{ContextPartitionSelector, PartitionFilter, PartitionIdentifier};
pub use shared::SharedContextManager;
pub use statement::{
    AgentInstance, AgentInstanceContext, AgentStartRequest, BoxError, CollectingRuntime,
    CollectingView, OutputView, StatementDescriptor, StatementId, StatementRuntime,
};
pub use varpulis_core::{PropertyType, Value};
