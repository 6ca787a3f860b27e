//! Keyed (segmented) context: `partition by p1, p2 from EventType`.
//!
//! One partition per distinct key value. Partitions are created lazily the
//! first time an event carries a new key, and that event is the partition's
//! triggering event.

use super::{
    select_common, Activation, ContextController, ControllerFactory, ControllerId,
    ControllerKind, FilterBinding, InstanceHandle, InstantiateRequest, PartitionId, PartitionKey,
    PartitionLifecycle, PathId, PropertyMap, RecoveredPartition, ValidationCache,
};
use crate::error::{ContextError, Result};
use crate::event::{Event, SharedEvent};
use crate::filter::{FilterAddendum, FilterConstraint};
use crate::selector::ContextPartitionSelector;
use crate::statement::StatementDescriptor;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use varpulis_core::{PropertyType, Value};

/// One `partition by` clause: the key properties for one event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedItem {
    pub event_type: String,
    pub properties: Vec<String>,
}

impl KeyedItem {
    pub fn new<S: Into<String>>(
        event_type: impl Into<String>,
        properties: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            properties: properties.into_iter().map(Into::into).collect(),
        }
    }

    fn key_of(&self, event: &Event) -> Vec<Value> {
        self.properties
            .iter()
            .map(|p| event.get(p).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

#[derive(Debug)]
pub struct KeyedFactory {
    name: String,
    items: Vec<KeyedItem>,
}

impl KeyedFactory {
    /// Every item must list the same number of key properties.
    pub fn new(name: impl Into<String>, items: Vec<KeyedItem>) -> Result<Self> {
        let name = name.into();
        let Some(first) = items.first() else {
            return Err(ContextError::InvalidDeclaration(format!(
                "Segmented context '{}' lists no event types",
                name
            )));
        };
        let arity = first.properties.len();
        if arity == 0 {
            return Err(ContextError::InvalidDeclaration(format!(
                "Segmented context '{}' partitions '{}' by no properties",
                name, first.event_type
            )));
        }
        if let Some(bad) = items.iter().find(|i| i.properties.len() != arity) {
            return Err(ContextError::InvalidDeclaration(format!(
                "Segmented context '{}' requires the same number of properties per event type, \
                 '{}' lists {} but '{}' lists {}",
                name,
                first.event_type,
                arity,
                bad.event_type,
                bad.properties.len()
            )));
        }
        Ok(Self { name, items })
    }

    pub fn items(&self) -> &[KeyedItem] {
        &self.items
    }

    fn item_for(&self, event_type: &str) -> Option<&KeyedItem> {
        self.items.iter().find(|i| i.event_type == event_type)
    }

    fn arity(&self) -> usize {
        self.items.first().map_or(0, |i| i.properties.len())
    }
}

impl ControllerFactory for KeyedFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ControllerKind {
        ControllerKind::Keyed
    }

    fn create(
        self: Arc<Self>,
        id: ControllerId,
        path_id: PathId,
        level: usize,
    ) -> Box<dyn ContextController> {
        Box::new(KeyedController {
            id,
            path_id,
            level,
            factory: self,
            partitions: IndexMap::new(),
            next_path_id: 0,
        })
    }

    fn validate_statement(&self, statement: &StatementDescriptor) -> Result<ValidationCache> {
        let cache = ValidationCache {
            bindings: statement
                .filters
                .iter()
                .filter_map(|f| {
                    self.item_for(&f.event_type).map(|item| FilterBinding {
                        filter: Arc::clone(f),
                        properties: item.properties.clone(),
                    })
                })
                .collect(),
        };
        if cache.bindings.is_empty() {
            let listed: Vec<&str> = self.items.iter().map(|i| i.event_type.as_str()).collect();
            return Err(ContextError::Validation {
                context: self.name.clone(),
                statement: statement.name.clone(),
                reason: format!(
                    "segmented context requires that any of the event types that are listed in the \
                     segmented context also appear in any of the filter expressions of the statement, \
                     listed event types are: {}",
                    listed.join(", ")
                ),
            });
        }
        Ok(cache)
    }

    fn populate_filter_addendum(
        &self,
        addendum: &mut FilterAddendum,
        cache: &ValidationCache,
        key: &PartitionKey,
        _partition_id: Option<PartitionId>,
    ) {
        let PartitionKey::Keyed(values) = key else {
            return;
        };
        for binding in &cache.bindings {
            addendum.add(
                &binding.filter,
                binding
                    .properties
                    .iter()
                    .zip(values)
                    .map(|(p, v)| FilterConstraint::equal(p.clone(), v.clone())),
            );
        }
    }

    fn builtin_properties(&self) -> Vec<(String, PropertyType)> {
        (1..=self.arity())
            .map(|i| (format!("key{}", i), PropertyType::Any))
            .collect()
    }

    fn partition_properties(&self, key: &PartitionKey, _context_properties: &PropertyMap) -> PropertyMap {
        let mut out = PropertyMap::new();
        if let PartitionKey::Keyed(values) = key {
            for (i, v) in values.iter().enumerate() {
                out.insert(format!("key{}", i + 1), v.clone());
            }
        }
        out
    }
}

pub struct KeyedController {
    id: ControllerId,
    path_id: PathId,
    level: usize,
    factory: Arc<KeyedFactory>,
    partitions: IndexMap<PartitionKey, InstanceHandle>,
    next_path_id: PathId,
}

impl KeyedController {
    /// Route an event to its key's partition, creating the partition if the
    /// key is new. Returns the existing handle, if any.
    fn route(
        &mut self,
        lifecycle: &mut dyn PartitionLifecycle,
        event: &SharedEvent,
    ) -> Result<Option<InstanceHandle>> {
        let Some(item) = self.factory.item_for(&event.event_type) else {
            return Ok(None);
        };
        let key = PartitionKey::Keyed(item.key_of(event));
        if let Some(handle) = self.partitions.get(&key) {
            return Ok(Some(*handle));
        }
        let handle = self.start(lifecycle, key, Some(event), None)?;
        debug!("Context '{}' created partition {:?}", self.factory.name, handle);
        Ok(None)
    }

    fn start(
        &mut self,
        lifecycle: &mut dyn PartitionLifecycle,
        key: PartitionKey,
        trigger: Option<&SharedEvent>,
        recovered: Option<&RecoveredPartition>,
    ) -> Result<InstanceHandle> {
        let path_id = self.next_path_id;
        let properties = self.factory.partition_properties(&key, &PropertyMap::new());
        let request = InstantiateRequest::new(self.id, path_id, key.clone())
            .with_trigger(trigger)
            .with_properties(properties)
            .with_recovered(recovered);
        let handle = lifecycle.instantiate(request)?;
        self.next_path_id += 1;
        self.partitions.insert(key, handle);
        Ok(handle)
    }
}

impl ContextController for KeyedController {
    fn id(&self) -> ControllerId {
        self.id
    }

    fn path_id(&self) -> PathId {
        self.path_id
    }

    fn nesting_level(&self) -> usize {
        self.level
    }

    fn factory(&self) -> Arc<dyn ControllerFactory> {
        self.factory.clone()
    }

    fn activate(
        &mut self,
        lifecycle: &mut dyn PartitionLifecycle,
        activation: Activation<'_>,
    ) -> Result<()> {
        if let Some(state) = activation.external_state {
            for recovered in &state.partitions {
                if matches!(recovered.key, PartitionKey::Keyed(_))
                    && !self.partitions.contains_key(&recovered.key)
                {
                    self.start(lifecycle, recovered.key.clone(), None, Some(recovered))?;
                }
            }
        }
        if let Some(event) = activation.trigger_event {
            self.route(lifecycle, event)?;
        }
        Ok(())
    }

    fn deactivate(&mut self) {
        self.partitions.clear();
    }

    fn on_event(
        &mut self,
        lifecycle: &mut dyn PartitionLifecycle,
        event: &SharedEvent,
    ) -> Result<Vec<InstanceHandle>> {
        Ok(self.route(lifecycle, event)?.into_iter().collect())
    }

    fn select(&self, selector: &ContextPartitionSelector) -> Result<Vec<u32>> {
        if let Some(ids) = select_common(self.partitions.iter(), selector) {
            return Ok(ids);
        }
        match selector {
            ContextPartitionSelector::Segmented(keys) => Ok(keys
                .iter()
                .filter_map(|k| self.partitions.get(&PartitionKey::Keyed(k.clone())))
                .map(|h| h.id())
                .collect()),
            other => Err(ContextError::invalid_selector(
                other.kind_name(),
                &["all", "by_id", "filtered", "segmented"],
            )),
        }
    }

    fn child_terminated(&mut self, handle: &InstanceHandle) {
        self.partitions.retain(|_, h| h != handle);
    }
}
