//! Category context: `group <constraints> as label, ... from EventType`.
//!
//! Every category is a partition for the whole lifetime of the controller;
//! all of them start at activation.

use super::{
    bind_filters, select_common, Activation, ContextController, ControllerFactory, ControllerId,
    ControllerKind, InstanceHandle, InstantiateRequest, PartitionId, PartitionKey,
    PartitionLifecycle, PathId, PropertyMap, ValidationCache,
};
use crate::error::{ContextError, Result};
use crate::event::{Event, SharedEvent};
use crate::filter::{FilterAddendum, FilterConstraint};
use crate::selector::ContextPartitionSelector;
use crate::statement::StatementDescriptor;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use varpulis_core::{PropertyType, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryItem {
    pub label: String,
    #[serde(default)]
    pub constraints: Vec<FilterConstraint>,
}

impl CategoryItem {
    pub fn new(label: impl Into<String>, constraints: Vec<FilterConstraint>) -> Self {
        Self {
            label: label.into(),
            constraints,
        }
    }

    fn matches(&self, event: &Event) -> bool {
        self.constraints.iter().all(|c| c.matches(event))
    }
}

#[derive(Debug)]
pub struct CategoryFactory {
    name: String,
    event_type: String,
    items: Vec<CategoryItem>,
}

impl CategoryFactory {
    pub fn new(
        name: impl Into<String>,
        event_type: impl Into<String>,
        items: Vec<CategoryItem>,
    ) -> Result<Self> {
        let name = name.into();
        if items.is_empty() {
            return Err(ContextError::InvalidDeclaration(format!(
                "Category context '{}' declares no categories",
                name
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = items.iter().find(|i| !seen.insert(i.label.as_str())) {
            return Err(ContextError::InvalidDeclaration(format!(
                "Category context '{}' declares label '{}' more than once",
                name, dup.label
            )));
        }
        Ok(Self {
            name,
            event_type: event_type.into(),
            items,
        })
    }

    pub fn items(&self) -> &[CategoryItem] {
        &self.items
    }
}

impl ControllerFactory for CategoryFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ControllerKind {
        ControllerKind::Category
    }

    fn create(
        self: Arc<Self>,
        id: ControllerId,
        path_id: PathId,
        level: usize,
    ) -> Box<dyn ContextController> {
        Box::new(CategoryController {
            id,
            path_id,
            level,
            factory: self,
            partitions: IndexMap::new(),
        })
    }

    fn validate_statement(&self, statement: &StatementDescriptor) -> Result<ValidationCache> {
        bind_filters(&self.name, statement, &self.event_type, &[], || {
            format!(
                "category context requires that the event type '{}' appears in a filter expression of the statement",
                self.event_type
            )
        })
    }

    fn populate_filter_addendum(
        &self,
        addendum: &mut FilterAddendum,
        cache: &ValidationCache,
        key: &PartitionKey,
        _partition_id: Option<PartitionId>,
    ) {
        let PartitionKey::Category(label) = key else {
            return;
        };
        let Some(item) = self.items.iter().find(|i| &i.label == label) else {
            return;
        };
        for binding in &cache.bindings {
            addendum.add(&binding.filter, item.constraints.iter().cloned());
        }
    }

    fn builtin_properties(&self) -> Vec<(String, PropertyType)> {
        vec![("label".to_string(), PropertyType::Str)]
    }

    fn partition_properties(&self, key: &PartitionKey, _context_properties: &PropertyMap) -> PropertyMap {
        let mut out = PropertyMap::new();
        if let PartitionKey::Category(label) = key {
            out.insert("label".to_string(), Value::Str(label.clone()));
        }
        out
    }
}

pub struct CategoryController {
    id: ControllerId,
    path_id: PathId,
    level: usize,
    factory: Arc<CategoryFactory>,
    partitions: IndexMap<PartitionKey, InstanceHandle>,
}

impl CategoryController {
    fn accepts_type(&self, event: &Event) -> bool {
        *event.event_type == *self.factory.event_type
    }
}

impl ContextController for CategoryController {
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
        let factory = Arc::clone(&self.factory);
        for (index, item) in factory.items.iter().enumerate() {
            let key = PartitionKey::Category(item.label.clone());
            if self.partitions.contains_key(&key) {
                continue;
            }
            // The trigger only belongs to the category it falls into.
            let trigger = activation
                .trigger_event
                .filter(|e| self.accepts_type(e) && item.matches(e));
            let recovered = activation.external_state.and_then(|s| s.find(&key));
            let request = InstantiateRequest::new(self.id, index as PathId, key.clone())
                .with_trigger(trigger)
                .with_properties(factory.partition_properties(&key, &PropertyMap::new()))
                .with_recovered(recovered);
            let handle = lifecycle.instantiate(request)?;
            self.partitions.insert(key, handle);
        }
        Ok(())
    }

    fn deactivate(&mut self) {
        self.partitions.clear();
    }

    fn on_event(
        &mut self,
        _lifecycle: &mut dyn PartitionLifecycle,
        event: &SharedEvent,
    ) -> Result<Vec<InstanceHandle>> {
        if !self.accepts_type(event) {
            return Ok(Vec::new());
        }
        Ok(self
            .factory
            .items
            .iter()
            .filter(|item| item.matches(event))
            .filter_map(|item| {
                self.partitions
                    .get(&PartitionKey::Category(item.label.clone()))
                    .copied()
            })
            .collect())
    }

    fn select(&self, selector: &ContextPartitionSelector) -> Result<Vec<u32>> {
        if let Some(ids) = select_common(self.partitions.iter(), selector) {
            return Ok(ids);
        }
        match selector {
            ContextPartitionSelector::Category(labels) => Ok(labels
                .iter()
                .filter_map(|l| self.partitions.get(&PartitionKey::Category(l.clone())))
                .map(|h| h.id())
                .collect()),
            other => Err(ContextError::invalid_selector(
                other.kind_name(),
                &["all", "by_id", "filtered", "category"],
            )),
        }
    }

    fn child_terminated(&mut self, handle: &InstanceHandle) {
        self.partitions.retain(|_, h| h != handle);
    }
}
