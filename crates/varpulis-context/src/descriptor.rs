//! Context descriptor, built-in properties and per-partition resources.

use crate::controller::{ControllerFactory, ControllerKind, PartitionId, PropertyMap};
use crate::event::{Event, SharedEvent};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use varpulis_core::{PropertyType, Value};

/// Shape of one nesting level as exposed to statements.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelDescriptor {
    pub name: String,
    pub kind: ControllerKind,
    pub properties: Vec<(String, PropertyType)>,
}

/// What the rest of the engine sees of a nested context declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextDescriptor {
    pub name: String,
    pub nested: bool,
    pub levels: Vec<LevelDescriptor>,
}

impl ContextDescriptor {
    pub fn new(name: impl Into<String>, factories: &[Arc<dyn ControllerFactory>]) -> Self {
        let levels: Vec<LevelDescriptor> = factories
            .iter()
            .map(|f| LevelDescriptor {
                name: f.name().to_string(),
                kind: f.kind(),
                properties: f.builtin_properties(),
            })
            .collect();
        Self {
            name: name.into(),
            nested: levels.len() > 1,
            levels,
        }
    }

    /// Event type name of the built-in properties event.
    pub fn builtin_event_type(&self) -> String {
        format!("ContextProperties_{}", self.name)
    }

    /// Record type of the built-in properties: `name`, `id`, then each
    /// level's properties, under the level's name when nested.
    pub fn builtin_property_type(&self) -> PropertyType {
        let mut fields = vec![
            ("name".to_string(), PropertyType::Str),
            ("id".to_string(), PropertyType::Int),
        ];
        if self.nested {
            for level in &self.levels {
                fields.push((level.name.clone(), PropertyType::Record(level.properties.clone())));
            }
        } else if let Some(level) = self.levels.first() {
            fields.extend(level.properties.iter().cloned());
        }
        PropertyType::Record(fields)
    }

    pub fn resource_registry<T>(&self) -> PartitionResourceRegistry<T> {
        PartitionResourceRegistry::new()
    }
}

/// Builds the built-in properties event for one leaf partition.
pub struct BuiltinProperties<'a> {
    descriptor: &'a ContextDescriptor,
}

impl<'a> BuiltinProperties<'a> {
    pub fn new(descriptor: &'a ContextDescriptor) -> Self {
        Self { descriptor }
    }

    /// `levels` holds each level's property values, root first.
    pub fn build(&self, partition_id: PartitionId, levels: Vec<PropertyMap>) -> SharedEvent {
        let mut event = Event::new(self.descriptor.builtin_event_type())
            .with_field("name", self.descriptor.name.as_str())
            .with_field("id", partition_id);
        if self.descriptor.nested {
            for (level, values) in self.descriptor.levels.iter().zip(levels) {
                event = event.with_field(level.name.clone(), Value::Map(values));
            }
        } else {
            for (key, value) in levels.into_iter().flatten() {
                event = event.with_field(key, value);
            }
        }
        event.into_shared()
    }
}

/// Per-partition resources of one statement, keyed by partition id.
#[derive(Debug)]
pub struct PartitionResourceRegistry<T> {
    resources: FxHashMap<PartitionId, T>,
}

impl<T> Default for PartitionResourceRegistry<T> {
    fn default() -> Self {
        Self {
            resources: FxHashMap::default(),
        }
    }
}

impl<T> PartitionResourceRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, partition_id: PartitionId, resource: T) -> Option<T> {
        self.resources.insert(partition_id, resource)
    }

    pub fn get(&self, partition_id: PartitionId) -> Option<&T> {
        self.resources.get(&partition_id)
    }

    pub fn get_mut(&mut self, partition_id: PartitionId) -> Option<&mut T> {
        self.resources.get_mut(&partition_id)
    }

    pub fn remove(&mut self, partition_id: PartitionId) -> Option<T> {
        self.resources.remove(&partition_id)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{CategoryFactory, CategoryItem, KeyedFactory, KeyedItem};

    fn factories() -> Vec<Arc<dyn ControllerFactory>> {
        vec![
            Arc::new(
                KeyedFactory::new("segByString", vec![KeyedItem::new("SupportBean", ["theString"])])
                    .unwrap(),
            ),
            Arc::new(
                CategoryFactory::new(
                    "byCat",
                    "SupportBean",
                    vec![CategoryItem::new("g1", Vec::new())],
                )
                .unwrap(),
            ),
        ]
    }

    #[test]
    fn test_nested_property_type() {
        let descriptor = ContextDescriptor::new("ctx", &factories());
        assert!(descriptor.nested);
        assert_eq!(
            descriptor.builtin_property_type().to_string(),
            "{name: str, id: int, segByString: {key1: any}, byCat: {label: str}}"
        );
    }

    #[test]
    fn test_single_level_properties_are_flat() {
        let descriptor = ContextDescriptor::new("ctx", &factories()[..1]);
        assert!(!descriptor.nested);

        let mut level = PropertyMap::new();
        level.insert("key1".into(), Value::from("E1"));
        let event = BuiltinProperties::new(&descriptor).build(7, vec![level]);
        assert_eq!(&*event.event_type, "ContextProperties_ctx");
        assert_eq!(event.get_int("id"), Some(7));
        assert_eq!(event.get_str("key1"), Some("E1"));
    }

    #[test]
    fn test_nested_properties_under_level_names() {
        let descriptor = ContextDescriptor::new("ctx", &factories());
        let mut outer = PropertyMap::new();
        outer.insert("key1".into(), Value::from("E1"));
        let mut inner = PropertyMap::new();
        inner.insert("label".into(), Value::from("g1"));

        let event = BuiltinProperties::new(&descriptor).build(2, vec![outer, inner]);
        assert_eq!(
            event.get("byCat").and_then(|v| v.get("label")),
            Some(&Value::from("g1"))
        );
        assert_eq!(event.get_str("name"), Some("ctx"));
    }

    #[test]
    fn test_resource_registry() {
        let descriptor = ContextDescriptor::new("ctx", &factories());
        let mut registry = descriptor.resource_registry::<String>();
        registry.insert(1, "window".into());
        assert_eq!(registry.get(1).map(String::as_str), Some("window"));
        assert_eq!(registry.remove(1), Some("window".into()));
        assert!(registry.is_empty());
    }
}
