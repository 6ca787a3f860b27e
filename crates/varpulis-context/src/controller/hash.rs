//! Hash-coalesced context:
//! `coalesce hash(property) from EventType granularity G [preallocate]`.

use super::{
    bind_filters, select_common, Activation, ContextController, ControllerFactory, ControllerId,
    ControllerKind, InstanceHandle, InstantiateRequest, PartitionId, PartitionKey,
    PartitionLifecycle, PathId, PropertyMap, RecoveredPartition, ValidationCache,
};
use crate::error::{ContextError, Result};
use crate::event::SharedEvent;
use crate::filter::{hash_bucket, FilterAddendum, FilterConstraint};
use crate::selector::ContextPartitionSelector;
use crate::statement::StatementDescriptor;
use indexmap::IndexMap;
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;
use varpulis_core::{PropertyType, Value};

#[derive(Debug)]
pub struct HashFactory {
    name: String,
    event_type: String,
    property: String,
    granularity: i64,
    preallocate: bool,
}

impl HashFactory {
    pub fn new(
        name: impl Into<String>,
        event_type: impl Into<String>,
        property: impl Into<String>,
        granularity: i64,
        preallocate: bool,
    ) -> Result<Self> {
        let name = name.into();
        if granularity <= 0 || granularity > i64::from(PathId::MAX) {
            return Err(ContextError::InvalidDeclaration(format!(
                "Hash context '{}' requires a granularity between 1 and {}, got {}",
                name,
                PathId::MAX,
                granularity
            )));
        }
        Ok(Self {
            name,
            event_type: event_type.into(),
            property: property.into(),
            granularity,
            preallocate,
        })
    }

    pub fn granularity(&self) -> i64 {
        self.granularity
    }

    fn bucket_of(&self, event: &SharedEvent) -> Option<i64> {
        if *event.event_type != *self.event_type {
            return None;
        }
        let value = event.get(&self.property).unwrap_or(&Value::Null);
        Some(hash_bucket(value, self.granularity))
    }
}

impl ControllerFactory for HashFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ControllerKind {
        ControllerKind::Hash
    }

    fn create(
        self: Arc<Self>,
        id: ControllerId,
        path_id: PathId,
        level: usize,
    ) -> Box<dyn ContextController> {
        Box::new(HashController {
            id,
            path_id,
            level,
            factory: self,
            partitions: IndexMap::new(),
            ranges: None,
        })
    }

    fn validate_statement(&self, statement: &StatementDescriptor) -> Result<ValidationCache> {
        bind_filters(
            &self.name,
            statement,
            &self.event_type,
            std::slice::from_ref(&self.property),
            || {
                format!(
                    "hash context requires that the event type '{}' appears in a filter expression of the statement",
                    self.event_type
                )
            },
        )
    }

    fn populate_filter_addendum(
        &self,
        addendum: &mut FilterAddendum,
        cache: &ValidationCache,
        key: &PartitionKey,
        _partition_id: Option<PartitionId>,
    ) {
        let PartitionKey::Hash(bucket) = key else {
            return;
        };
        for binding in &cache.bindings {
            addendum.add(
                &binding.filter,
                [FilterConstraint::hash_bucket(
                    self.property.clone(),
                    self.granularity,
                    *bucket,
                )],
            );
        }
    }

    fn builtin_properties(&self) -> Vec<(String, PropertyType)> {
        Vec::new()
    }

    fn partition_properties(&self, _key: &PartitionKey, _context_properties: &PropertyMap) -> PropertyMap {
        PropertyMap::new()
    }
}

pub struct HashController {
    id: ControllerId,
    path_id: PathId,
    level: usize,
    factory: Arc<HashFactory>,
    partitions: IndexMap<PartitionKey, InstanceHandle>,
    /// Buckets this controller maintains; `None` means all of them
    ranges: Option<Vec<Range<i64>>>,
}

impl HashController {
    fn in_range(&self, bucket: i64) -> bool {
        self.ranges
            .as_ref()
            .map_or(true, |ranges| ranges.iter().any(|r| r.contains(&bucket)))
    }

    fn start(
        &mut self,
        lifecycle: &mut dyn PartitionLifecycle,
        bucket: i64,
        trigger: Option<&SharedEvent>,
        recovered: Option<&RecoveredPartition>,
    ) -> Result<InstanceHandle> {
        let key = PartitionKey::Hash(bucket);
        let request = InstantiateRequest::new(self.id, bucket as PathId, key.clone())
            .with_trigger(trigger)
            .with_recovered(recovered);
        let handle = lifecycle.instantiate(request)?;
        self.partitions.insert(key, handle);
        Ok(handle)
    }

    fn preallocate(
        &mut self,
        lifecycle: &mut dyn PartitionLifecycle,
        activation: Option<&Activation<'_>>,
    ) -> Result<()> {
        let trigger = activation.and_then(|a| a.trigger_event);
        let trigger_bucket = trigger.and_then(|e| self.factory.bucket_of(e));
        for bucket in 0..self.factory.granularity {
            if !self.in_range(bucket) || self.partitions.contains_key(&PartitionKey::Hash(bucket)) {
                continue;
            }
            let recovered = activation
                .and_then(|a| a.external_state)
                .and_then(|s| s.find(&PartitionKey::Hash(bucket)));
            let trigger = trigger.filter(|_| trigger_bucket == Some(bucket));
            self.start(lifecycle, bucket, trigger, recovered)?;
        }
        Ok(())
    }
}

impl ContextController for HashController {
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
        if self.factory.preallocate {
            return self.preallocate(lifecycle, Some(&activation));
        }
        if let Some(state) = activation.external_state {
            for recovered in &state.partitions {
                if let PartitionKey::Hash(bucket) = recovered.key {
                    if self.in_range(bucket) && !self.partitions.contains_key(&recovered.key) {
                        self.start(lifecycle, bucket, None, Some(recovered))?;
                    }
                }
            }
        }
        if let Some(event) = activation.trigger_event {
            self.on_event(lifecycle, event)?;
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
        let Some(bucket) = self.factory.bucket_of(event) else {
            return Ok(Vec::new());
        };
        if !self.in_range(bucket) {
            return Ok(Vec::new());
        }
        if let Some(handle) = self.partitions.get(&PartitionKey::Hash(bucket)) {
            return Ok(vec![*handle]);
        }
        self.start(lifecycle, bucket, Some(event), None)?;
        Ok(Vec::new())
    }

    fn select(&self, selector: &ContextPartitionSelector) -> Result<Vec<u32>> {
        if let Some(ids) = select_common(self.partitions.iter(), selector) {
            return Ok(ids);
        }
        match selector {
            ContextPartitionSelector::Hash(buckets) => Ok(buckets
                .iter()
                .filter_map(|b| self.partitions.get(&PartitionKey::Hash(*b)))
                .map(|h| h.id())
                .collect()),
            other => Err(ContextError::invalid_selector(
                other.kind_name(),
                &["all", "by_id", "filtered", "hash"],
            )),
        }
    }

    /// Restrict live buckets to `ranges`. Buckets falling outside are
    /// terminated; with preallocation, buckets newly inside are started.
    fn set_partition_range(
        &mut self,
        lifecycle: &mut dyn PartitionLifecycle,
        ranges: &[Range<i64>],
    ) -> Result<()> {
        self.ranges = Some(ranges.to_vec());
        let outside: Vec<(PartitionKey, InstanceHandle)> = self
            .partitions
            .iter()
            .filter(|(key, _)| matches!(key, PartitionKey::Hash(b) if !self.in_range(*b)))
            .map(|(k, h)| (k.clone(), *h))
            .collect();
        debug!(
            "Hash context '{}' narrowed to {:?}, ending {} buckets",
            self.factory.name,
            ranges,
            outside.len()
        );
        let mut first_err = None;
        for (key, handle) in outside {
            self.partitions.shift_remove(&key);
            if let Err(e) = lifecycle.terminate(&handle, None) {
                first_err.get_or_insert(e);
            }
        }
        if self.factory.preallocate {
            self.preallocate(lifecycle, None)?;
        }
        first_err.map_or(Ok(()), Err)
    }

    fn child_terminated(&mut self, handle: &InstanceHandle) {
        self.partitions.retain(|_, h| h != handle);
    }
}
