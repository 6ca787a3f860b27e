//! Fixed time-range context: one partition while `start_ms <= now < end_ms`.

use super::{
    select_common, Activation, ContextController, ControllerFactory, ControllerId, ControllerKind,
    InstanceHandle, InstantiateRequest, PartitionId, PartitionKey, PartitionLifecycle, PathId,
    PropertyMap, ValidationCache,
};
use crate::error::{ContextError, Result};
use crate::event::SharedEvent;
use crate::filter::FilterAddendum;
use crate::selector::ContextPartitionSelector;
use crate::statement::StatementDescriptor;
use std::sync::Arc;
use tracing::debug;
use varpulis_core::{PropertyType, Value};

#[derive(Debug)]
pub struct TemporalFactory {
    name: String,
    start_ms: i64,
    end_ms: i64,
}

impl TemporalFactory {
    pub fn new(name: impl Into<String>, start_ms: i64, end_ms: i64) -> Result<Self> {
        let name = name.into();
        if start_ms >= end_ms {
            return Err(ContextError::InvalidDeclaration(format!(
                "Context '{}' has an empty time range [{}, {})",
                name, start_ms, end_ms
            )));
        }
        Ok(Self {
            name,
            start_ms,
            end_ms,
        })
    }

    fn key(&self) -> PartitionKey {
        PartitionKey::Temporal {
            start_ms: self.start_ms,
            end_ms: self.end_ms,
        }
    }
}

impl ControllerFactory for TemporalFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ControllerKind {
        ControllerKind::Temporal
    }

    fn create(
        self: Arc<Self>,
        id: ControllerId,
        path_id: PathId,
        level: usize,
    ) -> Box<dyn ContextController> {
        Box::new(TemporalController {
            id,
            path_id,
            level,
            factory: self,
            active: None,
            finished: false,
            recovered_id: None,
        })
    }

    fn validate_statement(&self, _statement: &StatementDescriptor) -> Result<ValidationCache> {
        Ok(ValidationCache::default())
    }

    fn populate_filter_addendum(
        &self,
        _addendum: &mut FilterAddendum,
        _cache: &ValidationCache,
        _key: &PartitionKey,
        _partition_id: Option<PartitionId>,
    ) {
    }

    fn builtin_properties(&self) -> Vec<(String, PropertyType)> {
        vec![
            ("startTime".to_string(), PropertyType::Timestamp),
            ("endTime".to_string(), PropertyType::Timestamp),
        ]
    }

    fn partition_properties(&self, _key: &PartitionKey, _context_properties: &PropertyMap) -> PropertyMap {
        let mut out = PropertyMap::new();
        out.insert("startTime".to_string(), Value::Timestamp(self.start_ms));
        out.insert("endTime".to_string(), Value::Timestamp(self.end_ms));
        out
    }
}

pub struct TemporalController {
    id: ControllerId,
    path_id: PathId,
    level: usize,
    factory: Arc<TemporalFactory>,
    active: Option<(PartitionKey, InstanceHandle)>,
    finished: bool,
    recovered_id: Option<PartitionId>,
}

impl TemporalController {
    fn sync(
        &mut self,
        lifecycle: &mut dyn PartitionLifecycle,
        now_ms: i64,
        trigger: Option<&SharedEvent>,
    ) -> Result<()> {
        if now_ms >= self.factory.end_ms {
            self.finished = true;
            if let Some((_, handle)) = self.active.take() {
                debug!("Context '{}' range ended at {}", self.factory.name, now_ms);
                lifecycle.terminate(&handle, None)?;
            }
            return Ok(());
        }
        if now_ms >= self.factory.start_ms && self.active.is_none() && !self.finished {
            let key = self.factory.key();
            let mut request = InstantiateRequest::new(self.id, 0, key.clone())
                .with_trigger(trigger)
                .with_properties(self.factory.partition_properties(&key, &PropertyMap::new()));
            request.assigned_id = self.recovered_id.take();
            let handle = lifecycle.instantiate(request)?;
            debug!("Context '{}' range started at {}", self.factory.name, now_ms);
            self.active = Some((key, handle));
        }
        Ok(())
    }
}

impl ContextController for TemporalController {
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
        self.recovered_id = activation
            .external_state
            .and_then(|s| s.find(&self.factory.key()))
            .and_then(|r| r.partition_id);
        self.sync(lifecycle, activation.now_ms, activation.trigger_event)
    }

    fn deactivate(&mut self) {
        self.active = None;
    }

    fn on_event(
        &mut self,
        _lifecycle: &mut dyn PartitionLifecycle,
        _event: &SharedEvent,
    ) -> Result<Vec<InstanceHandle>> {
        Ok(self.active.iter().map(|(_, h)| *h).collect())
    }

    fn on_time(&mut self, lifecycle: &mut dyn PartitionLifecycle, now_ms: i64) -> Result<()> {
        self.sync(lifecycle, now_ms, None)
    }

    fn select(&self, selector: &ContextPartitionSelector) -> Result<Vec<u32>> {
        let children = self.active.iter().map(|(k, h)| (k, h));
        select_common(children, selector).ok_or_else(|| {
            ContextError::invalid_selector(selector.kind_name(), &["all", "by_id", "filtered"])
        })
    }

    fn child_terminated(&mut self, handle: &InstanceHandle) {
        if self.active.as_ref().is_some_and(|(_, h)| h == handle) {
            self.active = None;
            self.finished = true;
        }
    }
}
