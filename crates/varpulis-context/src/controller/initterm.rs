//! Initiated/terminated context:
//! `initiated by <now | event filter> terminated by <event filter | after ms>`.
//!
//! Each episode is one partition. An initiating event is the triggering
//! event of the episode it starts and is exposed to statements under the
//! `initiator` tag. Without `overlapping`, a new episode only starts once
//! the running one has ended.

use super::{
    select_common, Activation, ContextController, ControllerFactory, ControllerId, ControllerKind,
    InstanceHandle, InstantiateRequest, PartitionId, PartitionKey, PartitionLifecycle, PathId,
    PatternMatch, PropertyMap, ValidationCache,
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

/// Tag under which the initiating event is exposed.
pub const INITIATOR_TAG: &str = "initiator";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StartCondition {
    /// Start immediately, and again as soon as an episode ends
    Now,
    Event {
        event_type: String,
        #[serde(default)]
        constraints: Vec<FilterConstraint>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndCondition {
    Event {
        event_type: String,
        #[serde(default)]
        constraints: Vec<FilterConstraint>,
    },
    /// End a fixed time after the episode started
    After { duration_ms: i64 },
}

fn event_matches(event_type: &str, constraints: &[FilterConstraint], event: &Event) -> bool {
    *event.event_type == *event_type && constraints.iter().all(|c| c.matches(event))
}

impl StartCondition {
    fn matches(&self, event: &Event) -> bool {
        match self {
            StartCondition::Now => false,
            StartCondition::Event {
                event_type,
                constraints,
            } => event_matches(event_type, constraints, event),
        }
    }
}

impl EndCondition {
    fn matches(&self, event: &Event) -> bool {
        match self {
            EndCondition::Event {
                event_type,
                constraints,
            } => event_matches(event_type, constraints, event),
            EndCondition::After { .. } => false,
        }
    }
}

#[derive(Debug)]
pub struct InitTermFactory {
    name: String,
    start: StartCondition,
    end: EndCondition,
    overlapping: bool,
}

impl InitTermFactory {
    pub fn new(
        name: impl Into<String>,
        start: StartCondition,
        end: EndCondition,
        overlapping: bool,
    ) -> Result<Self> {
        let name = name.into();
        if let EndCondition::After { duration_ms } = end {
            if duration_ms <= 0 {
                return Err(ContextError::InvalidDeclaration(format!(
                    "Context '{}' must terminate after a positive duration, got {} ms",
                    name, duration_ms
                )));
            }
        }
        if overlapping && start == StartCondition::Now {
            return Err(ContextError::InvalidDeclaration(format!(
                "Context '{}' cannot overlap episodes initiated by 'now'",
                name
            )));
        }
        Ok(Self {
            name,
            start,
            end,
            overlapping,
        })
    }

    fn end_time(&self, start_ms: i64) -> Value {
        match self.end {
            EndCondition::After { duration_ms } => {
                Value::Timestamp(start_ms.saturating_add(duration_ms))
            }
            EndCondition::Event { .. } => Value::Null,
        }
    }
}

impl ControllerFactory for InitTermFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ControllerKind {
        ControllerKind::InitiatedTerminated
    }

    fn create(
        self: Arc<Self>,
        id: ControllerId,
        path_id: PathId,
        level: usize,
    ) -> Box<dyn ContextController> {
        Box::new(InitTermController {
            id,
            path_id,
            level,
            factory: self,
            episodes: IndexMap::new(),
            seq: 0,
            now_ms: 0,
        })
    }

    /// Episodes constrain time, not event content; every statement fits.
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
        let mut props = vec![
            ("startTime".to_string(), PropertyType::Timestamp),
            ("endTime".to_string(), PropertyType::Timestamp),
        ];
        if let StartCondition::Event { .. } = self.start {
            props.push((INITIATOR_TAG.to_string(), PropertyType::Any));
        }
        props
    }

    fn partition_properties(&self, key: &PartitionKey, context_properties: &PropertyMap) -> PropertyMap {
        let mut out = PropertyMap::new();
        if let PartitionKey::Episode { start_ms, .. } = key {
            out.insert("startTime".to_string(), Value::Timestamp(*start_ms));
            out.insert("endTime".to_string(), self.end_time(*start_ms));
        }
        if let Some(initiator) = context_properties.get(INITIATOR_TAG) {
            out.insert(INITIATOR_TAG.to_string(), initiator.clone());
        }
        out
    }
}

#[derive(Debug, Clone, Copy)]
struct Episode {
    handle: InstanceHandle,
    start_ms: i64,
}

pub struct InitTermController {
    id: ControllerId,
    path_id: PathId,
    level: usize,
    factory: Arc<InitTermFactory>,
    episodes: IndexMap<PartitionKey, Episode>,
    seq: u64,
    now_ms: i64,
}

impl InitTermController {
    fn next_path_id(&self) -> Result<PathId> {
        PathId::try_from(self.seq).map_err(|_| {
            ContextError::Unsupported(format!(
                "Context '{}' has no episode path ids left",
                self.factory.name
            ))
        })
    }

    fn start_episode(
        &mut self,
        lifecycle: &mut dyn PartitionLifecycle,
        start_ms: i64,
        initiator: Option<&SharedEvent>,
    ) -> Result<()> {
        let key = PartitionKey::Episode {
            start_ms,
            seq: self.seq,
        };
        let pattern: Option<PatternMatch> = initiator.map(|e| {
            let mut m = PatternMatch::new();
            m.insert(INITIATOR_TAG.to_string(), Arc::clone(e));
            m
        });
        let mut properties = self.factory.partition_properties(&key, &PropertyMap::new());
        if let Some(event) = initiator {
            properties.insert(INITIATOR_TAG.to_string(), event.to_value());
        }
        let request = InstantiateRequest::new(self.id, self.next_path_id()?, key.clone())
            .with_trigger(initiator)
            .with_match(pattern.as_ref())
            .with_properties(properties);
        let handle = lifecycle.instantiate(request)?;
        self.seq += 1;
        self.episodes.insert(key, Episode { handle, start_ms });
        debug!("Context '{}' started episode at {}", self.factory.name, start_ms);
        Ok(())
    }

    /// End every episode selected by `which`. Failures are reported after
    /// all selected episodes were ended.
    fn end_episodes<F>(&mut self, lifecycle: &mut dyn PartitionLifecycle, which: F) -> Result<usize>
    where
        F: Fn(&Episode) -> bool,
    {
        let ending: Vec<PartitionKey> = self
            .episodes
            .iter()
            .filter(|(_, ep)| which(ep))
            .map(|(k, _)| k.clone())
            .collect();
        let mut first_err = None;
        for key in &ending {
            if let Some(ep) = self.episodes.shift_remove(key) {
                if let Err(e) = lifecycle.terminate(&ep.handle, None) {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(ending.len()), Err)
    }

    /// With a `now` start there is always exactly one running episode.
    fn restart_if_now(&mut self, lifecycle: &mut dyn PartitionLifecycle) -> Result<()> {
        if self.factory.start == StartCondition::Now && self.episodes.is_empty() {
            self.start_episode(lifecycle, self.now_ms, None)?;
        }
        Ok(())
    }
}

impl ContextController for InitTermController {
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
        self.now_ms = activation.now_ms;
        let factory = Arc::clone(&self.factory);
        match (&factory.start, activation.trigger_event) {
            (StartCondition::Now, trigger) => self.start_episode(lifecycle, self.now_ms, trigger),
            (start, Some(event)) if start.matches(event) => {
                self.start_episode(lifecycle, event.timestamp_ms(), Some(event))
            }
            _ => Ok(()),
        }
    }

    fn deactivate(&mut self) {
        self.episodes.clear();
    }

    fn on_event(
        &mut self,
        lifecycle: &mut dyn PartitionLifecycle,
        event: &SharedEvent,
    ) -> Result<Vec<InstanceHandle>> {
        if self.factory.end.matches(event) {
            self.end_episodes(lifecycle, |_| true)?;
            self.restart_if_now(lifecycle)?;
        }
        let receivers: Vec<InstanceHandle> = self.episodes.values().map(|ep| ep.handle).collect();
        if self.factory.start.matches(event) && (self.factory.overlapping || self.episodes.is_empty()) {
            self.start_episode(lifecycle, event.timestamp_ms(), Some(event))?;
        }
        Ok(receivers)
    }

    fn on_time(&mut self, lifecycle: &mut dyn PartitionLifecycle, now_ms: i64) -> Result<()> {
        self.now_ms = now_ms;
        if let EndCondition::After { duration_ms } = self.factory.end {
            let ended = self.end_episodes(lifecycle, |ep| {
                ep.start_ms.saturating_add(duration_ms) <= now_ms
            })?;
            if ended > 0 {
                self.restart_if_now(lifecycle)?;
            }
        }
        Ok(())
    }

    fn select(&self, selector: &ContextPartitionSelector) -> Result<Vec<u32>> {
        let children = self.episodes.iter().map(|(k, ep)| (k, &ep.handle));
        select_common(children, selector).ok_or_else(|| {
            ContextError::invalid_selector(selector.kind_name(), &["all", "by_id", "filtered"])
        })
    }

    fn child_terminated(&mut self, handle: &InstanceHandle) {
        self.episodes.retain(|_, ep| ep.handle != *handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declaration_checks() {
        let start = StartCondition::Event {
            event_type: "Start".into(),
            constraints: Vec::new(),
        };
        assert!(InitTermFactory::new("c", start.clone(), EndCondition::After { duration_ms: 0 }, false).is_err());
        assert!(InitTermFactory::new("c", StartCondition::Now, EndCondition::After { duration_ms: 10 }, true).is_err());
        assert!(InitTermFactory::new("c", start, EndCondition::After { duration_ms: 10 }, true).is_ok());
    }

    #[test]
    fn test_conditions_match_type_and_constraints() {
        let start = StartCondition::Event {
            event_type: "Login".into(),
            constraints: vec![FilterConstraint::equal("user", "alice")],
        };
        assert!(start.matches(&Event::new("Login").with_field("user", "alice")));
        assert!(!start.matches(&Event::new("Login").with_field("user", "bob")));
        assert!(!StartCondition::Now.matches(&Event::new("Login")));
        assert!(!EndCondition::After { duration_ms: 5 }.matches(&Event::new("Login")));
    }

    #[test]
    fn test_episode_properties() {
        let factory = InitTermFactory::new(
            "c",
            StartCondition::Now,
            EndCondition::After { duration_ms: 1_000 },
            false,
        )
        .unwrap();
        let props = factory.partition_properties(
            &PartitionKey::Episode { start_ms: 500, seq: 0 },
            &PropertyMap::new(),
        );
        assert_eq!(props.get("startTime"), Some(&Value::Timestamp(500)));
        assert_eq!(props.get("endTime"), Some(&Value::Timestamp(1_500)));

        let late = factory.partition_properties(
            &PartitionKey::Episode { start_ms: i64::MAX - 10, seq: 1 },
            &PropertyMap::new(),
        );
        assert_eq!(late.get("endTime"), Some(&Value::Timestamp(i64::MAX)));
    }

    #[test]
    fn test_episode_path_ids_are_checked() {
        let factory = InitTermFactory::new(
            "c",
            StartCondition::Now,
            EndCondition::After { duration_ms: 1_000 },
            false,
        )
        .unwrap();
        let mut controller = InitTermController {
            id: ControllerId(0),
            path_id: 0,
            level: 1,
            factory: Arc::new(factory),
            episodes: IndexMap::new(),
            seq: u64::from(PathId::MAX),
            now_ms: 0,
        };
        assert_eq!(controller.next_path_id().unwrap(), PathId::MAX);
        controller.seq += 1;
        assert!(matches!(
            controller.next_path_id(),
            Err(ContextError::Unsupported(_))
        ));
    }
}
