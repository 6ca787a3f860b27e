//! Shared helpers for context integration tests: a statement runtime that
//! records every start and stop, and event/factory shorthands.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use varpulis_context::controller::{CategoryFactory, CategoryItem, KeyedFactory, KeyedItem};
use varpulis_context::{
    AgentInstance, AgentInstanceContext, AgentStartRequest, BoxError, CollectingView,
    ControllerFactory, Event, FilterConstraint, FilterSpec, PartitionId, SharedEvent,
    StatementDescriptor, StatementRuntime,
};

/// What the runtime saw when a statement instance started.
#[derive(Debug, Clone)]
pub struct StartRecord {
    pub statement: String,
    pub partition_id: PartitionId,
    pub is_recovery: bool,
    pub addendum: String,
    pub builtin: SharedEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopRecord {
    pub statement: String,
    pub partition_id: PartitionId,
    pub statement_level: bool,
}

/// Statement runtime that records starts and stops, with injectable failures.
#[derive(Default)]
pub struct RecordingRuntime {
    started: Mutex<Vec<StartRecord>>,
    stopped: Mutex<Vec<StopRecord>>,
    fail_start: Mutex<HashSet<(String, PartitionId)>>,
    fail_stop: Mutex<HashSet<String>>,
}

impl RecordingRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make starting `statement` in `partition_id` fail.
    pub fn fail_start_on(&self, statement: &str, partition_id: PartitionId) {
        self.fail_start
            .lock()
            .unwrap()
            .insert((statement.to_string(), partition_id));
    }

    /// Make every instance of `statement` started from now on fail to stop.
    pub fn fail_stops_of(&self, statement: &str) {
        self.fail_stop.lock().unwrap().insert(statement.to_string());
    }

    pub fn started(&self) -> Vec<StartRecord> {
        self.started.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<StopRecord> {
        self.stopped.lock().unwrap().clone()
    }

    /// Recorded addendum strings of one statement, by partition id.
    pub fn addenda(&self, statement: &str) -> Vec<(PartitionId, String)> {
        self.started()
            .into_iter()
            .filter(|r| r.statement == statement)
            .map(|r| (r.partition_id, r.addendum))
            .collect()
    }

    /// Built-in properties event of the most recent start in a partition.
    pub fn builtin(&self, partition_id: PartitionId) -> Option<SharedEvent> {
        self.started()
            .into_iter()
            .rev()
            .find(|r| r.partition_id == partition_id)
            .map(|r| r.builtin)
    }
}

impl StatementRuntime for RecordingRuntime {
    fn start(&self, request: AgentStartRequest<'_>) -> Result<AgentInstance, BoxError> {
        let name = request.statement.name.clone();
        if self
            .fail_start
            .lock()
            .unwrap()
            .contains(&(name.clone(), request.partition_id))
        {
            return Err(format!("cannot start {} in {}", name, request.partition_id).into());
        }
        self.started.lock().unwrap().push(StartRecord {
            statement: name.clone(),
            partition_id: request.partition_id,
            is_recovery: request.is_recovery,
            addendum: request.filter_addendum.to_string(),
            builtin: Arc::clone(&request.builtin_properties),
        });
        let context = AgentInstanceContext::from_request(&request);
        let agent = AgentInstance::new(
            Arc::clone(request.statement),
            context,
            Box::new(CollectingView::new()),
        );
        if self.fail_stop.lock().unwrap().contains(&name) {
            return Ok(agent.with_stop_callback(|| Err("stop failed".into())));
        }
        Ok(agent)
    }

    fn stop(&self, instance: AgentInstance, statement_level: bool) -> Result<(), BoxError> {
        self.stopped.lock().unwrap().push(StopRecord {
            statement: instance.statement().name.clone(),
            partition_id: instance.partition_id(),
            statement_level,
        });
        instance.stop()
    }
}

pub fn bean(the_string: &str, int_primitive: i64) -> SharedEvent {
    Event::new("SupportBean")
        .with_field("theString", the_string)
        .with_field("intPrimitive", int_primitive)
        .into_shared()
}

pub fn statement(id: u64, name: &str) -> Arc<StatementDescriptor> {
    Arc::new(StatementDescriptor::new(id, name).with_filter(FilterSpec::new("SupportBean").shared()))
}

pub fn keyed(name: &str, property: &str) -> Arc<dyn ControllerFactory> {
    Arc::new(KeyedFactory::new(name, vec![KeyedItem::new("SupportBean", [property])]).unwrap())
}

/// Category level over `intPrimitive` with one half-open range per label.
pub fn int_ranges(name: &str, ranges: &[(&str, i64, i64)]) -> Arc<dyn ControllerFactory> {
    let items = ranges
        .iter()
        .map(|(label, low, high)| {
            CategoryItem::new(*label, vec![FilterConstraint::range("intPrimitive", *low, *high)])
        })
        .collect();
    Arc::new(CategoryFactory::new(name, "SupportBean", items).unwrap())
}
