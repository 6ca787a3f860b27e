//! Statements and the agent instances that run them inside one partition.
//!
//! The orchestrator never executes statements itself. It asks a
//! [`StatementRuntime`] to start one [`AgentInstance`] per statement per
//! leaf partition, handing it the partition's built-in properties and the
//! filter constraints merged from every nesting level, and asks it to stop
//! the instance when the partition ends or the statement is destroyed.

use crate::controller::{PartitionId, PropertyMap};
use crate::event::SharedEvent;
use crate::filter::{FilterAddendum, FilterSpec};
use std::fmt;
use std::sync::Arc;

/// Error type returned by statement runtimes and stop callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type StopCallback = Box<dyn FnOnce() -> Result<(), BoxError> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatementId(pub u64);

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stmt-{}", self.0)
    }
}

/// A compiled statement as seen by the context layer: its identity and the
/// event filters it consumes through.
#[derive(Debug, Clone)]
pub struct StatementDescriptor {
    pub id: StatementId,
    pub name: String,
    pub filters: Vec<Arc<FilterSpec>>,
}

impl StatementDescriptor {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id: StatementId(id),
            name: name.into(),
            filters: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: Arc<FilterSpec>) -> Self {
        self.filters.push(filter);
        self
    }
}

/// Everything a runtime needs to start one statement in one partition.
pub struct AgentStartRequest<'a> {
    pub statement: &'a Arc<StatementDescriptor>,
    pub partition_id: PartitionId,
    /// The partition is being recreated from external state
    pub is_recovery: bool,
    /// Synthetic `ContextProperties_<name>` event for this partition
    pub builtin_properties: SharedEvent,
    /// Constraints contributed by every nesting level for this partition
    pub filter_addendum: FilterAddendum,
}

/// Execution context of one agent instance.
#[derive(Debug, Clone)]
pub struct AgentInstanceContext {
    pub statement_id: StatementId,
    pub partition_id: PartitionId,
    pub builtin_properties: SharedEvent,
    pub filter_addendum: FilterAddendum,
}

impl AgentInstanceContext {
    pub fn from_request(request: &AgentStartRequest<'_>) -> Self {
        Self {
            statement_id: request.statement.id,
            partition_id: request.partition_id,
            builtin_properties: Arc::clone(&request.builtin_properties),
            filter_addendum: request.filter_addendum.clone(),
        }
    }
}

/// Terminal output view of an agent instance.
pub trait OutputView: Send {
    fn process(&mut self, event: &SharedEvent);

    /// Current output rows.
    fn rows(&self) -> Box<dyn Iterator<Item = SharedEvent> + '_>;

    /// Called once when the instance stops.
    fn detach(&mut self, _termination_properties: Option<&PropertyMap>) {}
}

/// Output view that keeps every event it is given.
#[derive(Debug, Default)]
pub struct CollectingView {
    events: Vec<SharedEvent>,
    detached: bool,
}

impl CollectingView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }
}

impl OutputView for CollectingView {
    fn process(&mut self, event: &SharedEvent) {
        if !self.detached {
            self.events.push(Arc::clone(event));
        }
    }

    fn rows(&self) -> Box<dyn Iterator<Item = SharedEvent> + '_> {
        Box::new(self.events.iter().cloned())
    }

    fn detach(&mut self, _termination_properties: Option<&PropertyMap>) {
        self.detached = true;
    }
}

/// One running execution of one statement inside one partition.
pub struct AgentInstance {
    statement: Arc<StatementDescriptor>,
    context: AgentInstanceContext,
    view: Box<dyn OutputView>,
    stop_callback: Option<StopCallback>,
    termination_properties: Option<PropertyMap>,
}

impl AgentInstance {
    pub fn new(
        statement: Arc<StatementDescriptor>,
        context: AgentInstanceContext,
        view: Box<dyn OutputView>,
    ) -> Self {
        Self {
            statement,
            context,
            view,
            stop_callback: None,
            termination_properties: None,
        }
    }

    pub fn with_stop_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        self.stop_callback = Some(Box::new(callback));
        self
    }

    pub fn statement(&self) -> &Arc<StatementDescriptor> {
        &self.statement
    }

    pub fn statement_id(&self) -> StatementId {
        self.context.statement_id
    }

    pub fn partition_id(&self) -> PartitionId {
        self.context.partition_id
    }

    pub fn context(&self) -> &AgentInstanceContext {
        &self.context
    }

    /// Whether any of the statement's filters, narrowed by this partition's
    /// addendum, accepts the event.
    pub fn accepts(&self, event: &SharedEvent) -> bool {
        self.statement
            .filters
            .iter()
            .any(|f| self.context.filter_addendum.matches(f, event))
    }

    /// Offer an event to the instance. Returns whether it was processed.
    pub fn evaluate(&mut self, event: &SharedEvent) -> bool {
        if !self.accepts(event) {
            return false;
        }
        self.view.process(event);
        true
    }

    pub fn rows(&self) -> Box<dyn Iterator<Item = SharedEvent> + '_> {
        self.view.rows()
    }

    pub fn set_termination_properties(&mut self, properties: PropertyMap) {
        self.termination_properties = Some(properties);
    }

    /// Detach the output view, then run the stop callback.
    pub fn stop(mut self) -> Result<(), BoxError> {
        self.view.detach(self.termination_properties.as_ref());
        match self.stop_callback.take() {
            Some(callback) => callback(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for AgentInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentInstance")
            .field("statement", &self.statement.name)
            .field("partition_id", &self.context.partition_id)
            .field("filter_addendum", &self.context.filter_addendum.to_string())
            .finish()
    }
}

/// The statement-execution runtime the orchestrator drives.
pub trait StatementRuntime: Send + Sync {
    /// Start one statement inside one partition.
    fn start(&self, request: AgentStartRequest<'_>) -> Result<AgentInstance, BoxError>;

    /// Stop an instance. `statement_level` is true when the statement itself
    /// is being destroyed rather than the partition.
    fn stop(&self, instance: AgentInstance, statement_level: bool) -> Result<(), BoxError> {
        let _ = statement_level;
        instance.stop()
    }
}

/// Runtime that starts every statement with a [`CollectingView`].
#[derive(Debug, Default, Clone, Copy)]
pub struct CollectingRuntime;

impl StatementRuntime for CollectingRuntime {
    fn start(&self, request: AgentStartRequest<'_>) -> Result<AgentInstance, BoxError> {
        let context = AgentInstanceContext::from_request(&request);
        Ok(AgentInstance::new(
            Arc::clone(request.statement),
            context,
            Box::new(CollectingView::new()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::filter::FilterConstraint;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn instance() -> AgentInstance {
        let filter = FilterSpec::new("SupportBean").shared();
        let stmt = Arc::new(StatementDescriptor::new(1, "s0").with_filter(filter));
        let context = AgentInstanceContext {
            statement_id: stmt.id,
            partition_id: 0,
            builtin_properties: Event::new("ContextProperties_ctx").into_shared(),
            filter_addendum: FilterAddendum::new(),
        };
        AgentInstance::new(stmt, context, Box::new(CollectingView::new()))
    }

    #[test]
    fn test_evaluate_respects_statement_filter() {
        let mut agent = instance();
        let bean = Event::new("SupportBean").with_field("theString", "E1").into_shared();
        let other = Event::new("Other").into_shared();
        assert!(agent.evaluate(&bean));
        assert!(!agent.evaluate(&other));
        assert_eq!(agent.rows().count(), 1);
    }

    #[test]
    fn test_evaluate_respects_addendum() {
        let filter = FilterSpec::new("SupportBean").shared();
        let stmt = Arc::new(StatementDescriptor::new(1, "s0").with_filter(Arc::clone(&filter)));
        let mut addendum = FilterAddendum::new();
        addendum.add(&filter, [FilterConstraint::equal("theString", "E1")]);
        let context = AgentInstanceContext {
            statement_id: stmt.id,
            partition_id: 3,
            builtin_properties: Event::new("ContextProperties_ctx").into_shared(),
            filter_addendum: addendum,
        };
        let mut agent = AgentInstance::new(stmt, context, Box::new(CollectingView::new()));

        let e1 = Event::new("SupportBean").with_field("theString", "E1").into_shared();
        let e2 = Event::new("SupportBean").with_field("theString", "E2").into_shared();
        assert!(agent.evaluate(&e1));
        assert!(!agent.evaluate(&e2));
        assert_eq!(agent.partition_id(), 3);
    }

    #[test]
    fn test_stop_runs_callback_once() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let agent = instance();
        let agent = agent.with_stop_callback(move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        agent.stop().unwrap();
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_reports_callback_failure() {
        let agent = instance();
        let agent = agent.with_stop_callback(|| Err("boom".into()));
        let err = agent.stop().unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_collecting_view_ignores_events_after_detach() {
        let mut view = CollectingView::new();
        let e = Event::new("T").into_shared();
        view.process(&e);
        view.detach(None);
        view.process(&e);
        assert!(view.is_detached());
        assert_eq!(view.rows().count(), 1);
    }
}
