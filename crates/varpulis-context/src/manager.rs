//! The nested context-partition orchestrator.
//!
//! [`NestedContextManager`] owns one nested context instance: the controller
//! tree, the partition id allocator and the registered statements. Level N
//! of the declaration is served by factory N; the root controller is created
//! when the first statement attaches and the whole tree is torn down when
//! the last one detaches.
//!
//! Controllers call back into the manager through [`PartitionLifecycle`].
//! While a controller runs it is lent out of its tree entry, so a callback
//! can create and activate further controllers (which in turn call back)
//! without aliasing anything the manager owns.

use crate::config::{ContextConfig, ManagerConfig};
use crate::controller::{
    Activation, ContextController, ControllerFactory, ControllerId, ExternalState, InstanceHandle,
    InstantiateRequest, PartitionId, PartitionKey, PartitionLifecycle, PropertyMap,
    RecoveredPartition, ValidationCache,
};
use crate::descriptor::{BuiltinProperties, ContextDescriptor};
use crate::error::{ContextError, Result};
use crate::event::SharedEvent;
use crate::filter::FilterAddendum;
use crate::metrics::ContextMetrics;
use crate::partition_id::PartitionIdAllocator;
use crate::selector::ContextPartitionSelector;
use crate::statement::{
    AgentInstance, AgentStartRequest, StatementDescriptor, StatementId, StatementRuntime,
};
use crate::tree::{ControllerTree, RunningInstance, TreeEntry};
use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use std::collections::{BTreeSet, HashSet};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct StatementEntry {
    descriptor: Arc<StatementDescriptor>,
    /// One per nesting level
    caches: Vec<ValidationCache>,
}

/// Orchestrates one nested context declaration.
pub struct NestedContextManager {
    descriptor: ContextDescriptor,
    factories: Vec<Arc<dyn ControllerFactory>>,
    runtime: Arc<dyn StatementRuntime>,
    statements: IndexMap<StatementId, StatementEntry>,
    pub(crate) tree: ControllerTree,
    pub(crate) ids: PartitionIdAllocator,
    options: ManagerConfig,
    metrics: Option<Arc<ContextMetrics>>,
    recovery: Option<ExternalState>,
    /// Never reset, not even by a full teardown
    next_generation: u64,
    now_ms: i64,
}

impl NestedContextManager {
    /// Create a manager for a declaration with one factory per nesting level,
    /// outermost first.
    pub fn new(
        name: impl Into<String>,
        factories: Vec<Arc<dyn ControllerFactory>>,
        runtime: Arc<dyn StatementRuntime>,
    ) -> Result<Self> {
        let name = name.into();
        if factories.is_empty() {
            return Err(ContextError::EmptyDeclaration(name));
        }
        let mut seen = HashSet::new();
        for factory in &factories {
            if !seen.insert(factory.name()) {
                return Err(ContextError::DuplicateContextName {
                    context: name,
                    name: factory.name().to_string(),
                });
            }
        }
        let descriptor = ContextDescriptor::new(name, &factories);
        let options = ManagerConfig::default();
        Ok(Self {
            descriptor,
            factories,
            runtime,
            statements: IndexMap::new(),
            tree: ControllerTree::new(),
            ids: PartitionIdAllocator::new(options.reuse_partition_ids),
            options,
            metrics: None,
            recovery: None,
            next_generation: 0,
            now_ms: 0,
        })
    }

    /// Build a manager from a loaded configuration file.
    pub fn from_config(config: &ContextConfig, runtime: Arc<dyn StatementRuntime>) -> Result<Self> {
        let factories = config.build_factories()?;
        Ok(Self::new(config.name.clone(), factories, runtime)?.with_options(config.manager.clone()))
    }

    pub fn with_options(mut self, options: ManagerConfig) -> Self {
        self.ids = PartitionIdAllocator::new(options.reuse_partition_ids);
        self.options = options;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ContextMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Partition assignments to reuse when the root activates, so a replayed
    /// or relocated context recreates the same partitions under the same ids.
    pub fn with_recovery_state(mut self, state: ExternalState) -> Self {
        self.recovery = Some(state);
        self
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ContextDescriptor {
        &self.descriptor
    }

    /// Number of nesting levels.
    pub fn depth(&self) -> usize {
        self.factories.len()
    }

    pub fn is_active(&self) -> bool {
        self.tree.root().is_some()
    }

    pub fn root_id(&self) -> Option<ControllerId> {
        self.tree.root()
    }

    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    pub fn partition_count(&self) -> usize {
        self.ids.len()
    }

    /// Partition ids currently in use, ascending.
    pub fn allocated_ids(&self) -> Vec<PartitionId> {
        self.ids.ids().collect()
    }

    /// Number of live controllers.
    pub fn tree_size(&self) -> usize {
        self.tree.len()
    }

    /// Whether the tree links and the allocator agree with each other.
    pub fn is_consistent(&self) -> bool {
        let live: BTreeSet<PartitionId> = self.tree.records().map(|(pid, _)| pid).collect();
        self.tree.is_consistent() && live == self.ids.ids().collect::<BTreeSet<_>>()
    }

    pub fn now_ms(&self) -> i64 {
        self.now_ms
    }

    // ---------------------------------------------------------------------
    // Statements
    // ---------------------------------------------------------------------

    /// Attach a statement. The first statement activates the root
    /// controller; later ones get an agent instance in every existing leaf
    /// partition. On failure nothing stays attached.
    pub fn add_statement(&mut self, statement: Arc<StatementDescriptor>) -> Result<()> {
        let id = statement.id;
        if self.statements.contains_key(&id) {
            return Err(ContextError::DuplicateStatement(id));
        }
        let caches = self
            .factories
            .iter()
            .map(|f| f.validate_statement(&statement))
            .collect::<Result<Vec<_>>>()?;
        self.statements.insert(
            id,
            StatementEntry {
                descriptor: Arc::clone(&statement),
                caches,
            },
        );
        info!(
            "Context '{}' attached statement '{}' ({})",
            self.descriptor.name, statement.name, id
        );

        if self.tree.root().is_none() {
            if let Err(e) = self.activate_root() {
                self.statements.shift_remove(&id);
                if let Err(stop_err) = self.teardown(false) {
                    warn!(
                        "Context '{}' rollback after failed activation: {}",
                        self.descriptor.name, stop_err
                    );
                }
                return Err(e);
            }
            return Ok(());
        }

        let mut started: Vec<(ControllerId, PartitionId)> = Vec::new();
        for (controller, partition_id) in self.tree.leaf_partitions() {
            let agent = self.tree.get(controller).and_then(|e| {
                e.instances.get(&partition_id).map(|r| {
                    self.start_agent(id, controller, partition_id, &r.key, &r.properties, false)
                })
            });
            match agent {
                Some(Ok(agent)) => {
                    if let Some(record) = self.record_mut(controller, partition_id) {
                        record.agents.push(agent);
                        started.push((controller, partition_id));
                    }
                }
                Some(Err(e)) => {
                    self.rollback_statement(id, &started);
                    return Err(e);
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Undo a partially applied [`add_statement`](Self::add_statement).
    fn rollback_statement(&mut self, id: StatementId, started: &[(ControllerId, PartitionId)]) {
        for (controller, partition_id) in started {
            let agent = self.record_mut(*controller, *partition_id).and_then(|r| {
                let pos = r.agents.iter().rposition(|a| a.statement_id() == id)?;
                Some(r.agents.remove(pos))
            });
            if let Some(agent) = agent {
                if let Err(e) = self.stop_agents(*partition_id, vec![agent], None, true) {
                    warn!("Context '{}' rollback: {}", self.descriptor.name, e);
                }
            }
        }
        self.statements.shift_remove(&id);
    }

    /// Detach a statement. Detaching the last statement tears the whole
    /// tree down and releases every partition id.
    pub fn destroy_statement(&mut self, name: &str, id: StatementId) -> Result<()> {
        if !self.statements.contains_key(&id) {
            return Err(ContextError::UnknownStatement(id));
        }
        info!(
            "Context '{}' detaching statement '{}' ({})",
            self.descriptor.name, name, id
        );
        if self.statements.len() == 1 {
            self.statements.shift_remove(&id);
            return self.teardown(true);
        }
        self.statements.shift_remove(&id);

        let mut first_err = None;
        for (controller, partition_id) in self.tree.leaf_partitions() {
            let Some(record) = self.record_mut(controller, partition_id) else {
                continue;
            };
            let (stopping, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut record.agents)
                .into_iter()
                .partition(|a| a.statement_id() == id);
            record.agents = kept;
            if let Err(e) = self.stop_agents(partition_id, stopping, None, true) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    // ---------------------------------------------------------------------
    // Activation and teardown
    // ---------------------------------------------------------------------

    fn activate_root(&mut self) -> Result<()> {
        let id = self.tree.next_id();
        let controller = Arc::clone(&self.factories[0]).create(id, 0, 1);
        self.tree.insert_root(id, TreeEntry::root(controller));
        info!(
            "Context '{}' activated with {} nesting level(s)",
            self.descriptor.name,
            self.depth()
        );
        // Recovery applies to the first successful activation only.
        let external = self.recovery.take();
        let now_ms = self.now_ms;
        let activated = self.with_controller(id, |controller, lifecycle| {
            controller.activate(
                lifecycle,
                Activation {
                    trigger_event: None,
                    trigger_match: None,
                    external_state: external.as_ref(),
                    now_ms,
                },
            )
        });
        if activated.is_err() {
            self.recovery = external;
        }
        activated.map(|_| ())
    }

    /// Remove the whole tree and release every id.
    fn teardown(&mut self, statement_level: bool) -> Result<()> {
        let result = match self.tree.root() {
            Some(root) => self.remove_subtree(root, None, statement_level),
            None => Ok(()),
        };
        self.tree.clear();
        self.ids.clear();
        self.update_gauge();
        info!("Context '{}' deactivated", self.descriptor.name);
        result
    }

    /// Remove `id` and its descendants, children first. Every controller is
    /// deactivated and every agent instance stopped even if some stops fail.
    fn remove_subtree(
        &mut self,
        id: ControllerId,
        termination_properties: Option<&PropertyMap>,
        statement_level: bool,
    ) -> Result<()> {
        let mut first_err = None;
        for controller_id in self.tree.subtree(id) {
            let Some(mut entry) = self.tree.remove(controller_id) else {
                continue;
            };
            if let Some(mut controller) = entry.controller.take() {
                controller.deactivate();
            }
            for (partition_id, record) in std::mem::take(&mut entry.instances) {
                if let Err(e) = self.stop_agents(
                    partition_id,
                    record.agents,
                    termination_properties,
                    statement_level,
                ) {
                    first_err.get_or_insert(e);
                }
                self.ids.remove(partition_id);
                self.on_partition_terminated(partition_id);
            }
        }
        self.update_gauge();
        first_err.map_or(Ok(()), Err)
    }

    /// Stop agent instances in order. Keeps going after a failure and
    /// reports the first one.
    fn stop_agents(
        &self,
        partition_id: PartitionId,
        agents: Vec<AgentInstance>,
        termination_properties: Option<&PropertyMap>,
        statement_level: bool,
    ) -> Result<()> {
        let mut first_err = None;
        for mut agent in agents {
            if let Some(props) = termination_properties {
                agent.set_termination_properties(props.clone());
            }
            let statement = agent.statement().name.clone();
            match self.runtime.stop(agent, statement_level) {
                Ok(()) => {
                    if let Some(m) = &self.metrics {
                        m.agent_instances_stopped
                            .with_label_values(&[&self.descriptor.name])
                            .inc();
                    }
                }
                Err(e) => {
                    warn!(
                        "Context '{}' failed to stop '{}' in partition {}: {}",
                        self.descriptor.name, statement, partition_id, e
                    );
                    if let Some(m) = &self.metrics {
                        m.stop_failures
                            .with_label_values(&[&self.descriptor.name])
                            .inc();
                    }
                    first_err.get_or_insert(ContextError::AgentStop {
                        statement,
                        partition_id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    // ---------------------------------------------------------------------
    // Controller callbacks
    // ---------------------------------------------------------------------

    /// Run `f` with controller `id` lent out of the tree. Returns `None` if
    /// the controller is gone or already running further up the stack.
    fn with_controller<R, F>(&mut self, id: ControllerId, f: F) -> Result<Option<R>>
    where
        F: FnOnce(&mut dyn ContextController, &mut dyn PartitionLifecycle) -> Result<R>,
    {
        let Some(mut controller) = self.tree.lend(id) else {
            return Ok(None);
        };
        let result = f(controller.as_mut(), &mut *self);
        if let Err(mut orphan) = self.tree.restore(id, controller) {
            debug!(
                "Context '{}' controller {} was removed during its own callback",
                self.descriptor.name, id
            );
            orphan.deactivate();
        }
        result.map(Some)
    }

    fn instantiate_branch(
        &mut self,
        request: InstantiateRequest<'_>,
        parent_level: usize,
    ) -> Result<InstanceHandle> {
        let parent = request.originator;
        let child = self.tree.next_id();
        let level = parent_level + 1;
        let controller = Arc::clone(&self.factories[parent_level]).create(child, request.path_id, level);
        self.tree.insert_child(
            child,
            TreeEntry::branch(
                controller,
                parent,
                request.path_id,
                level,
                request.partition_key.clone(),
                request.context_properties.clone(),
            ),
        )?;
        debug!(
            "Context '{}' created level {} controller {} for {}",
            self.descriptor.name, level, child, request.partition_key
        );

        let now_ms = self.now_ms;
        let activated = self.with_controller(child, |controller, lifecycle| {
            controller.activate(
                lifecycle,
                Activation {
                    trigger_event: request.trigger_event,
                    trigger_match: request.trigger_match,
                    external_state: request.external_state.as_ref(),
                    now_ms,
                },
            )
        });
        if let Err(e) = activated {
            if let Err(stop_err) = self.remove_subtree(child, None, false) {
                warn!(
                    "Context '{}' rollback of {}: {}",
                    self.descriptor.name, child, stop_err
                );
            }
            return Err(e);
        }
        Ok(InstanceHandle::Branch {
            parent,
            path_id: request.path_id,
            child,
        })
    }

    fn instantiate_leaf(&mut self, request: InstantiateRequest<'_>) -> Result<InstanceHandle> {
        let controller = request.originator;
        if let Some(limit) = self.options.max_partitions {
            if self.ids.len() >= limit {
                return Err(ContextError::PartitionLimit {
                    context: self.descriptor.name.clone(),
                    limit,
                });
            }
        }
        let partition_id = match request.assigned_id {
            Some(id) => {
                if !self.ids.add(id) {
                    return Err(ContextError::PartitionIdInUse(id));
                }
                id
            }
            None => self.ids.allocate(),
        };
        let is_recovery = request.external_state.is_some();

        let mut properties = request.context_properties;
        if let Some(pattern) = request.trigger_match {
            for (tag, event) in pattern {
                properties.insert(tag.clone(), event.to_value());
            }
        }

        let mut agents: Vec<AgentInstance> = Vec::with_capacity(self.statements.len());
        for statement in self.statements.keys().copied().collect::<Vec<_>>() {
            match self.start_agent(
                statement,
                controller,
                partition_id,
                &request.partition_key,
                &properties,
                is_recovery,
            ) {
                Ok(agent) => agents.push(agent),
                Err(e) => {
                    if let Err(stop_err) = self.stop_agents(partition_id, agents, None, false) {
                        warn!(
                            "Context '{}' rollback of partition {}: {}",
                            self.descriptor.name, partition_id, stop_err
                        );
                    }
                    self.ids.remove(partition_id);
                    return Err(e);
                }
            }
        }

        if let Some(event) = request.trigger_event {
            for agent in agents.iter_mut() {
                agent.evaluate(event);
            }
        }

        let Some(entry) = self.tree.get_mut(controller) else {
            if let Err(e) = self.stop_agents(partition_id, agents, None, false) {
                warn!("Context '{}' rollback of partition {}: {}", self.descriptor.name, partition_id, e);
            }
            self.ids.remove(partition_id);
            return Err(ContextError::UnknownController(controller));
        };
        let generation = self.next_generation;
        self.next_generation += 1;
        entry.instances.insert(
            partition_id,
            RunningInstance {
                generation,
                key: request.partition_key.clone(),
                properties,
                agents,
            },
        );
        debug!(
            "Context '{}' started partition {} for {}",
            self.descriptor.name, partition_id, request.partition_key
        );
        if let Some(m) = &self.metrics {
            m.partitions_created
                .with_label_values(&[&self.descriptor.name])
                .inc();
        }
        self.update_gauge();
        Ok(InstanceHandle::Leaf {
            controller,
            partition_id,
            generation,
        })
    }

    fn terminate_leaf(
        &mut self,
        handle: &InstanceHandle,
        controller: ControllerId,
        partition_id: PartitionId,
        generation: u64,
        termination_properties: Option<&PropertyMap>,
    ) -> Result<()> {
        let Some(record) = self
            .tree
            .get_mut(controller)
            .filter(|e| {
                e.instances
                    .get(&partition_id)
                    .is_some_and(|r| r.generation == generation)
            })
            .and_then(|e| e.instances.remove(&partition_id))
        else {
            debug!(
                "Context '{}' ignoring stale partition {}",
                self.descriptor.name, partition_id
            );
            return Ok(());
        };
        let result = self.stop_agents(partition_id, record.agents, termination_properties, false);
        self.ids.remove(partition_id);
        self.on_partition_terminated(partition_id);
        self.update_gauge();
        self.notify_owner(controller, handle);
        result
    }

    fn terminate_branch(
        &mut self,
        handle: &InstanceHandle,
        parent: ControllerId,
        path_id: u32,
        child: ControllerId,
        termination_properties: Option<&PropertyMap>,
    ) -> Result<()> {
        let linked = self
            .tree
            .get(child)
            .is_some_and(|e| e.parent == Some(parent) && e.path_id == path_id);
        if !linked {
            debug!(
                "Context '{}' ignoring stale branch {}",
                self.descriptor.name, child
            );
            return Ok(());
        }
        let result = self.remove_subtree(child, termination_properties, false);
        self.notify_owner(parent, handle);
        result
    }

    /// Tell the controller that owns `handle` it is gone, unless that
    /// controller is the one currently terminating it.
    fn notify_owner(&mut self, owner: ControllerId, handle: &InstanceHandle) {
        if let Some(controller) = self.tree.get_mut(owner).and_then(|e| e.controller.as_mut()) {
            controller.child_terminated(handle);
        }
    }

    fn on_partition_terminated(&self, partition_id: PartitionId) {
        debug!(
            "Context '{}' terminated partition {}",
            self.descriptor.name, partition_id
        );
        if let Some(m) = &self.metrics {
            m.partitions_terminated
                .with_label_values(&[&self.descriptor.name])
                .inc();
        }
    }

    fn update_gauge(&self) {
        if let Some(m) = &self.metrics {
            m.active_partitions
                .with_label_values(&[&self.descriptor.name])
                .set(self.ids.len() as i64);
        }
    }

    fn record_mut(
        &mut self,
        controller: ControllerId,
        partition_id: PartitionId,
    ) -> Option<&mut RunningInstance> {
        self.tree
            .get_mut(controller)
            .and_then(|e| e.instances.get_mut(&partition_id))
    }

    // ---------------------------------------------------------------------
    // Agent instances
    // ---------------------------------------------------------------------

    fn start_agent(
        &self,
        statement: StatementId,
        controller: ControllerId,
        partition_id: PartitionId,
        key: &PartitionKey,
        properties: &PropertyMap,
        is_recovery: bool,
    ) -> Result<AgentInstance> {
        let entry = self
            .statements
            .get(&statement)
            .ok_or(ContextError::UnknownStatement(statement))?;
        let filter_addendum = self.filter_addendum(entry, controller, partition_id, key);
        let builtin_properties = self.builtin_properties(controller, partition_id, key, properties);
        let request = AgentStartRequest {
            statement: &entry.descriptor,
            partition_id,
            is_recovery,
            builtin_properties,
            filter_addendum,
        };
        let agent = self
            .runtime
            .start(request)
            .map_err(|e| ContextError::AgentStart {
                statement: entry.descriptor.name.clone(),
                partition_id,
                reason: e.to_string(),
            })?;
        if let Some(m) = &self.metrics {
            m.agent_instances_started
                .with_label_values(&[&self.descriptor.name])
                .inc();
        }
        Ok(agent)
    }

    /// Merge every level's constraints for one leaf partition. The leaf's
    /// own factory contributes for the partition key; each ancestor level
    /// contributes for the key of the branch on the path. Contributions are
    /// merged root level first.
    fn filter_addendum(
        &self,
        statement: &StatementEntry,
        controller: ControllerId,
        partition_id: PartitionId,
        key: &PartitionKey,
    ) -> FilterAddendum {
        let mut contributions: Vec<(usize, &PartitionKey, Option<PartitionId>)> = Vec::new();
        let mut level = self.tree.get(controller).map_or(self.depth(), |e| e.level);
        contributions.push((level, key, Some(partition_id)));
        for ancestor in self.tree.ancestry(controller) {
            let Some(entry) = self.tree.get(ancestor) else {
                break;
            };
            if let Some(branch_key) = &entry.partition_key {
                level = entry.level - 1;
                contributions.push((level, branch_key, None));
            }
        }

        let mut addendum = FilterAddendum::new();
        for (level, key, partition_id) in contributions.into_iter().rev() {
            let (Some(factory), Some(cache)) = (
                self.factories.get(level - 1),
                statement.caches.get(level - 1),
            ) else {
                continue;
            };
            factory.populate_filter_addendum(&mut addendum, cache, key, partition_id);
        }
        addendum
    }

    /// Each level's built-in property values for one leaf partition, root
    /// level first, wrapped in the synthetic properties event.
    fn builtin_properties(
        &self,
        controller: ControllerId,
        partition_id: PartitionId,
        key: &PartitionKey,
        properties: &PropertyMap,
    ) -> SharedEvent {
        let leaf_level = self.tree.get(controller).map_or(self.depth(), |e| e.level);
        let mut levels = vec![self.factories[leaf_level - 1].partition_properties(key, properties)];
        for ancestor in self.tree.ancestry(controller) {
            let Some(entry) = self.tree.get(ancestor) else {
                break;
            };
            if let Some(branch_key) = &entry.partition_key {
                let factory = &self.factories[entry.level - 2];
                levels.push(factory.partition_properties(branch_key, &entry.context_properties));
            }
        }
        levels.reverse();
        BuiltinProperties::new(&self.descriptor).build(partition_id, levels)
    }

    // ---------------------------------------------------------------------
    // Event routing and time
    // ---------------------------------------------------------------------

    /// Route one event top-down through the tree. Controllers on the way may
    /// start partitions for it; at the leaves it is offered to every agent
    /// instance whose merged filter accepts it.
    pub fn process_event(&mut self, event: &SharedEvent) -> Result<()> {
        match self.tree.root() {
            Some(root) => self.route(root, event),
            None => Ok(()),
        }
    }

    fn route(&mut self, id: ControllerId, event: &SharedEvent) -> Result<()> {
        let Some(targets) =
            self.with_controller(id, |controller, lifecycle| controller.on_event(lifecycle, event))?
        else {
            return Ok(());
        };
        for handle in targets {
            match handle {
                InstanceHandle::Branch { child, .. } => self.route(child, event)?,
                InstanceHandle::Leaf {
                    controller,
                    partition_id,
                    generation,
                } => {
                    if let Some(record) = self
                        .record_mut(controller, partition_id)
                        .filter(|r| r.generation == generation)
                    {
                        for agent in record.agents.iter_mut() {
                            agent.evaluate(event);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Advance the clock and let every live controller react, top-down.
    pub fn advance_time(&mut self, now_ms: i64) -> Result<()> {
        self.now_ms = now_ms;
        for id in self.tree.ids_top_down() {
            self.with_controller(id, |controller, lifecycle| controller.on_time(lifecycle, now_ms))?;
        }
        Ok(())
    }

    /// Restrict the partitions of every controller at `level` (root = 1).
    pub fn set_context_partition_range(&mut self, level: usize, ranges: &[Range<i64>]) -> Result<()> {
        if level == 0 || level > self.depth() {
            return Err(ContextError::Unsupported(format!(
                "context '{}' has no nesting level {}",
                self.descriptor.name, level
            )));
        }
        for id in self.tree.ids_at_level(level) {
            self.with_controller(id, |controller, lifecycle| {
                controller.set_partition_range(lifecycle, ranges)
            })?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Lookup and iteration
    // ---------------------------------------------------------------------

    /// Handle of the partition reached by following `keys` from the root.
    /// Fewer keys than levels yield a branch handle.
    pub fn find_handle(&self, keys: &[PartitionKey]) -> Option<InstanceHandle> {
        let (last, path) = keys.split_last()?;
        let mut current = self.tree.root()?;
        for key in path {
            current = self.child_by_key(current, key)?;
        }
        let entry = self.tree.get(current)?;
        if let Some(child) = self.child_by_key(current, last) {
            let child_entry = self.tree.get(child)?;
            return Some(InstanceHandle::Branch {
                parent: current,
                path_id: child_entry.path_id,
                child,
            });
        }
        entry
            .instances
            .iter()
            .find(|(_, r)| &r.key == last)
            .map(|(pid, r)| InstanceHandle::Leaf {
                controller: current,
                partition_id: *pid,
                generation: r.generation,
            })
    }

    fn child_by_key(&self, id: ControllerId, key: &PartitionKey) -> Option<ControllerId> {
        self.tree.get(id)?.children.values().copied().find(|child| {
            self.tree
                .get(*child)
                .is_some_and(|e| e.partition_key.as_ref() == Some(key))
        })
    }

    /// Partition keys from the root down to a leaf partition.
    pub fn partition_path(&self, partition_id: PartitionId) -> Option<Vec<PartitionKey>> {
        let (controller, key) = self
            .tree
            .leaf_partitions()
            .into_iter()
            .find(|(_, pid)| *pid == partition_id)
            .and_then(|(c, pid)| Some((c, self.tree.get(c)?.instances.get(&pid)?.key.clone())))?;
        let mut path = vec![key];
        for ancestor in self.tree.ancestry(controller) {
            if let Some(key) = self.tree.get(ancestor).and_then(|e| e.partition_key.clone()) {
                path.push(key);
            }
        }
        path.reverse();
        Some(path)
    }

    /// Agent instances of `statement` in the selected partitions.
    fn selected_agents(
        &self,
        statement: StatementId,
        selector: Option<&ContextPartitionSelector>,
    ) -> Result<Vec<&AgentInstance>> {
        if !self.statements.contains_key(&statement) {
            return Err(ContextError::UnknownStatement(statement));
        }
        let selected = self.selected_partition_ids(selector.unwrap_or(&ContextPartitionSelector::All))?;
        Ok(self
            .tree
            .records()
            .filter(|(pid, _)| selected.contains(pid))
            .flat_map(move |(_, r)| r.agents.iter().filter(move |a| a.statement_id() == statement))
            .collect())
    }

    /// Output rows of a statement across the selected partitions, borrowing
    /// the manager for the lifetime of the iterator.
    pub fn iterator(
        &self,
        statement: StatementId,
        selector: Option<&ContextPartitionSelector>,
    ) -> Result<impl Iterator<Item = SharedEvent> + '_> {
        let agents = self.selected_agents(statement, selector)?;
        Ok(agents.into_iter().flat_map(|a| a.rows()))
    }

    /// Snapshot of the rows [`iterator`](Self::iterator) would yield.
    pub fn safe_iterator(
        &self,
        statement: StatementId,
        selector: Option<&ContextPartitionSelector>,
    ) -> Result<std::vec::IntoIter<SharedEvent>> {
        Ok(self.iterator(statement, selector)?.collect::<Vec<_>>().into_iter())
    }

    /// Current partition assignments, in the shape
    /// [`with_recovery_state`](Self::with_recovery_state) accepts.
    pub fn export_state(&self) -> ExternalState {
        match self.tree.root() {
            Some(root) => self.export_from(root),
            None => ExternalState::default(),
        }
    }

    fn export_from(&self, id: ControllerId) -> ExternalState {
        let Some(entry) = self.tree.get(id) else {
            return ExternalState::default();
        };
        let mut partitions: Vec<RecoveredPartition> = entry
            .children
            .values()
            .filter_map(|child| {
                let key = self.tree.get(*child)?.partition_key.clone()?;
                Some(RecoveredPartition {
                    key,
                    partition_id: None,
                    children: self.export_from(*child),
                })
            })
            .collect();
        partitions.extend(entry.instances.iter().map(|(pid, r)| RecoveredPartition {
            key: r.key.clone(),
            partition_id: Some(*pid),
            children: ExternalState::default(),
        }));
        ExternalState { partitions }
    }

    /// Statements attached, in registration order.
    pub fn statement_ids(&self) -> Vec<StatementId> {
        self.statements.keys().copied().collect()
    }

    /// Distinct statements that have an agent instance in partition `id`.
    pub fn statements_in_partition(&self, partition_id: PartitionId) -> FxHashSet<StatementId> {
        self.tree
            .records()
            .filter(|(pid, _)| *pid == partition_id)
            .flat_map(|(_, r)| r.agents.iter().map(|a| a.statement_id()))
            .collect()
    }
}

impl PartitionLifecycle for NestedContextManager {
    fn instantiate(&mut self, request: InstantiateRequest<'_>) -> Result<InstanceHandle> {
        let level = self
            .tree
            .get(request.originator)
            .map(|e| e.level)
            .ok_or(ContextError::UnknownController(request.originator))?;
        if level < self.depth() {
            self.instantiate_branch(request, level)
        } else {
            self.instantiate_leaf(request)
        }
    }

    fn terminate(
        &mut self,
        handle: &InstanceHandle,
        termination_properties: Option<&PropertyMap>,
    ) -> Result<()> {
        match *handle {
            InstanceHandle::Leaf {
                controller,
                partition_id,
                generation,
            } => self.terminate_leaf(
                handle,
                controller,
                partition_id,
                generation,
                termination_properties,
            ),
            InstanceHandle::Branch {
                parent,
                path_id,
                child,
            } => self.terminate_branch(handle, parent, path_id, child, termination_properties),
        }
    }
}

impl std::fmt::Debug for NestedContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NestedContextManager")
            .field("name", &self.descriptor.name)
            .field("depth", &self.depth())
            .field("statements", &self.statements.len())
            .field("controllers", &self.tree.len())
            .field("partitions", &self.ids.len())
            .finish()
    }
}
