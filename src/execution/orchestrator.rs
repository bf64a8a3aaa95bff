//! Graph orchestration.
//!
//! The `Orchestrator` runs a validated graph layer by layer. All pending
//! tasks of a layer run concurrently; a barrier separates layers. Outputs of
//! a layer are committed to the shared context only once every task of the
//! layer has finished, in declaration order. A task failure never escapes
//! [`Orchestrator::run`]: it is recorded, its dependents are skipped, and
//! the run carries on with whatever can still execute.

use chrono::Utc;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::core::context::{ErrorEntry, Fields, SharedContext};
use crate::core::graph::{DependencyGraph, GraphError};
use crate::core::planner::{ExecutionPlan, check_write_sets, plan_layers};
use crate::core::registry::{Registration, TaskRegistry};
use crate::core::schema::{ContextSchema, check_producers};
use crate::core::types::{FieldName, GraphId, RunId, TaskId};
use crate::events::{Event, EventBus, SkipReason};

use super::executor::{RunScope, TaskExecutor, TaskOutcome};
use super::report::{ExecutionReport, RunStatus, TaskResult, TaskStatus};

/// What happens to the rest of the run when a task fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip only the failed task's transitive dependents.
    #[default]
    SkipDependents,
    /// Finish the current layer, then skip every task still pending.
    FailFast,
}

/// Builder for an [`Orchestrator`]. All validation happens in
/// [`build`](Self::build).
pub struct OrchestratorBuilder {
    graph_id: GraphId,
    graph: DependencyGraph,
    registry: TaskRegistry,
    schema: ContextSchema,
    terminal: Option<TaskId>,
    output_field: Option<FieldName>,
    max_concurrency: usize,
    deadline: Option<Duration>,
    failure_policy: FailurePolicy,
    config: HashMap<String, Value>,
    event_bus: Option<Arc<EventBus>>,
}

impl OrchestratorBuilder {
    fn new(graph: DependencyGraph, registry: TaskRegistry) -> Self {
        Self {
            graph_id: GraphId::default(),
            graph,
            registry,
            schema: ContextSchema::default(),
            terminal: None,
            output_field: None,
            max_concurrency: 4,
            deadline: None,
            failure_policy: FailurePolicy::default(),
            config: HashMap::new(),
            event_bus: None,
        }
    }

    pub fn graph_id(mut self, id: impl Into<GraphId>) -> Self {
        self.graph_id = id.into();
        self
    }

    /// Fields the caller populates before every run.
    pub fn initial_fields<I, F>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<FieldName>,
    {
        self.schema = ContextSchema::new(fields);
        self
    }

    /// The task whose output is the answer. Defaults to the single sink.
    pub fn terminal(mut self, id: impl Into<TaskId>) -> Self {
        self.terminal = Some(id.into());
        self
    }

    /// The terminal task's answer field. Defaults to its only written field.
    pub fn output_field(mut self, field: impl Into<FieldName>) -> Self {
        self.output_field = Some(field.into());
        self
    }

    /// Tasks running at once within one run. Each run has its own pool.
    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Wall-clock budget for a whole run.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Configuration value visible to every task.
    pub fn config_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Validate the graph against the registry and build the orchestrator.
    pub fn build(self) -> Result<Orchestrator, GraphError> {
        for id in self.graph.task_ids() {
            if !self.registry.contains(id) {
                return Err(GraphError::UnregisteredTask(id.clone()));
            }
        }
        for id in self.registry.ids() {
            if !self.graph.contains(id) {
                return Err(GraphError::UnknownTask(id.clone()));
            }
        }

        let plan = plan_layers(&self.graph);
        check_write_sets(&plan, &self.registry)?;
        check_producers(&self.graph, &self.registry, &self.schema)?;

        let terminal = match self.terminal {
            Some(id) if self.graph.contains(&id) => id,
            Some(id) => return Err(GraphError::UnknownTerminal(id)),
            None => {
                let mut sinks = self.graph.sinks();
                match sinks.len() {
                    0 => return Err(GraphError::EmptyGraph),
                    1 => sinks.remove(0),
                    _ => return Err(GraphError::AmbiguousTerminal(sinks)),
                }
            }
        };

        let terminal_writes = self
            .registry
            .get(&terminal)
            .map(|r| Arc::clone(r.writes()))
            .unwrap_or_default();
        let output_field = match self.output_field {
            Some(field) if terminal_writes.contains(&field) => Some(field),
            Some(field) => return Err(GraphError::InvalidOutputField { terminal, field }),
            None if terminal_writes.len() == 1 => terminal_writes.iter().next().cloned(),
            None => None,
        };

        debug!(
            graph = %self.graph_id,
            tasks = self.graph.len(),
            layers = plan.len(),
            terminal = %terminal,
            "orchestrator built"
        );

        Ok(Orchestrator {
            graph_id: self.graph_id,
            graph: self.graph,
            registry: self.registry,
            plan,
            schema: self.schema,
            terminal,
            output_field,
            executor: TaskExecutor::new(self.max_concurrency),
            deadline: self.deadline,
            failure_policy: self.failure_policy,
            config: Arc::new(self.config),
            event_bus: self.event_bus,
        })
    }
}

/// Executes a validated graph of registered tasks.
///
/// Immutable after build and safe to share: each call to
/// [`run`](Self::run) owns its own context and state.
pub struct Orchestrator {
    graph_id: GraphId,
    graph: DependencyGraph,
    registry: TaskRegistry,
    plan: ExecutionPlan,
    schema: ContextSchema,
    terminal: TaskId,
    output_field: Option<FieldName>,
    executor: TaskExecutor,
    deadline: Option<Duration>,
    failure_policy: FailurePolicy,
    config: Arc<HashMap<String, Value>>,
    event_bus: Option<Arc<EventBus>>,
}

/// Mutable state of one run.
struct RunState {
    status: RunStatus,
    statuses: HashMap<TaskId, TaskStatus>,
    results: HashMap<TaskId, TaskResult>,
}

impl RunState {
    fn new(ids: &[TaskId]) -> Self {
        Self {
            status: RunStatus::NotStarted,
            statuses: ids
                .iter()
                .map(|id| (id.clone(), TaskStatus::Pending))
                .collect(),
            results: HashMap::new(),
        }
    }

    fn status_of(&self, id: &TaskId) -> TaskStatus {
        self.statuses
            .get(id)
            .copied()
            .unwrap_or(TaskStatus::Pending)
    }

    fn transition(&mut self, id: &TaskId, next: TaskStatus) -> bool {
        let current = self.status_of(id);
        if !current.can_transition_to(next) {
            warn!(task = %id, from = %current, to = %next, "ignoring illegal status change");
            return false;
        }
        self.statuses.insert(id.clone(), next);
        true
    }

    fn set_run_status(&mut self, next: RunStatus) {
        if self.status.can_transition_to(next) {
            self.status = next;
        } else {
            warn!(from = %self.status, to = %next, "ignoring illegal run status change");
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("graph_id", &self.graph_id)
            .field("terminal", &self.terminal)
            .field("output_field", &self.output_field)
            .field("deadline", &self.deadline)
            .field("failure_policy", &self.failure_policy)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Start building an orchestrator for a graph and its tasks.
    pub fn builder(graph: DependencyGraph, registry: TaskRegistry) -> OrchestratorBuilder {
        OrchestratorBuilder::new(graph, registry)
    }

    pub fn graph_id(&self) -> &GraphId {
        &self.graph_id
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn schema(&self) -> &ContextSchema {
        &self.schema
    }

    pub fn terminal(&self) -> &TaskId {
        &self.terminal
    }

    pub fn output_field(&self) -> Option<&FieldName> {
        self.output_field.as_ref()
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Execute the graph once against a fresh context.
    pub async fn run(&self, initial: SharedContext) -> ExecutionReport {
        let run_id = RunId::new();
        let span = info_span!("run", run = %run_id, graph = %self.graph_id);
        self.run_inner(run_id, initial).instrument(span).await
    }

    async fn run_inner(&self, run_id: RunId, initial: SharedContext) -> ExecutionReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let deadline_at = self.deadline.map(|d| tokio::time::Instant::now() + d);

        let scope = self
            .executor
            .scope(run_id)
            .with_config(Arc::clone(&self.config))
            .with_events(self.event_bus.clone());

        for field in self.schema.fields() {
            if !initial.contains(field.as_str()) {
                warn!(field = %field, "initial field missing from context");
            }
        }

        let mut ctx = initial;
        let mut state = RunState::new(self.graph.task_ids());
        state.set_run_status(RunStatus::InProgress);

        info!(tasks = self.graph.len(), layers = self.plan.len(), "run started");
        scope
            .emit(Event::run_started(
                run_id,
                self.graph_id.clone(),
                self.graph.len(),
                self.plan.len(),
            ))
            .await;

        let mut timed_out = false;
        let mut stop_after_layer = false;

        for (index, layer) in self.plan.layers().iter().enumerate() {
            if stop_after_layer {
                break;
            }

            let ready: Vec<&Registration> = layer
                .iter()
                .filter(|id| state.status_of(id) == TaskStatus::Pending)
                .filter_map(|id| self.registry.get(id))
                .collect();
            if ready.is_empty() {
                continue;
            }

            if deadline_at.is_some_and(|at| tokio::time::Instant::now() >= at) {
                timed_out = true;
                break;
            }

            debug!(layer = index, ready = ready.len(), "dispatching layer");
            scope
                .emit(Event::layer_started(
                    run_id,
                    index,
                    ready.iter().map(|r| r.id().clone()).collect(),
                ))
                .await;

            let layer_start = Instant::now();
            let snapshot = ctx.snapshot();
            let mut in_flight = FuturesUnordered::new();
            for registration in &ready {
                state.transition(registration.id(), TaskStatus::Running);
                in_flight.push(self.dispatch(registration, Arc::clone(&snapshot), &scope));
            }

            let mut outcomes: Vec<TaskOutcome> = Vec::with_capacity(ready.len());
            loop {
                let next = match deadline_at {
                    Some(at) => tokio::select! {
                        outcome = in_flight.next() => outcome,
                        _ = tokio::time::sleep_until(at) => {
                            timed_out = true;
                            None
                        }
                    },
                    None => in_flight.next().await,
                };
                match next {
                    Some(outcome) => {
                        self.announce(&outcome.result, &scope).await;
                        outcomes.push(outcome);
                    }
                    None => break,
                }
            }

            if timed_out {
                scope.cancellation.cancel();
            }
            // dropping unfinished futures cancels them at their next await
            drop(in_flight);
            drop(snapshot);

            // barrier: settle in declaration order
            outcomes.sort_by_key(|o| self.graph.position(&o.result.task_id));
            for outcome in outcomes {
                let failed = self.settle(outcome, &mut ctx, &mut state, &scope).await;
                if failed && self.failure_policy == FailurePolicy::FailFast {
                    stop_after_layer = true;
                }
            }

            if timed_out {
                for registration in &ready {
                    let id = registration.id();
                    if state.status_of(id) != TaskStatus::Running {
                        continue;
                    }
                    state.transition(id, TaskStatus::Failed);
                    state.results.insert(
                        id.clone(),
                        TaskResult::failed(
                            id.clone(),
                            0,
                            layer_start.elapsed(),
                            "cancelled by run deadline".to_string(),
                        ),
                    );
                    warn!(task = %id, "task cancelled by run deadline");
                    scope
                        .emit(Event::task_failed(
                            run_id,
                            id.clone(),
                            "cancelled by run deadline".to_string(),
                        ))
                        .await;
                }
                break;
            }
        }

        if timed_out {
            let deadline = self.deadline.unwrap_or_default();
            warn!(deadline_ms = deadline.as_millis() as u64, "run exceeded deadline");
            ctx.record_error(ErrorEntry::timeout(format!(
                "run exceeded deadline of {:?}",
                deadline
            )));
            scope.emit(Event::run_timed_out(run_id, deadline)).await;
            self.skip_pending(&mut state, &scope, SkipReason::Aborted)
                .await;
        } else if stop_after_layer {
            self.skip_pending(&mut state, &scope, SkipReason::FailFast)
                .await;
        }

        let status = self.final_status(&state, &ctx, timed_out);
        state.set_run_status(status);
        let duration = start.elapsed();

        info!(
            status = %status,
            duration_ms = duration.as_millis() as u64,
            errors = ctx.errors().len(),
            "run finished"
        );
        scope
            .emit(Event::run_completed(
                run_id,
                self.graph_id.clone(),
                status,
                duration,
            ))
            .await;

        ExecutionReport {
            run_id,
            graph_id: self.graph_id.clone(),
            status: state.status,
            final_context: ctx,
            task_statuses: state.statuses,
            task_results: state.results,
            layers: self.plan.layers().to_vec(),
            terminal: self.terminal.clone(),
            output_field: self.output_field.clone(),
            started_at,
            finished_at: Utc::now(),
            duration,
        }
    }

    async fn dispatch(
        &self,
        registration: &Registration,
        inputs: Arc<Fields>,
        scope: &RunScope,
    ) -> TaskOutcome {
        let task_id = registration.id().clone();
        let span = info_span!("task", task = %task_id);
        async move {
            debug!("task started");
            scope
                .emit(Event::task_started(scope.run_id, task_id))
                .await;
            self.executor.execute(registration, inputs, scope).await
        }
        .instrument(span)
        .await
    }

    /// Log and emit the terminal event of a task as soon as it finishes.
    ///
    /// Runs outside the deadline race, so a finished task is never reported
    /// as cancelled.
    async fn announce(&self, result: &TaskResult, scope: &RunScope) {
        let id = result.task_id.clone();
        let event = if result.is_success() {
            debug!(
                task = %id,
                degraded = result.degraded,
                attempts = result.attempts,
                "task completed"
            );
            Event::task_completed(scope.run_id, id, result.duration, result.degraded)
        } else {
            let message = result.error.as_deref().unwrap_or("unknown error");
            warn!(task = %id, error = %message, "task failed");
            Event::task_failed(scope.run_id, id, message.to_string())
        };
        scope.emit(event).await;
    }

    /// Commit a finished task at the layer barrier. Returns true if it failed.
    async fn settle(
        &self,
        outcome: TaskOutcome,
        ctx: &mut SharedContext,
        state: &mut RunState,
        scope: &RunScope,
    ) -> bool {
        let TaskOutcome { result, outputs } = outcome;
        let id = result.task_id.clone();
        let run_id = scope.run_id;

        if result.is_success() {
            state.transition(&id, TaskStatus::Completed);
            if let Some(buffer) = outputs {
                ctx.commit(buffer, result.degraded);
            }
            state.results.insert(id, result);
            return false;
        }

        let message = result
            .error
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());
        state.transition(&id, TaskStatus::Failed);
        ctx.record_error(ErrorEntry::task(id.clone(), message));
        state.results.insert(id.clone(), result);

        if self.failure_policy == FailurePolicy::SkipDependents {
            for dependent in self.graph.descendants(&id) {
                if state.transition(&dependent, TaskStatus::Skipped) {
                    debug!(task = %dependent, upstream = %id, "task skipped");
                    scope
                        .emit(Event::task_skipped(
                            run_id,
                            dependent,
                            SkipReason::UpstreamFailed(id.clone()),
                        ))
                        .await;
                }
            }
        }
        true
    }

    async fn skip_pending(&self, state: &mut RunState, scope: &RunScope, reason: SkipReason) {
        for id in self.graph.task_ids() {
            if state.status_of(id) == TaskStatus::Pending
                && state.transition(id, TaskStatus::Skipped)
            {
                scope
                    .emit(Event::task_skipped(scope.run_id, id.clone(), reason.clone()))
                    .await;
            }
        }
    }

    fn final_status(&self, state: &RunState, ctx: &SharedContext, timed_out: bool) -> RunStatus {
        if timed_out {
            return RunStatus::Aborted;
        }
        if state
            .statuses
            .values()
            .all(|s| *s == TaskStatus::Completed)
        {
            return RunStatus::Succeeded;
        }
        let terminal_completed = state.status_of(&self.terminal) == TaskStatus::Completed;
        let answer_present = self
            .output_field
            .as_ref()
            .is_none_or(|field| ctx.contains(field.as_str()));
        if terminal_completed && answer_present {
            RunStatus::PartiallyFailed
        } else {
            RunStatus::Aborted
        }
    }
}
