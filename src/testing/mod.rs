//! Testing utilities for users of the askflow library.
//!
//! This module provides helpers for testing tasks and whole runs:
//!
//! - [`MockTaskContext`]: runs one task against hand-set inputs and returns its writes
//! - [`StubTask`]: a configurable task that succeeds, fails N times, or stalls
//! - [`StubFallback`]: a fallback that writes fixed values or fails
//! - [`RecordingHandler`]: an event handler that keeps every event
//! - [`ScriptedCompletion`] and [`OfflineBackend`]: language model and backend doubles
//! - [`TestHarness`]: the business question pipeline wired to doubles

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::context::{
    ContextError, ContextView, FieldSet, Fields, OutputBuffer, TaskContext,
};
use crate::core::fallback::{Availability, AvailabilityProbe, Fallback};
use crate::core::graph::GraphError;
use crate::core::retry::RetryPolicy;
use crate::core::task::{Task, TaskError};
use crate::core::types::{FieldName, TaskId};
use crate::events::{Event, EventBus, EventHandler};
use crate::execution::{ExecutionReport, Orchestrator};
use crate::pipeline::intent::Intent;
use crate::pipeline::records::ModelDefinition;
use crate::pipeline::services::{
    CompletionService, CrmService, ModelService, Prompt, PromptKind, ServiceError,
    WarehouseService,
};
use crate::pipeline::simulated::SimulatedCompletion;
use crate::pipeline::{self, Services, Turn};

fn to_json<T: Serialize>(field: &str, value: T) -> Result<Value, ContextError> {
    serde_json::to_value(value).map_err(|e| ContextError::SerializationError {
        key: field.to_string(),
        message: e.to_string(),
    })
}

fn field_set(names: &[&str]) -> FieldSet {
    names.iter().map(|name| FieldName::new(*name)).collect()
}

/// A mock task context for testing a single task.
///
/// Declared reads and writes are enforced exactly as in a real run, so a
/// task that touches an undeclared field fails here too.
///
/// # Example
///
/// ```
/// use askflow::testing::MockTaskContext;
///
/// let mut mock = MockTaskContext::new("summarize")
///     .declare_reads(&["query"])
///     .declare_writes(&["summary"]);
/// mock.set_input("query", "pipeline coverage").unwrap();
///
/// let ctx = mock.as_context();
/// let query: String = ctx.inputs.get("query").unwrap();
/// assert_eq!(query, "pipeline coverage");
/// ```
pub struct MockTaskContext {
    task_id: TaskId,
    reads: FieldSet,
    writes: FieldSet,
    fields: Fields,
    config: HashMap<String, Value>,
    cancellation: CancellationToken,
}

impl MockTaskContext {
    /// Create a mock context for a task that declares nothing.
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: TaskId::new(task_id),
            reads: FieldSet::new(),
            writes: FieldSet::new(),
            fields: Fields::new(),
            config: HashMap::new(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Create a mock context using the task's own declarations.
    pub fn for_task(task: &dyn Task) -> Self {
        let mut mock = Self::new(task.name());
        mock.reads = task.reads().into_iter().collect();
        mock.writes = task.writes().into_iter().collect();
        mock
    }

    pub fn declare_reads(mut self, fields: &[&str]) -> Self {
        self.reads.extend(field_set(fields));
        self
    }

    pub fn declare_writes(mut self, fields: &[&str]) -> Self {
        self.writes.extend(field_set(fields));
        self
    }

    /// Populate a field the task can read.
    ///
    /// The field still has to be declared for the task to see it.
    pub fn set_input<T: Serialize>(&mut self, field: &str, value: T) -> Result<(), ContextError> {
        let value = to_json(field, value)?;
        self.fields.insert(FieldName::new(field), value);
        Ok(())
    }

    /// Set a run-level configuration value.
    pub fn set_config<T: Serialize>(&mut self, key: &str, value: T) -> Result<(), ContextError> {
        let value = to_json(key, value)?;
        self.config.insert(key.to_string(), value);
        Ok(())
    }

    /// Cancel the token handed to every context created from now on.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Build a fresh [`TaskContext`] over the current inputs.
    pub fn as_context(&self) -> TaskContext {
        TaskContext::new(
            ContextView::new(
                self.task_id.clone(),
                Arc::new(self.fields.clone()),
                Arc::new(self.reads.clone()),
            ),
            OutputBuffer::new(self.task_id.clone(), Arc::new(self.writes.clone())),
            Arc::new(self.config.clone()),
            self.cancellation.clone(),
        )
    }

    /// Run a task's primary once and return what it wrote.
    pub async fn run(&self, task: &dyn Task) -> Result<OutputBuffer, TaskError> {
        let mut ctx = self.as_context();
        task.execute(&mut ctx).await?;
        Ok(ctx.into_outputs())
    }

    /// Run a fallback once and return what it wrote.
    pub async fn run_fallback(&self, fallback: &dyn Fallback) -> Result<OutputBuffer, TaskError> {
        let mut ctx = self.as_context();
        fallback.execute(&mut ctx).await?;
        Ok(ctx.into_outputs())
    }
}

/// Decode a field from a task's output buffer.
pub fn output<T: serde::de::DeserializeOwned>(outputs: &OutputBuffer, field: &str) -> Option<T> {
    outputs
        .get_raw(field)
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

/// A configurable task for exercising the orchestrator.
///
/// On success it writes its own name to every declared write. Failure
/// counting is atomic, so the task is safe to share across runs.
///
/// # Example
///
/// ```
/// use askflow::testing::StubTask;
///
/// // Fails twice with a transient error, then succeeds.
/// let task = StubTask::new("fetch")
///     .with_reads(&["query"])
///     .with_writes(&["rows"])
///     .fail_times(2)
///     .transient();
/// ```
pub struct StubTask {
    name: String,
    reads: Vec<FieldName>,
    writes: Vec<FieldName>,
    failures_remaining: AtomicU32,
    total_failures: u32,
    always_fail: bool,
    transient: bool,
    error_message: String,
    delay: Option<Duration>,
    calls: AtomicU32,
    retry_policy: RetryPolicy,
}

impl StubTask {
    /// A task that always succeeds.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reads: Vec::new(),
            writes: Vec::new(),
            failures_remaining: AtomicU32::new(0),
            total_failures: 0,
            always_fail: false,
            transient: false,
            error_message: "intentional test failure".to_string(),
            delay: None,
            calls: AtomicU32::new(0),
            retry_policy: RetryPolicy::none(),
        }
    }

    pub fn with_reads(mut self, fields: &[&str]) -> Self {
        self.reads = fields.iter().map(|f| FieldName::new(*f)).collect();
        self
    }

    pub fn with_writes(mut self, fields: &[&str]) -> Self {
        self.writes = fields.iter().map(|f| FieldName::new(*f)).collect();
        self
    }

    /// Fail the first `count` calls.
    pub fn fail_times(mut self, count: u32) -> Self {
        self.failures_remaining = AtomicU32::new(count);
        self.total_failures = count;
        self
    }

    /// Fail every call.
    pub fn always_fail(mut self) -> Self {
        self.always_fail = true;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    /// Report failures as transient so retry policies apply.
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Sleep before doing anything, giving up early if the run is cancelled.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Number of times the primary has been called.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Restore the configured failure count.
    pub fn reset(&self) {
        self.failures_remaining
            .store(self.total_failures, Ordering::SeqCst);
        self.calls.store(0, Ordering::SeqCst);
    }

    fn error(&self) -> TaskError {
        if self.transient {
            TaskError::Transient(self.error_message.clone())
        } else {
            TaskError::ExecutionFailed(self.error_message.clone())
        }
    }

    fn take_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Task for StubTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn reads(&self) -> Vec<FieldName> {
        self.reads.clone()
    }

    fn writes(&self) -> Vec<FieldName> {
        self.writes.clone()
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancellation().cancelled() => return Err(TaskError::Cancelled),
            }
        }

        if self.always_fail || self.take_failure() {
            return Err(self.error());
        }

        for field in &self.writes {
            ctx.outputs.set(field.as_str(), &self.name)?;
        }
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy.clone()
    }
}

/// A fallback that writes fixed values, or fails.
pub struct StubFallback {
    values: Vec<(String, Value)>,
    error: Option<String>,
    calls: AtomicU32,
}

impl StubFallback {
    /// A fallback that writes nothing.
    pub fn empty() -> Self {
        Self {
            values: Vec::new(),
            error: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn writing(mut self, field: impl Into<String>, value: Value) -> Self {
        self.values.push((field.into(), value));
        self
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::empty()
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fallback for StubFallback {
    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.error {
            return Err(TaskError::ExecutionFailed(message.clone()));
        }
        for (field, value) in &self.values {
            ctx.outputs.set(field, value)?;
        }
        Ok(())
    }

    fn description(&self) -> Option<&str> {
        Some("stub fallback")
    }
}

/// Keeps every event it receives, in order.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    /// Number of recorded events matching a predicate.
    pub async fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().await.iter().filter(|e| predicate(*e)).count()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}

/// A scripted reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    /// Answer with an HTTP error status.
    Status(u16),
}

/// Language model with canned replies per prompt kind.
///
/// Prompt kinds without a script are answered by [`SimulatedCompletion`].
pub struct ScriptedCompletion {
    replies: HashMap<PromptKind, Reply>,
    availability: Availability,
    seen: Mutex<Vec<PromptKind>>,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self {
            replies: HashMap::new(),
            availability: Availability::Available,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(mut self, kind: PromptKind, text: impl Into<String>) -> Self {
        self.replies.insert(kind, Reply::Text(text.into()));
        self
    }

    pub fn fail(mut self, kind: PromptKind, status: u16) -> Self {
        self.replies.insert(kind, Reply::Status(status));
        self
    }

    /// Report the model as unreachable when probed.
    pub fn unavailable(mut self, reason: impl Into<String>) -> Self {
        self.availability = Availability::Unavailable(reason.into());
        self
    }

    /// Prompt kinds received so far, in order.
    pub async fn prompts(&self) -> Vec<PromptKind> {
        self.seen.lock().await.clone()
    }
}

impl Default for ScriptedCompletion {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AvailabilityProbe for ScriptedCompletion {
    fn backend(&self) -> &str {
        "scripted-llm"
    }

    async fn probe(&self) -> Availability {
        self.availability.clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn generate(&self, prompt: &Prompt) -> Result<String, ServiceError> {
        self.seen.lock().await.push(prompt.kind);
        match self.replies.get(&prompt.kind) {
            Some(Reply::Text(text)) => Ok(text.clone()),
            Some(Reply::Status(status)) => Err(ServiceError::Status {
                status: *status,
                body: "scripted failure".to_string(),
            }),
            None => SimulatedCompletion.generate(prompt).await,
        }
    }
}

/// A backend that is never reachable. Implements every backend trait.
#[derive(Debug, Clone)]
pub struct OfflineBackend {
    name: String,
}

impl OfflineBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn error(&self) -> ServiceError {
        ServiceError::Unavailable(format!("{} is offline", self.name))
    }
}

#[async_trait]
impl AvailabilityProbe for OfflineBackend {
    fn backend(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Availability {
        Availability::Unavailable(format!("{} is offline", self.name))
    }
}

#[async_trait]
impl CompletionService for OfflineBackend {
    async fn generate(&self, _prompt: &Prompt) -> Result<String, ServiceError> {
        Err(self.error())
    }
}

#[async_trait]
impl CrmService for OfflineBackend {
    async fn query(&self, _soql: &str) -> Result<Value, ServiceError> {
        Err(self.error())
    }
}

#[async_trait]
impl ModelService for OfflineBackend {
    async fn run_models(&self, _models: &[String]) -> Result<Value, ServiceError> {
        Err(self.error())
    }

    async fn deploy(&self, _definition: &ModelDefinition) -> Result<Value, ServiceError> {
        Err(self.error())
    }
}

#[async_trait]
impl WarehouseService for OfflineBackend {
    async fn analyze(&self, _intent: Intent, _models: &[String]) -> Result<Value, ServiceError> {
        Err(self.error())
    }
}

/// Schema text handed to the pipeline by [`TestHarness::ask`].
pub const TEST_SCHEMA: &str =
    "Opportunity(Id, Name, Amount, StageName, CloseDate, IsClosed, IsWon)";

/// The business question pipeline wired to the given backends, with every
/// event recorded.
///
/// # Example
///
/// ```ignore
/// use askflow::pipeline::Services;
/// use askflow::testing::TestHarness;
///
/// let harness = TestHarness::pipeline(Services::simulated()).await?;
/// let report = harness.ask("What is our win rate?").await?;
/// assert!(report.is_success());
/// ```
pub struct TestHarness {
    orchestrator: Orchestrator,
    recorder: Arc<RecordingHandler>,
}

impl TestHarness {
    /// Pipeline with the default configuration.
    pub async fn pipeline(services: Services) -> Result<Self, GraphError> {
        Self::pipeline_with_config(&AppConfig::default(), services).await
    }

    pub async fn pipeline_with_config(
        config: &AppConfig,
        services: Services,
    ) -> Result<Self, GraphError> {
        let recorder = Arc::new(RecordingHandler::new());
        let bus = Arc::new(EventBus::new());
        bus.register(recorder.clone()).await;
        let orchestrator = pipeline::build_orchestrator(config, &services, Some(bus)).await?;
        Ok(Self {
            orchestrator,
            recorder,
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Ask a question with no history.
    pub async fn ask(&self, query: &str) -> Result<ExecutionReport, ContextError> {
        self.ask_with_history(query, &[]).await
    }

    pub async fn ask_with_history(
        &self,
        query: &str,
        history: &[Turn],
    ) -> Result<ExecutionReport, ContextError> {
        let ctx = pipeline::initial_context(query, history, TEST_SCHEMA)?;
        Ok(self.orchestrator.run(ctx).await)
    }

    /// Events recorded across every run so far.
    pub async fn events(&self) -> Vec<Event> {
        self.recorder.events().await
    }

    pub fn recorder(&self) -> &RecordingHandler {
        &self.recorder
    }
}
