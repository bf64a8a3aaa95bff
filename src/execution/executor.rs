//! Runs one registered task to an outcome.
//!
//! A call holds one of its run's concurrency permits for its whole duration.
//! Permits belong to the [`RunScope`], so concurrent runs never wait on each
//! other. The primary is
//! retried per its policy; after that the fallback runs, or runs directly if
//! the primary's backend was found unavailable. A panic in either becomes a
//! failed outcome.

use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::context::{ContextView, Fields, OutputBuffer, TaskContext};
use crate::core::fallback::Availability;
use crate::core::registry::Registration;
use crate::core::task::TaskError;
use crate::core::types::RunId;
use crate::events::{Event, EventBus, FallbackReason};

use super::report::TaskResult;

/// Per-run values every task invocation shares.
#[derive(Clone)]
pub struct RunScope {
    pub run_id: RunId,
    pub config: Arc<HashMap<String, Value>>,
    pub cancellation: CancellationToken,
    pub events: Option<Arc<EventBus>>,
    permits: Arc<Semaphore>,
}

impl RunScope {
    /// A scope allowing `max_concurrency` tasks (at least 1) at once.
    pub fn new(run_id: RunId, max_concurrency: usize) -> Self {
        Self {
            run_id,
            config: Arc::new(HashMap::new()),
            cancellation: CancellationToken::new(),
            events: None,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    pub fn with_config(mut self, config: Arc<HashMap<String, Value>>) -> Self {
        self.config = config;
        self
    }

    pub fn with_events(mut self, events: Option<Arc<EventBus>>) -> Self {
        self.events = events;
        self
    }

    /// Permits not held by a running task of this run.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub(crate) async fn emit(&self, event: Event) {
        if let Some(bus) = &self.events {
            bus.emit(event).await;
        }
    }
}

/// Result of a task plus its buffered writes when it succeeded.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub result: TaskResult,
    pub outputs: Option<OutputBuffer>,
}

/// Executor for running tasks with concurrency control, retries, and fallback.
pub struct TaskExecutor {
    max_concurrency: usize,
}

impl TaskExecutor {
    /// Create a new executor with the given per-run concurrency limit (at least 1).
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// A fresh scope for one run, with its own permit pool.
    pub fn scope(&self, run_id: RunId) -> RunScope {
        RunScope::new(run_id, self.max_concurrency)
    }

    /// Execute a registered task against a snapshot of the context.
    ///
    /// Never fails: every error, including a panic, ends up in the
    /// returned [`TaskResult`].
    pub async fn execute(
        &self,
        registration: &Registration,
        inputs: Arc<Fields>,
        scope: &RunScope,
    ) -> TaskOutcome {
        let start = Instant::now();
        let run = AssertUnwindSafe(self.execute_guarded(registration, inputs, scope, start));
        match run.catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = format!("task panicked: {}", panic_message(panic.as_ref()));
                warn!(task = %registration.id(), "{}", message);
                TaskOutcome {
                    result: TaskResult::failed(
                        registration.id().clone(),
                        0,
                        start.elapsed(),
                        message,
                    ),
                    outputs: None,
                }
            }
        }
    }

    async fn execute_guarded(
        &self,
        registration: &Registration,
        inputs: Arc<Fields>,
        scope: &RunScope,
        start: Instant,
    ) -> TaskOutcome {
        let task_id = registration.id().clone();

        let _permit = match scope.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return TaskOutcome {
                    result: TaskResult::failed(
                        task_id,
                        0,
                        start.elapsed(),
                        "run permits are closed".to_string(),
                    ),
                    outputs: None,
                };
            }
        };

        let mut attempts = 0u32;
        let reason = match registration.fallback().map(|p| p.availability()) {
            Some(Availability::Unavailable(why)) => {
                debug!(task = %task_id, reason = %why, "primary backend unavailable");
                FallbackReason::PrimaryUnavailable(why.clone())
            }
            _ => match self
                .run_primary(registration, &inputs, scope, &mut attempts)
                .await
            {
                Ok(buffer) => {
                    return TaskOutcome {
                        result: TaskResult::completed(task_id, attempts, start.elapsed(), false),
                        outputs: Some(buffer),
                    };
                }
                Err(err) => FallbackReason::PrimaryFailed(err.to_string()),
            },
        };

        let primary_error = match &reason {
            FallbackReason::PrimaryFailed(msg) => msg.clone(),
            FallbackReason::PrimaryUnavailable(why) => format!("backend unavailable: {}", why),
        };

        let Some(policy) = registration.fallback() else {
            return TaskOutcome {
                result: TaskResult::failed(task_id, attempts, start.elapsed(), primary_error),
                outputs: None,
            };
        };

        if scope.cancellation.is_cancelled() {
            return TaskOutcome {
                result: TaskResult::failed(task_id, attempts, start.elapsed(), primary_error),
                outputs: None,
            };
        }

        debug!(task = %task_id, error = %primary_error, "invoking fallback");
        scope
            .emit(Event::fallback_invoked(
                scope.run_id,
                task_id.clone(),
                reason,
            ))
            .await;

        let mut ctx = context_for(registration, &inputs, scope);
        match policy.fallback().execute(&mut ctx).await {
            Ok(()) => TaskOutcome {
                result: TaskResult::completed(task_id, attempts, start.elapsed(), true),
                outputs: Some(ctx.into_outputs()),
            },
            Err(err) => TaskOutcome {
                result: TaskResult::failed(
                    task_id,
                    attempts,
                    start.elapsed(),
                    format!("{}; fallback failed: {}", primary_error, err),
                ),
                outputs: None,
            },
        }
    }

    /// Run the primary with retries. Each attempt writes to a fresh buffer.
    async fn run_primary(
        &self,
        registration: &Registration,
        inputs: &Arc<Fields>,
        scope: &RunScope,
        attempts: &mut u32,
    ) -> Result<OutputBuffer, TaskError> {
        let task_id = registration.id();
        let retry_policy = registration.retry_policy();

        loop {
            *attempts += 1;
            let mut ctx = context_for(registration, inputs, scope);

            let err = match registration.task().execute(&mut ctx).await {
                Ok(()) => return Ok(ctx.into_outputs()),
                Err(err) => err,
            };

            if scope.cancellation.is_cancelled() || !retry_policy.should_retry(*attempts, &err) {
                return Err(err);
            }

            warn!(
                task = %task_id,
                attempt = *attempts,
                error = %err,
                "task attempt failed, retrying"
            );
            scope
                .emit(Event::task_retrying(
                    scope.run_id,
                    task_id.clone(),
                    *attempts,
                    retry_policy.total_attempts(),
                ))
                .await;

            tokio::select! {
                _ = sleep(retry_policy.get_delay()) => {}
                _ = scope.cancellation.cancelled() => return Err(TaskError::Cancelled),
            }
        }
    }
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new(4)
    }
}

fn context_for(registration: &Registration, inputs: &Arc<Fields>, scope: &RunScope) -> TaskContext {
    let id = registration.id().clone();
    TaskContext::new(
        ContextView::new(id.clone(), Arc::clone(inputs), Arc::clone(registration.reads())),
        OutputBuffer::new(id, Arc::clone(registration.writes())),
        Arc::clone(&scope.config),
        scope.cancellation.clone(),
    )
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
