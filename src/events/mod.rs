//! Run lifecycle events.
//!
//! The orchestrator emits an [`Event`] at each step of a run. Handlers
//! registered on an [`EventBus`] observe them without touching the run.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::types::{GraphId, RunId, TaskId};
use crate::execution::report::RunStatus;

/// Why a task's fallback ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// The primary failed after all retries.
    PrimaryFailed(String),
    /// The primary's backend was unreachable when the task was registered.
    PrimaryUnavailable(String),
}

/// Why a task was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A task it transitively depends on failed.
    UpstreamFailed(TaskId),
    /// Another task failed and the run stops at the first failure.
    FailFast,
    /// The run hit its deadline first.
    Aborted,
}

/// Lifecycle events emitted during a run.
#[derive(Debug, Clone)]
pub enum Event {
    /// A run has started.
    RunStarted {
        run_id: RunId,
        graph_id: GraphId,
        task_count: usize,
        layer_count: usize,
        timestamp: Instant,
    },

    /// A layer is about to launch its pending tasks.
    LayerStarted {
        run_id: RunId,
        layer: usize,
        task_ids: Vec<TaskId>,
        timestamp: Instant,
    },

    /// A task has started execution.
    TaskStarted {
        run_id: RunId,
        task_id: TaskId,
        timestamp: Instant,
    },

    /// A task's primary is being retried after failure.
    ///
    /// `max_attempts` counts the initial attempt, so a policy with 2 retries
    /// reports 3.
    TaskRetrying {
        run_id: RunId,
        task_id: TaskId,
        /// The attempt number that just failed (1-indexed).
        attempt: u32,
        max_attempts: u32,
        timestamp: Instant,
    },

    /// A task's degraded implementation is about to run.
    FallbackInvoked {
        run_id: RunId,
        task_id: TaskId,
        reason: FallbackReason,
        timestamp: Instant,
    },

    /// A task completed successfully.
    TaskCompleted {
        run_id: RunId,
        task_id: TaskId,
        duration: Duration,
        /// Whether the output came from the fallback.
        degraded: bool,
        timestamp: Instant,
    },

    /// A task failed with an error.
    TaskFailed {
        run_id: RunId,
        task_id: TaskId,
        error: String,
        timestamp: Instant,
    },

    /// A task was skipped without running.
    TaskSkipped {
        run_id: RunId,
        task_id: TaskId,
        reason: SkipReason,
        timestamp: Instant,
    },

    /// The run exceeded its deadline and is being aborted.
    RunTimedOut {
        run_id: RunId,
        deadline: Duration,
        timestamp: Instant,
    },

    /// A run finished.
    RunCompleted {
        run_id: RunId,
        graph_id: GraphId,
        status: RunStatus,
        duration: Duration,
        timestamp: Instant,
    },
}

impl Event {
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::RunStarted { timestamp, .. }
            | Event::LayerStarted { timestamp, .. }
            | Event::TaskStarted { timestamp, .. }
            | Event::TaskRetrying { timestamp, .. }
            | Event::FallbackInvoked { timestamp, .. }
            | Event::TaskCompleted { timestamp, .. }
            | Event::TaskFailed { timestamp, .. }
            | Event::TaskSkipped { timestamp, .. }
            | Event::RunTimedOut { timestamp, .. }
            | Event::RunCompleted { timestamp, .. } => *timestamp,
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            Event::RunStarted { run_id, .. }
            | Event::LayerStarted { run_id, .. }
            | Event::TaskStarted { run_id, .. }
            | Event::TaskRetrying { run_id, .. }
            | Event::FallbackInvoked { run_id, .. }
            | Event::TaskCompleted { run_id, .. }
            | Event::TaskFailed { run_id, .. }
            | Event::TaskSkipped { run_id, .. }
            | Event::RunTimedOut { run_id, .. }
            | Event::RunCompleted { run_id, .. } => *run_id,
        }
    }

    /// The task the event concerns. `None` for run and layer events.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Event::TaskStarted { task_id, .. }
            | Event::TaskRetrying { task_id, .. }
            | Event::FallbackInvoked { task_id, .. }
            | Event::TaskCompleted { task_id, .. }
            | Event::TaskFailed { task_id, .. }
            | Event::TaskSkipped { task_id, .. } => Some(task_id),
            Event::RunStarted { .. }
            | Event::LayerStarted { .. }
            | Event::RunTimedOut { .. }
            | Event::RunCompleted { .. } => None,
        }
    }

    pub fn run_started(
        run_id: RunId,
        graph_id: GraphId,
        task_count: usize,
        layer_count: usize,
    ) -> Self {
        Event::RunStarted {
            run_id,
            graph_id,
            task_count,
            layer_count,
            timestamp: Instant::now(),
        }
    }

    pub fn layer_started(run_id: RunId, layer: usize, task_ids: Vec<TaskId>) -> Self {
        Event::LayerStarted {
            run_id,
            layer,
            task_ids,
            timestamp: Instant::now(),
        }
    }

    pub fn task_started(run_id: RunId, task_id: TaskId) -> Self {
        Event::TaskStarted {
            run_id,
            task_id,
            timestamp: Instant::now(),
        }
    }

    /// `attempt` is the call that just failed; `max_attempts` includes the first call.
    pub fn task_retrying(run_id: RunId, task_id: TaskId, attempt: u32, max_attempts: u32) -> Self {
        Event::TaskRetrying {
            run_id,
            task_id,
            attempt,
            max_attempts,
            timestamp: Instant::now(),
        }
    }

    pub fn fallback_invoked(run_id: RunId, task_id: TaskId, reason: FallbackReason) -> Self {
        Event::FallbackInvoked {
            run_id,
            task_id,
            reason,
            timestamp: Instant::now(),
        }
    }

    pub fn task_completed(
        run_id: RunId,
        task_id: TaskId,
        duration: Duration,
        degraded: bool,
    ) -> Self {
        Event::TaskCompleted {
            run_id,
            task_id,
            duration,
            degraded,
            timestamp: Instant::now(),
        }
    }

    pub fn task_failed(run_id: RunId, task_id: TaskId, error: String) -> Self {
        Event::TaskFailed {
            run_id,
            task_id,
            error,
            timestamp: Instant::now(),
        }
    }

    pub fn task_skipped(run_id: RunId, task_id: TaskId, reason: SkipReason) -> Self {
        Event::TaskSkipped {
            run_id,
            task_id,
            reason,
            timestamp: Instant::now(),
        }
    }

    pub fn run_timed_out(run_id: RunId, deadline: Duration) -> Self {
        Event::RunTimedOut {
            run_id,
            deadline,
            timestamp: Instant::now(),
        }
    }

    pub fn run_completed(
        run_id: RunId,
        graph_id: GraphId,
        status: RunStatus,
        duration: Duration,
    ) -> Self {
        Event::RunCompleted {
            run_id,
            graph_id,
            status,
            duration,
            timestamp: Instant::now(),
        }
    }
}

/// Receives every event a run emits.
///
/// Handlers are awaited inline, so a slow handler slows the run.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event);
}

/// Fans events out to handlers in the order they registered.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push(handler);
    }

    pub async fn emit(&self, event: Event) {
        for handler in self.handlers.read().await.iter() {
            handler.handle(&event).await;
        }
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
