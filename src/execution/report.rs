//! Task and run statuses and the report returned by a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::core::context::{ErrorEntry, PathEntry, SharedContext};
use crate::core::types::{FieldName, GraphId, RunId, TaskId};

/// Status of a task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is waiting for its layer.
    Pending,
    /// Task is currently executing.
    Running,
    /// Task completed, possibly through its fallback.
    Completed,
    /// Task failed after retries and fallback.
    Failed,
    /// Task never ran because of an upstream failure or an abort.
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    /// Legal moves: Pending to Running or Skipped, Running to a terminal status.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => matches!(next, TaskStatus::Running | TaskStatus::Skipped),
            TaskStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    InProgress,
    /// Every task completed.
    Succeeded,
    /// Some task failed or was skipped, but the terminal task produced output.
    PartiallyFailed,
    /// The terminal task produced no output, or the deadline expired.
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::PartiallyFailed | RunStatus::Aborted
        )
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match self {
            RunStatus::NotStarted => next == RunStatus::InProgress,
            RunStatus::InProgress => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::NotStarted => "not_started",
            RunStatus::InProgress => "in_progress",
            RunStatus::Succeeded => "succeeded",
            RunStatus::PartiallyFailed => "partially_failed",
            RunStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Result of executing one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Calls of the primary (0 when it was skipped for an unavailable backend).
    pub attempts: u32,
    /// Total duration, retries and fallback included.
    pub duration: Duration,
    /// Whether the fallback produced the output.
    pub degraded: bool,
    pub error: Option<String>,
}

impl TaskResult {
    /// Create a completed result.
    pub fn completed(task_id: TaskId, attempts: u32, duration: Duration, degraded: bool) -> Self {
        Self {
            task_id,
            status: TaskStatus::Completed,
            attempts,
            duration,
            degraded,
            error: None,
        }
    }

    /// Create a failed result.
    pub fn failed(task_id: TaskId, attempts: u32, duration: Duration, error: String) -> Self {
        Self {
            task_id,
            status: TaskStatus::Failed,
            attempts,
            duration,
            degraded: false,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// Everything a caller learns from a run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub run_id: RunId,
    pub graph_id: GraphId,
    pub status: RunStatus,
    /// The context after the last committed layer.
    pub final_context: SharedContext,
    /// Final status of every task in the graph.
    pub task_statuses: HashMap<TaskId, TaskStatus>,
    /// Results of the tasks that were launched.
    pub task_results: HashMap<TaskId, TaskResult>,
    /// The planned layers.
    pub layers: Vec<Vec<TaskId>>,
    pub terminal: TaskId,
    /// Field holding the answer, written by the terminal task.
    pub output_field: Option<FieldName>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
}

impl ExecutionReport {
    /// Completed tasks, in commit order.
    pub fn execution_path(&self) -> &[PathEntry] {
        self.final_context.execution_path()
    }

    pub fn errors(&self) -> &[ErrorEntry] {
        self.final_context.errors()
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn status_of(&self, id: &TaskId) -> Option<TaskStatus> {
        self.task_statuses.get(id).copied()
    }

    pub fn get_task_result(&self, id: &TaskId) -> Option<&TaskResult> {
        self.task_results.get(id)
    }

    /// The terminal task's output, if it was written.
    pub fn answer<T: DeserializeOwned>(&self) -> Option<T> {
        let field = self.output_field.as_ref()?;
        self.final_context.get_optional(field.as_str())
    }

    /// Tasks with the given status, in plan order.
    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<&TaskId> {
        self.layers
            .iter()
            .flatten()
            .filter(|id| self.task_statuses.get(*id) == Some(&status))
            .collect()
    }

    pub fn failed_tasks(&self) -> Vec<&TaskId> {
        self.tasks_with_status(TaskStatus::Failed)
    }

    pub fn skipped_tasks(&self) -> Vec<&TaskId> {
        self.tasks_with_status(TaskStatus::Skipped)
    }

    /// Tasks whose output came from a fallback.
    pub fn degraded_tasks(&self) -> Vec<&TaskId> {
        self.execution_path()
            .iter()
            .filter(|e| e.degraded)
            .map(|e| &e.task_id)
            .collect()
    }

    pub fn completed_count(&self) -> usize {
        self.tasks_with_status(TaskStatus::Completed).len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed_tasks().len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped_tasks().len()
    }
}
