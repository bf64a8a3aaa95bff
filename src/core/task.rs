//! The unit of work: a [`Task`] declares the context fields it reads and
//! writes and provides its primary implementation. A degraded implementation
//! is attached at registration through a
//! [`FallbackPolicy`](super::fallback::FallbackPolicy).

use async_trait::async_trait;
use thiserror::Error;

use super::context::TaskContext;
use super::retry::RetryPolicy;
use super::types::FieldName;

/// Why an attempt failed. [`TaskError::is_transient`] drives retries.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// A call to a backend took too long.
    #[error("task timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A field was read or written against its declaration, or could not be decoded.
    #[error("context error: {0}")]
    Context(#[from] super::context::ContextError),

    /// Rate limits, dropped connections and similar blips.
    #[error("transient error: {0}")]
    Transient(String),

    /// A backend the task depends on is unavailable.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The run was aborted while the task was working.
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl TaskError {
    /// Whether the same call might succeed if repeated.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TaskError::Transient(_) | TaskError::Timeout(_) | TaskError::Unavailable(_)
        )
    }
}

/// A node of the dependency graph.
///
/// Reads outside `reads()` and writes outside `writes()` fail with
/// [`TaskError::Context`]. Writes only reach the shared context if the task
/// succeeds.
///
/// ```ignore
/// use askflow::{FieldName, Task, TaskContext, TaskError};
/// use async_trait::async_trait;
///
/// struct Shout;
///
/// #[async_trait]
/// impl Task for Shout {
///     fn name(&self) -> &str {
///         "shout"
///     }
///
///     fn reads(&self) -> Vec<FieldName> {
///         vec!["query".into()]
///     }
///
///     fn writes(&self) -> Vec<FieldName> {
///         vec!["final_response".into()]
///     }
///
///     async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
///         let query: String = ctx.inputs.get("query")?;
///         ctx.outputs.set("final_response", query.to_uppercase())?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Send + Sync {
    /// Must match the task's node id in the graph.
    fn name(&self) -> &str;

    /// Fields some upstream task or the caller must provide.
    fn reads(&self) -> Vec<FieldName> {
        Vec::new()
    }

    /// Fields this task alone populates.
    fn writes(&self) -> Vec<FieldName> {
        Vec::new()
    }

    /// The primary implementation. An error may be followed by retries and
    /// then the fallback.
    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError>;

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    fn description(&self) -> Option<&str> {
        None
    }
}
