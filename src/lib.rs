//! askflow - a dependency-graph task orchestrator for answering business
//! questions.
//!
//! The core ([`core`], [`execution`]) runs a fixed graph of tasks in
//! dependency order with retries, per-task fallbacks and failure isolation.
//! [`pipeline`] wires the nine-task business question graph on top of it.

pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod pipeline;
pub mod testing;

pub use config::{AppConfig, ConfigError, YamlLoader};
pub use core::context::{ContextError, ContextView, OutputBuffer, SharedContext, TaskContext};
pub use core::fallback::{Availability, AvailabilityProbe, Fallback, FallbackPolicy};
pub use core::graph::{DependencyGraph, GraphBuilder, GraphError};
pub use core::planner::{ExecutionPlan, plan_layers};
pub use core::registry::TaskRegistry;
pub use core::retry::{RetryCondition, RetryPolicy};
pub use core::task::{Task, TaskError};
pub use core::types::{FieldName, GraphId, RunId, TaskId};
pub use events::{Event, EventBus, EventHandler, FallbackReason, SkipReason};
pub use execution::{
    ExecutionReport, FailurePolicy, Orchestrator, OrchestratorBuilder, RunStatus, TaskResult,
    TaskStatus,
};
