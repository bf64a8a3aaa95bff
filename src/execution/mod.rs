//! Task execution engine.
//!
//! This module provides the execution infrastructure for running tasks,
//! from single-task retries and fallbacks up to whole-graph orchestration.

mod executor;
mod orchestrator;
pub mod report;

pub use executor::{RunScope, TaskExecutor, TaskOutcome};
pub use orchestrator::{FailurePolicy, Orchestrator, OrchestratorBuilder};
pub use report::{ExecutionReport, RunStatus, TaskResult, TaskStatus};
