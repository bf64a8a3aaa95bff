//! Core building blocks: identifiers, the dependency graph, planning,
//! the shared context, and the task and fallback contracts.

pub mod context;
pub mod fallback;
pub mod graph;
pub mod planner;
pub mod registry;
pub mod retry;
pub mod schema;
pub mod task;
pub mod types;
