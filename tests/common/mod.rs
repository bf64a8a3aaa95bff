//! Common test utilities shared across integration tests.

use askflow::testing::{StubFallback, StubTask};
use askflow::{
    DependencyGraph, ExecutionReport, FallbackPolicy, GraphBuilder, SharedContext, TaskId,
    TaskRegistry,
};
use serde_json::json;
use std::sync::Arc;

/// A registry holding every task, none with a fallback.
pub fn registry(tasks: Vec<StubTask>) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    for task in tasks {
        registry.register(Arc::new(task)).unwrap();
    }
    registry
}

/// `route -> generate -> fetch -> fuse -> respond`.
pub fn chain_graph() -> DependencyGraph {
    GraphBuilder::new()
        .add_task("route")
        .add_task_with_deps("generate", &["route"])
        .add_task_with_deps("fetch", &["generate"])
        .add_task_with_deps("fuse", &["fetch"])
        .add_task_with_deps("respond", &["fuse"])
        .build()
        .unwrap()
}

/// Registry for [`chain_graph`]. `fetch` always fails; with `fallback` set
/// its fallback writes `data: []`.
pub fn chain_registry(fallback: bool) -> TaskRegistry {
    let fetch = StubTask::new("fetch")
        .with_reads(&["queries"])
        .with_writes(&["data"])
        .always_fail()
        .with_error("crm unreachable");

    let mut registry = registry(vec![
        StubTask::new("route").with_reads(&["query"]).with_writes(&["intent"]),
        StubTask::new("generate")
            .with_reads(&["intent"])
            .with_writes(&["queries"]),
        StubTask::new("fuse").with_reads(&["data"]).with_writes(&["fused"]),
        StubTask::new("respond").with_reads(&["fused"]).with_writes(&["answer"]),
    ]);
    if fallback {
        registry
            .register_with_fallback(
                Arc::new(fetch),
                FallbackPolicy::new(StubFallback::empty().writing("data", json!([]))),
            )
            .unwrap();
    } else {
        registry.register(Arc::new(fetch)).unwrap();
    }
    registry
}

pub fn query_context() -> SharedContext {
    SharedContext::new().with("query", "why are deals slipping").unwrap()
}

pub fn ids(names: &[&str]) -> Vec<TaskId> {
    names.iter().map(|name| TaskId::new(*name)).collect()
}

/// Task ids of the execution path, in commit order.
pub fn path(report: &ExecutionReport) -> Vec<&str> {
    report
        .execution_path()
        .iter()
        .map(|entry| entry.task_id.as_str())
        .collect()
}
