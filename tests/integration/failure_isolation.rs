//! Failure containment: skipped dependents, fallbacks, retries and
//! write-set isolation.

use crate::common::{ids, path, query_context, registry};
use askflow::core::context::ContextError;
use askflow::testing::{RecordingHandler, StubFallback, StubTask};
use askflow::{
    Event, EventBus, FailurePolicy, FallbackPolicy, FieldName, GraphBuilder, GraphError,
    Orchestrator, RetryCondition, RetryPolicy, RunStatus, SkipReason, Task, TaskContext,
    TaskError, TaskId, TaskRegistry, TaskStatus,
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn status(report: &askflow::ExecutionReport, id: &str) -> Option<TaskStatus> {
    report.status_of(&TaskId::new(id))
}

#[tokio::test]
async fn test_failed_leaf_leaves_unrelated_tasks_running() {
    // route -> {audit (leaf, fails), fetch -> respond}
    let graph = GraphBuilder::new()
        .add_task("route")
        .add_task_with_deps("audit", &["route"])
        .add_task_with_deps("fetch", &["route"])
        .add_task_with_deps("respond", &["fetch"])
        .build()
        .unwrap();
    let tasks = registry(vec![
        StubTask::new("route").with_reads(&["query"]).with_writes(&["intent"]),
        StubTask::new("audit")
            .with_reads(&["intent"])
            .with_writes(&["audit_log"])
            .always_fail(),
        StubTask::new("fetch").with_reads(&["intent"]).with_writes(&["data"]),
        StubTask::new("respond").with_reads(&["data"]).with_writes(&["answer"]),
    ]);

    let orchestrator = Orchestrator::builder(graph, tasks)
        .initial_fields(["query"])
        .terminal("respond")
        .build()
        .unwrap();
    let report = orchestrator.run(query_context()).await;

    assert_eq!(status(&report, "audit"), Some(TaskStatus::Failed));
    assert_eq!(status(&report, "fetch"), Some(TaskStatus::Completed));
    assert_eq!(status(&report, "respond"), Some(TaskStatus::Completed));
    assert_eq!(report.status, RunStatus::PartiallyFailed);
    assert_eq!(
        report.answer::<String>(),
        Some("respond".to_string())
    );
}

#[tokio::test]
async fn test_terminal_sole_dependency_failure_aborts() {
    let graph = GraphBuilder::new()
        .add_task("fuse")
        .add_task_with_deps("respond", &["fuse"])
        .build()
        .unwrap();
    let tasks = registry(vec![
        StubTask::new("fuse")
            .with_reads(&["query"])
            .with_writes(&["fused"])
            .always_fail(),
        StubTask::new("respond").with_reads(&["fused"]).with_writes(&["answer"]),
    ]);

    let orchestrator = Orchestrator::builder(graph, tasks)
        .initial_fields(["query"])
        .build()
        .unwrap();
    let report = orchestrator.run(query_context()).await;

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(report.errors().len(), 1);
    assert_eq!(report.errors()[0].task_id, Some(TaskId::new("fuse")));
    assert!(report.answer::<String>().is_none());
}

#[tokio::test]
async fn test_always_failing_primary_with_fallback_completes() {
    let graph = GraphBuilder::new().add_task("fetch").build().unwrap();
    let fallback = Arc::new(StubFallback::empty().writing("data", json!({"records": []})));
    let mut tasks = TaskRegistry::new();
    tasks
        .register_with_fallback(
            Arc::new(
                StubTask::new("fetch")
                    .with_reads(&["query"])
                    .with_writes(&["data"])
                    .always_fail(),
            ),
            FallbackPolicy::from_arc(fallback.clone()),
        )
        .unwrap();

    let orchestrator = Orchestrator::builder(graph, tasks)
        .initial_fields(["query"])
        .build()
        .unwrap();
    let report = orchestrator.run(query_context()).await;

    assert_eq!(status(&report, "fetch"), Some(TaskStatus::Completed));
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(
        report.final_context.get_raw("data"),
        Some(&json!({"records": []}))
    );
    assert_eq!(fallback.call_count(), 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried_before_fallback() {
    let graph = GraphBuilder::new().add_task("fetch").build().unwrap();
    let task = Arc::new(
        StubTask::new("fetch")
            .with_reads(&["query"])
            .with_writes(&["data"])
            .fail_times(2)
            .transient()
            .with_retry_policy(
                RetryPolicy::fixed(2, Duration::from_millis(1))
                    .with_condition(RetryCondition::TransientOnly),
            ),
    );
    let mut tasks = TaskRegistry::new();
    tasks
        .register_with_fallback(task.clone(), FallbackPolicy::new(StubFallback::empty()))
        .unwrap();

    let recorder = Arc::new(RecordingHandler::new());
    let bus = Arc::new(EventBus::new());
    bus.register(recorder.clone()).await;

    let orchestrator = Orchestrator::builder(graph, tasks)
        .initial_fields(["query"])
        .event_bus(bus)
        .build()
        .unwrap();
    let report = orchestrator.run(query_context()).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(task.call_count(), 3);
    let result = report.get_task_result(&TaskId::new("fetch")).unwrap();
    assert_eq!(result.attempts, 3);
    assert!(!result.degraded);
    assert_eq!(
        recorder
            .count(|e| matches!(e, Event::TaskRetrying { .. }))
            .await,
        2
    );
    assert_eq!(
        recorder
            .count(|e| matches!(e, Event::FallbackInvoked { .. }))
            .await,
        0
    );
}

#[tokio::test]
async fn test_fail_fast_skips_remaining_layers() {
    // layer 0: a, b (b fails); layer 1: c (needs a only); layer 2: d
    let graph = GraphBuilder::new()
        .add_task("a")
        .add_task("b")
        .add_task_with_deps("c", &["a"])
        .add_task_with_deps("d", &["b", "c"])
        .build()
        .unwrap();
    let tasks = registry(vec![
        StubTask::new("a").with_writes(&["a_out"]),
        StubTask::new("b").with_writes(&["b_out"]).always_fail(),
        StubTask::new("c").with_reads(&["a_out"]).with_writes(&["c_out"]),
        StubTask::new("d").with_reads(&["b_out", "c_out"]).with_writes(&["answer"]),
    ]);

    let recorder = Arc::new(RecordingHandler::new());
    let bus = Arc::new(EventBus::new());
    bus.register(recorder.clone()).await;

    let orchestrator = Orchestrator::builder(graph, tasks)
        .failure_policy(FailurePolicy::FailFast)
        .event_bus(bus)
        .build()
        .unwrap();
    let report = orchestrator.run(query_context()).await;

    assert_eq!(status(&report, "a"), Some(TaskStatus::Completed));
    assert_eq!(status(&report, "b"), Some(TaskStatus::Failed));
    assert_eq!(status(&report, "c"), Some(TaskStatus::Skipped));
    assert_eq!(status(&report, "d"), Some(TaskStatus::Skipped));
    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(
        recorder
            .count(|e| matches!(
                e,
                Event::TaskSkipped {
                    reason: SkipReason::FailFast,
                    ..
                }
            ))
            .await,
        2
    );
}

#[tokio::test]
async fn test_events_bracket_the_run() {
    let graph = GraphBuilder::new()
        .add_task("route")
        .add_task_with_deps("respond", &["route"])
        .build()
        .unwrap();
    let tasks = registry(vec![
        StubTask::new("route").with_reads(&["query"]).with_writes(&["intent"]),
        StubTask::new("respond").with_reads(&["intent"]).with_writes(&["answer"]),
    ]);
    let recorder = Arc::new(RecordingHandler::new());
    let bus = Arc::new(EventBus::new());
    bus.register(recorder.clone()).await;

    let orchestrator = Orchestrator::builder(graph, tasks)
        .initial_fields(["query"])
        .event_bus(bus)
        .build()
        .unwrap();
    let report = orchestrator.run(query_context()).await;

    let events = recorder.events().await;
    assert!(matches!(events.first(), Some(Event::RunStarted { .. })));
    assert!(matches!(
        events.last(),
        Some(Event::RunCompleted {
            status: RunStatus::Succeeded,
            ..
        })
    ));
    assert!(events.iter().all(|e| e.run_id() == report.run_id));

    let completed: Vec<&TaskId> = events
        .iter()
        .filter(|e| matches!(e, Event::TaskCompleted { .. }))
        .filter_map(|e| e.task_id())
        .collect();
    assert_eq!(completed, ids(&["route", "respond"]).iter().collect::<Vec<_>>());
}

/// Writes `seen_left = true` if it can see the `left` field.
struct Peek;

#[async_trait]
impl Task for Peek {
    fn name(&self) -> &str {
        "right"
    }

    fn writes(&self) -> Vec<FieldName> {
        vec!["seen_left".into()]
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        // give the sibling time to finish first
        tokio::time::sleep(Duration::from_millis(30)).await;
        let seen = match ctx.inputs.get_raw("left") {
            Ok(value) => value.is_some(),
            Err(ContextError::UndeclaredRead { .. }) => false,
            Err(other) => return Err(other.into()),
        };
        ctx.outputs.set("seen_left", seen)?;
        Ok(())
    }
}

#[tokio::test]
async fn test_same_layer_tasks_never_see_each_other() {
    let graph = GraphBuilder::new()
        .add_task("left")
        .add_task("right")
        .add_task_with_deps("join", &["left", "right"])
        .build()
        .unwrap();
    let mut tasks = registry(vec![
        StubTask::new("left").with_writes(&["left"]),
        StubTask::new("join")
            .with_reads(&["left", "seen_left"])
            .with_writes(&["answer"]),
    ]);
    tasks.register(Arc::new(Peek)).unwrap();

    let orchestrator = Orchestrator::builder(graph, tasks).build().unwrap();
    let report = orchestrator.run(query_context()).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(!report.final_context.get::<bool>("seen_left").unwrap());
    assert_eq!(path(&report), vec!["left", "right", "join"]);
}

#[test]
fn test_reading_a_sibling_field_is_rejected_at_build() {
    let graph = GraphBuilder::new()
        .add_task("left")
        .add_task("right")
        .build()
        .unwrap();
    let tasks = registry(vec![
        StubTask::new("left").with_writes(&["left"]),
        StubTask::new("right").with_reads(&["left"]).with_writes(&["answer"]),
    ]);

    let err = Orchestrator::builder(graph, tasks)
        .terminal("right")
        .build()
        .unwrap_err();

    assert_eq!(
        err,
        GraphError::MissingProducer {
            task: TaskId::new("right"),
            field: FieldName::new("left"),
        }
    );
}

#[test]
fn test_same_layer_write_conflict_is_rejected() {
    let graph = GraphBuilder::new()
        .add_task("left")
        .add_task("right")
        .add_task_with_deps("join", &["left", "right"])
        .build()
        .unwrap();
    let tasks = registry(vec![
        StubTask::new("left").with_writes(&["data"]),
        StubTask::new("right").with_writes(&["data"]),
        StubTask::new("join").with_reads(&["data"]).with_writes(&["answer"]),
    ]);

    let err = Orchestrator::builder(graph, tasks).build().unwrap_err();

    assert!(matches!(err, GraphError::WriteConflict { .. }));
}

struct Explodes;

#[async_trait]
impl Task for Explodes {
    fn name(&self) -> &str {
        "explodes"
    }

    fn writes(&self) -> Vec<FieldName> {
        vec!["data".into()]
    }

    async fn execute(&self, _ctx: &mut TaskContext) -> Result<(), TaskError> {
        panic!("malformed row");
    }
}

#[tokio::test]
async fn test_panicking_task_is_contained() {
    let graph = GraphBuilder::new()
        .add_task("explodes")
        .add_task("steady")
        .add_task_with_deps("respond", &["steady"])
        .build()
        .unwrap();
    let mut tasks = registry(vec![
        StubTask::new("steady").with_writes(&["rows"]),
        StubTask::new("respond").with_reads(&["rows"]).with_writes(&["answer"]),
    ]);
    tasks.register(Arc::new(Explodes)).unwrap();

    let orchestrator = Orchestrator::builder(graph, tasks)
        .terminal("respond")
        .build()
        .unwrap();
    let report = orchestrator.run(query_context()).await;

    assert_eq!(status(&report, "explodes"), Some(TaskStatus::Failed));
    assert_eq!(report.status, RunStatus::PartiallyFailed);
    assert!(report.errors()[0].message.contains("malformed row"));
}
