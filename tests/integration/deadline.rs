//! Run deadlines.

use crate::common::{query_context, registry};
use askflow::core::context::ErrorKind;
use askflow::testing::{RecordingHandler, StubTask};
use askflow::{
    Event, EventBus, GraphBuilder, Orchestrator, RunStatus, SkipReason, TaskId, TaskStatus,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn stalled_orchestrator(deadline: Duration, bus: Arc<EventBus>) -> Orchestrator {
    // route -> {fetch (stalls), warehouse} -> respond
    let graph = GraphBuilder::new()
        .add_task("route")
        .add_task_with_deps("fetch", &["route"])
        .add_task_with_deps("warehouse", &["route"])
        .add_task_with_deps("respond", &["fetch", "warehouse"])
        .build()
        .unwrap();
    let tasks = registry(vec![
        StubTask::new("route").with_reads(&["query"]).with_writes(&["intent"]),
        StubTask::new("fetch")
            .with_reads(&["intent"])
            .with_writes(&["crm_data"])
            .with_delay(Duration::from_secs(30)),
        StubTask::new("warehouse")
            .with_reads(&["intent"])
            .with_writes(&["metrics"]),
        StubTask::new("respond")
            .with_reads(&["crm_data", "metrics"])
            .with_writes(&["answer"]),
    ]);

    Orchestrator::builder(graph, tasks)
        .initial_fields(["query"])
        .deadline(deadline)
        .event_bus(bus)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_deadline_aborts_run_and_skips_pending() {
    let recorder = Arc::new(RecordingHandler::new());
    let bus = Arc::new(EventBus::new());
    bus.register(recorder.clone()).await;
    let orchestrator = stalled_orchestrator(Duration::from_millis(100), bus);

    let start = Instant::now();
    let report = orchestrator.run(query_context()).await;

    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(report.status, RunStatus::Aborted);

    let status = |id: &str| report.status_of(&TaskId::new(id));
    assert_eq!(status("route"), Some(TaskStatus::Completed));
    // the sibling finished before the deadline and is kept
    assert_eq!(status("warehouse"), Some(TaskStatus::Completed));
    assert_eq!(status("fetch"), Some(TaskStatus::Failed));
    assert_eq!(status("respond"), Some(TaskStatus::Skipped));
    assert!(report.final_context.contains("metrics"));
    assert!(!report.final_context.contains("crm_data"));

    let timeouts: Vec<_> = report
        .errors()
        .iter()
        .filter(|e| e.kind == ErrorKind::Timeout)
        .collect();
    assert_eq!(timeouts.len(), 1);
    assert_eq!(report.errors().len(), 1);
    assert!(timeouts[0].task_id.is_none());

    assert_eq!(
        recorder
            .count(|e| matches!(e, Event::RunTimedOut { .. }))
            .await,
        1
    );
    assert_eq!(
        recorder
            .count(|e| matches!(
                e,
                Event::TaskSkipped {
                    reason: SkipReason::Aborted,
                    ..
                }
            ))
            .await,
        1
    );
}

#[tokio::test]
async fn test_generous_deadline_does_not_interfere() {
    let graph = GraphBuilder::new()
        .add_task("route")
        .add_task_with_deps("respond", &["route"])
        .build()
        .unwrap();
    let tasks = registry(vec![
        StubTask::new("route")
            .with_reads(&["query"])
            .with_writes(&["intent"])
            .with_delay(Duration::from_millis(10)),
        StubTask::new("respond").with_reads(&["intent"]).with_writes(&["answer"]),
    ]);

    let orchestrator = Orchestrator::builder(graph, tasks)
        .initial_fields(["query"])
        .deadline(Duration::from_secs(10))
        .build()
        .unwrap();
    let report = orchestrator.run(query_context()).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(report.errors().is_empty());
}
