//! Layer concurrency, the layer barrier and run isolation.

use crate::common::{query_context, registry};
use askflow::testing::{RecordingHandler, StubTask};
use askflow::{Event, EventBus, GraphBuilder, Orchestrator, RunStatus, TaskId, TaskStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn recording_bus() -> (Arc<RecordingHandler>, Arc<EventBus>) {
    (Arc::new(RecordingHandler::new()), Arc::new(EventBus::new()))
}

fn is_terminal(event: &Event) -> bool {
    matches!(
        event,
        Event::TaskCompleted { .. } | Event::TaskFailed { .. } | Event::TaskSkipped { .. }
    )
}

#[tokio::test]
async fn test_siblings_in_a_layer_run_in_parallel() {
    // {fetch, warehouse} -> respond
    let graph = GraphBuilder::new()
        .add_task("fetch")
        .add_task("warehouse")
        .add_task_with_deps("respond", &["fetch", "warehouse"])
        .build()
        .unwrap();
    let tasks = registry(vec![
        StubTask::new("fetch")
            .with_reads(&["query"])
            .with_writes(&["crm_data"])
            .with_delay(Duration::from_millis(150)),
        StubTask::new("warehouse")
            .with_reads(&["query"])
            .with_writes(&["metrics"])
            .with_delay(Duration::from_millis(150)),
        StubTask::new("respond")
            .with_reads(&["crm_data", "metrics"])
            .with_writes(&["answer"]),
    ]);
    let orchestrator = Orchestrator::builder(graph, tasks)
        .initial_fields(["query"])
        .max_concurrency(2)
        .build()
        .unwrap();

    let start = Instant::now();
    let report = orchestrator.run(query_context()).await;
    let elapsed = start.elapsed();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(
        elapsed < Duration::from_millis(250),
        "Expected ~150ms for two parallel 150ms siblings, got {:?}",
        elapsed
    );
}

#[tokio::test]
async fn test_dependents_start_after_previous_layer_is_terminal() {
    // route -> {fetch, warehouse, audit (fails)}
    // {fetch, warehouse} -> fuse -> respond, audit -> audit_report
    let graph = GraphBuilder::new()
        .add_task("route")
        .add_task_with_deps("fetch", &["route"])
        .add_task_with_deps("warehouse", &["route"])
        .add_task_with_deps("audit", &["route"])
        .add_task_with_deps("fuse", &["fetch", "warehouse"])
        .add_task_with_deps("audit_report", &["audit"])
        .add_task_with_deps("respond", &["fuse"])
        .build()
        .unwrap();
    let tasks = registry(vec![
        StubTask::new("route")
            .with_reads(&["query"])
            .with_writes(&["intent"])
            .with_delay(Duration::from_millis(10)),
        StubTask::new("fetch")
            .with_reads(&["intent"])
            .with_writes(&["crm_data"])
            .with_delay(Duration::from_millis(80)),
        StubTask::new("warehouse")
            .with_reads(&["intent"])
            .with_writes(&["metrics"])
            .with_delay(Duration::from_millis(5)),
        StubTask::new("audit")
            .with_reads(&["intent"])
            .with_writes(&["audit_log"])
            .with_delay(Duration::from_millis(30))
            .always_fail(),
        StubTask::new("fuse")
            .with_reads(&["crm_data", "metrics"])
            .with_writes(&["fused"]),
        StubTask::new("audit_report")
            .with_reads(&["audit_log"])
            .with_writes(&["report"]),
        StubTask::new("respond").with_reads(&["fused"]).with_writes(&["answer"]),
    ]);
    let (recorder, bus) = recording_bus();
    bus.register(recorder.clone()).await;
    let orchestrator = Orchestrator::builder(graph, tasks)
        .initial_fields(["query"])
        .terminal("respond")
        .event_bus(bus)
        .build()
        .unwrap();

    let report = orchestrator.run(query_context()).await;
    assert_eq!(report.status, RunStatus::PartiallyFailed);
    assert_eq!(
        report.status_of(&TaskId::new("audit_report")),
        Some(TaskStatus::Skipped)
    );

    let plan = orchestrator.plan();
    let events = recorder.events().await;
    let layer_of = |event: &Event| event.task_id().and_then(|id| plan.layer_of(id));

    let mut checked = 0;
    for (started_at, started) in events.iter().enumerate() {
        if !matches!(started, Event::TaskStarted { .. }) {
            continue;
        }
        let Some(layer) = layer_of(started).filter(|layer| *layer > 0) else {
            continue;
        };
        for (index, event) in events.iter().enumerate() {
            if is_terminal(event) && layer_of(event) == Some(layer - 1) {
                assert!(
                    index < started_at,
                    "{:?} started before {:?} was terminal",
                    started.task_id(),
                    event.task_id()
                );
                checked += 1;
            }
        }
    }
    // three starts after route, fuse after three, respond after two
    assert_eq!(checked, 8);
}

#[tokio::test]
async fn test_completion_event_is_stamped_when_the_task_finishes() {
    let graph = GraphBuilder::new()
        .add_task("quick")
        .add_task("slow")
        .add_task_with_deps("respond", &["quick", "slow"])
        .build()
        .unwrap();
    let tasks = registry(vec![
        StubTask::new("quick")
            .with_reads(&["query"])
            .with_writes(&["intent"])
            .with_delay(Duration::from_millis(10)),
        StubTask::new("slow")
            .with_reads(&["query"])
            .with_writes(&["crm_data"])
            .with_delay(Duration::from_millis(200)),
        StubTask::new("respond")
            .with_reads(&["intent", "crm_data"])
            .with_writes(&["answer"]),
    ]);
    let (recorder, bus) = recording_bus();
    bus.register(recorder.clone()).await;
    let orchestrator = Orchestrator::builder(graph, tasks)
        .initial_fields(["query"])
        .event_bus(bus)
        .build()
        .unwrap();

    let report = orchestrator.run(query_context()).await;
    assert_eq!(report.status, RunStatus::Succeeded);

    let events = recorder.events().await;
    let completed_at = |name: &str| {
        events
            .iter()
            .find(|e| {
                matches!(e, Event::TaskCompleted { .. })
                    && e.task_id().map(TaskId::as_str) == Some(name)
            })
            .map(Event::timestamp)
            .unwrap()
    };

    let quick = completed_at("quick");
    let slow = completed_at("slow");
    assert!(
        slow.duration_since(quick) >= Duration::from_millis(100),
        "quick finished {:?} before slow",
        slow.duration_since(quick)
    );
}

#[tokio::test]
async fn test_concurrent_runs_do_not_share_permits() {
    let graph = GraphBuilder::new().add_task("fetch").build().unwrap();
    let tasks = registry(vec![
        StubTask::new("fetch")
            .with_reads(&["query"])
            .with_writes(&["crm_data"])
            .with_delay(Duration::from_millis(400)),
    ]);
    let orchestrator = Orchestrator::builder(graph, tasks)
        .initial_fields(["query"])
        .max_concurrency(1)
        .deadline(Duration::from_millis(600))
        .build()
        .unwrap();

    let (first, second) = tokio::join!(
        orchestrator.run(query_context()),
        orchestrator.run(query_context()),
    );

    assert_eq!(first.status, RunStatus::Succeeded);
    assert_eq!(second.status, RunStatus::Succeeded, "{:?}", second.errors());
    assert_ne!(first.run_id, second.run_id);
}
