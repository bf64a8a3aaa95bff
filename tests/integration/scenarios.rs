//! Reference scenarios and planning properties.

use crate::common::{chain_graph, chain_registry, ids, path, query_context};
use askflow::core::context::ErrorKind;
use askflow::{
    DependencyGraph, GraphError, Orchestrator, RunStatus, TaskId, TaskStatus, plan_layers,
};
use std::collections::HashSet;

fn layer_sets(graph: &DependencyGraph) -> Vec<HashSet<TaskId>> {
    plan_layers(graph)
        .layers()
        .iter()
        .map(|layer| layer.iter().cloned().collect())
        .collect()
}

#[tokio::test]
async fn test_fallback_keeps_chain_succeeding() {
    let orchestrator = Orchestrator::builder(chain_graph(), chain_registry(true))
        .initial_fields(["query"])
        .build()
        .unwrap();

    let report = orchestrator.run(query_context()).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(
        path(&report),
        vec!["route", "generate", "fetch", "fuse", "respond"]
    );
    assert_eq!(report.degraded_tasks(), vec![&TaskId::new("fetch")]);
    assert_eq!(
        report.final_context.get::<Vec<String>>("data").unwrap(),
        Vec::<String>::new()
    );
    // the primary's failure is not an error of the run
    assert!(report.errors().is_empty());
}

#[tokio::test]
async fn test_failure_without_fallback_aborts_chain() {
    let orchestrator = Orchestrator::builder(chain_graph(), chain_registry(false))
        .initial_fields(["query"])
        .build()
        .unwrap();

    let report = orchestrator.run(query_context()).await;

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(
        report.status_of(&TaskId::new("fetch")),
        Some(TaskStatus::Failed)
    );
    assert_eq!(
        report.status_of(&TaskId::new("fuse")),
        Some(TaskStatus::Skipped)
    );
    assert_eq!(
        report.status_of(&TaskId::new("respond")),
        Some(TaskStatus::Skipped)
    );
    assert_eq!(report.errors().len(), 1);
    assert_eq!(report.errors()[0].task_id, Some(TaskId::new("fetch")));
    assert_eq!(report.errors()[0].kind, ErrorKind::Task);
    assert_eq!(path(&report), vec!["route", "generate"]);
}

#[test]
fn test_independent_roots_share_first_layer() {
    let forward = DependencyGraph::build([
        ("a", vec![]),
        ("b", vec![]),
        ("c", vec!["a", "b"]),
    ])
    .unwrap();
    let reversed = DependencyGraph::build([
        ("b", vec![]),
        ("a", vec![]),
        ("c", vec!["a", "b"]),
    ])
    .unwrap();

    let expected = vec![
        ids(&["a", "b"]).into_iter().collect::<HashSet<_>>(),
        ids(&["c"]).into_iter().collect::<HashSet<_>>(),
    ];
    assert_eq!(layer_sets(&forward), expected);
    assert_eq!(layer_sets(&reversed), expected);
}

#[test]
fn test_cycle_is_rejected_before_planning() {
    let err = DependencyGraph::build([
        ("route", vec!["respond"]),
        ("fetch", vec!["route"]),
        ("respond", vec!["fetch"]),
    ])
    .unwrap_err();

    assert!(matches!(err, GraphError::Cycle { .. }));
}

/// Deterministic family of DAGs: node `i` depends on every earlier `j`
/// picked by a simple arithmetic rule.
fn generated_graph(size: usize, seed: usize) -> DependencyGraph {
    let edges: Vec<(String, Vec<String>)> = (0..size)
        .map(|i| {
            let deps = (0..i)
                .filter(|j| (i * 7 + j * 3 + seed) % 5 == 0)
                .map(|j| format!("t{}", j))
                .collect();
            (format!("t{}", i), deps)
        })
        .collect();
    DependencyGraph::build(edges).unwrap()
}

#[test]
fn test_every_task_planned_once_after_its_dependencies() {
    for seed in 0..5 {
        for size in 1..40 {
            let graph = generated_graph(size, seed);
            let plan = plan_layers(&graph);

            let planned: Vec<&TaskId> = plan.layers().iter().flatten().collect();
            assert_eq!(planned.len(), graph.len());
            let unique: HashSet<&TaskId> = planned.iter().copied().collect();
            assert_eq!(unique.len(), graph.len());

            for id in graph.task_ids() {
                let layer = plan.layer_of(id).unwrap();
                for dep in graph.dependencies(id) {
                    assert!(plan.layer_of(dep).unwrap() < layer);
                }
            }
        }
    }
}
