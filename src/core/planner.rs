//! Layered execution planning.
//!
//! Layer 0 holds the tasks with no dependencies; layer k holds the tasks
//! whose dependencies all sit in layers `0..k`. Within a layer, tasks keep
//! their declaration order. Tasks of one layer may run concurrently.

use std::collections::HashMap;

use super::graph::{DependencyGraph, GraphError};
use super::registry::TaskRegistry;
use super::types::{FieldName, TaskId};

/// Ordered layers of task IDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    layers: Vec<Vec<TaskId>>,
}

impl ExecutionPlan {
    pub fn layers(&self) -> &[Vec<TaskId>] {
        &self.layers
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Index of the layer containing `id`.
    pub fn layer_of(&self, id: &TaskId) -> Option<usize> {
        self.layers.iter().position(|layer| layer.contains(id))
    }

    /// Width of the widest layer.
    pub fn max_width(&self) -> usize {
        self.layers.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn into_layers(self) -> Vec<Vec<TaskId>> {
        self.layers
    }
}

/// Plan the layers of a validated graph.
///
/// Pure and deterministic: the same graph always yields the same plan.
pub fn plan_layers(graph: &DependencyGraph) -> ExecutionPlan {
    let mut in_degree: HashMap<&TaskId, usize> = graph
        .task_ids()
        .iter()
        .map(|id| (id, graph.dependencies(id).len()))
        .collect();

    let mut layers: Vec<Vec<TaskId>> = Vec::new();
    let mut current: Vec<TaskId> = graph
        .task_ids()
        .iter()
        .filter(|id| in_degree.get(id).copied() == Some(0))
        .cloned()
        .collect();

    while !current.is_empty() {
        let mut next = Vec::new();
        for id in &current {
            for dependent in graph.dependents(id) {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(dependent.clone());
                    }
                }
            }
        }
        // declaration order breaks ties
        next.sort_by_key(|id| graph.position(id).unwrap_or(usize::MAX));
        layers.push(std::mem::replace(&mut current, next));
    }

    ExecutionPlan { layers }
}

/// Reject layers where two tasks declare the same written field.
pub fn check_write_sets(plan: &ExecutionPlan, registry: &TaskRegistry) -> Result<(), GraphError> {
    for (index, layer) in plan.layers().iter().enumerate() {
        let mut owners: HashMap<&FieldName, &TaskId> = HashMap::new();
        for id in layer {
            let Some(registration) = registry.get(id) else {
                continue;
            };
            for field in registration.writes().iter() {
                if let Some(first) = owners.insert(field, id) {
                    return Err(GraphError::WriteConflict {
                        layer: index,
                        field: field.clone(),
                        first: first.clone(),
                        second: id.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}
