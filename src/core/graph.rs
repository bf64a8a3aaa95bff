//! Dependency graph over task identifiers.
//!
//! A [`DependencyGraph`] maps each task to the set of tasks that must
//! finish before it may start. The graph is validated once, at build time:
//! every dependency must name a declared task and the graph must be acyclic.
//! Declaration order is preserved and used to break ties everywhere an
//! ordering is observable (planning, commit order, reporting).

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use super::types::{FieldName, TaskId};

/// Errors raised while building a graph or an orchestrator from it.
///
/// All of these are construction-time errors; none is produced by a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The graph contains a cycle.
    #[error("cycle detected: {}", format_cycle_path(.path))]
    Cycle { path: Vec<TaskId> },

    /// A dependency references a task that doesn't exist.
    #[error("missing dependency: task '{task}' depends on non-existent task '{dependency}'")]
    MissingDependency { task: TaskId, dependency: TaskId },

    /// The same task was declared twice.
    #[error("duplicate task: {0}")]
    DuplicateTask(TaskId),

    /// Two tasks scheduled in the same layer declare the same written field.
    #[error(
        "write conflict in layer {layer}: tasks '{first}' and '{second}' both write '{field}'"
    )]
    WriteConflict {
        layer: usize,
        field: FieldName,
        first: TaskId,
        second: TaskId,
    },

    /// A task reads a field nothing upstream produces.
    #[error("missing producer: task '{task}' reads '{field}' which no ancestor writes")]
    MissingProducer { task: TaskId, field: FieldName },

    /// A graph node has no registered task behind it.
    #[error("task '{0}' is in the graph but was never registered")]
    UnregisteredTask(TaskId),

    /// A registered task has no node in the graph.
    #[error("task '{0}' is registered but not part of the graph")]
    UnknownTask(TaskId),

    /// The graph has no tasks to run.
    #[error("graph has no tasks")]
    EmptyGraph,

    /// The requested terminal task is not in the graph.
    #[error("terminal task '{0}' is not part of the graph")]
    UnknownTerminal(TaskId),

    /// No terminal task was given and the graph has several sinks.
    #[error("terminal task is ambiguous, candidates: {}", join_ids(.0))]
    AmbiguousTerminal(Vec<TaskId>),

    /// The output field is not written by the terminal task.
    #[error("output field '{field}' is not written by terminal task '{terminal}'")]
    InvalidOutputField { terminal: TaskId, field: FieldName },
}

fn format_cycle_path(path: &[TaskId]) -> String {
    join_with(path, " -> ")
}

fn join_ids(ids: &[TaskId]) -> String {
    join_with(ids, ", ")
}

fn join_with(ids: &[TaskId], separator: &str) -> String {
    ids.iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(separator)
}

/// A node in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNode {
    /// The task ID.
    pub id: TaskId,

    /// Tasks that must complete before this one starts, in declaration order.
    pub dependencies: Vec<TaskId>,

    /// Tasks that list this one as a dependency, in declaration order.
    pub dependents: Vec<TaskId>,
}

/// An immutable, validated, acyclic dependency graph.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: HashMap<TaskId, TaskNode>,
    order: Vec<TaskId>,
}

impl DependencyGraph {
    /// Build a graph from `(task, dependencies)` pairs.
    ///
    /// Pairs are taken in declaration order. Repeated dependencies of one
    /// task are collapsed. Fails on duplicate tasks, dependencies on
    /// undeclared tasks, and cycles.
    pub fn build<I, T, D, S>(edges: I) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = (T, D)>,
        T: Into<TaskId>,
        D: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        let mut nodes: HashMap<TaskId, TaskNode> = HashMap::new();
        let mut order = Vec::new();

        for (task, deps) in edges {
            let id: TaskId = task.into();
            if nodes.contains_key(&id) {
                return Err(GraphError::DuplicateTask(id));
            }

            let mut dependencies: Vec<TaskId> = Vec::new();
            for dep in deps {
                let dep = dep.into();
                if !dependencies.contains(&dep) {
                    dependencies.push(dep);
                }
            }

            order.push(id.clone());
            nodes.insert(
                id.clone(),
                TaskNode {
                    id,
                    dependencies,
                    dependents: Vec::new(),
                },
            );
        }

        for id in &order {
            let dependencies = nodes
                .get(id)
                .map(|node| node.dependencies.clone())
                .unwrap_or_default();
            for dep in dependencies {
                match nodes.get_mut(&dep) {
                    Some(upstream) => upstream.dependents.push(id.clone()),
                    None => {
                        return Err(GraphError::MissingDependency {
                            task: id.clone(),
                            dependency: dep,
                        });
                    }
                }
            }
        }

        let graph = Self { nodes, order };
        if let Some(path) = graph.detect_cycle() {
            return Err(GraphError::Cycle { path });
        }

        Ok(graph)
    }

    /// Start building a graph fluently.
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    /// Number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Check if the graph has no tasks.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// All task IDs in declaration order.
    pub fn task_ids(&self) -> &[TaskId] {
        &self.order
    }

    /// Check whether a task is part of the graph.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Get a node by ID.
    pub fn get(&self, id: &TaskId) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    /// Position of a task in declaration order.
    pub fn position(&self, id: &TaskId) -> Option<usize> {
        self.order.iter().position(|t| t == id)
    }

    /// Direct dependencies of a task. Empty for unknown tasks.
    pub fn dependencies(&self, id: &TaskId) -> &[TaskId] {
        self.nodes
            .get(id)
            .map(|n| n.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Direct dependents of a task. Empty for unknown tasks.
    pub fn dependents(&self, id: &TaskId) -> &[TaskId] {
        self.nodes
            .get(id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Every task reachable by following dependencies from `id`.
    pub fn ancestors(&self, id: &TaskId) -> HashSet<TaskId> {
        self.walk(id, |node| &node.dependencies)
    }

    /// Every task reachable by following dependents from `id`, in
    /// declaration order.
    pub fn descendants(&self, id: &TaskId) -> Vec<TaskId> {
        let reached = self.walk(id, |node| &node.dependents);
        self.order
            .iter()
            .filter(|t| reached.contains(*t))
            .cloned()
            .collect()
    }

    /// Tasks nothing depends on, in declaration order.
    pub fn sinks(&self) -> Vec<TaskId> {
        self.order
            .iter()
            .filter(|id| self.dependents(id).is_empty())
            .cloned()
            .collect()
    }

    fn walk<F>(&self, start: &TaskId, next: F) -> HashSet<TaskId>
    where
        F: Fn(&TaskNode) -> &Vec<TaskId>,
    {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&TaskId> = VecDeque::new();
        if let Some(node) = self.nodes.get(start) {
            queue.extend(next(node));
        }
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(id) {
                queue.extend(next(node));
            }
        }
        seen
    }

    fn detect_cycle(&self) -> Option<Vec<TaskId>> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();

        for id in &self.order {
            if !visited.contains(id) && self.dfs_cycle(id, &mut visited, &mut stack) {
                return Some(stack);
            }
        }

        None
    }

    fn dfs_cycle(
        &self,
        node: &TaskId,
        visited: &mut HashSet<TaskId>,
        stack: &mut Vec<TaskId>,
    ) -> bool {
        visited.insert(node.clone());
        stack.push(node.clone());

        for dep in self.dependencies(node) {
            // dependency already on the current path closes a cycle
            if let Some(pos) = stack.iter().position(|x| x == dep) {
                stack.push(dep.clone());
                *stack = stack[pos..].to_vec();
                return true;
            }

            if !visited.contains(dep) && self.dfs_cycle(dep, visited, stack) {
                return true;
            }
        }

        stack.pop();
        false
    }
}

/// Fluent builder for a [`DependencyGraph`].
///
/// Errors are reported by [`build`](Self::build), never swallowed.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    edges: Vec<(TaskId, Vec<TaskId>)>,
}

impl GraphBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a task with no dependencies.
    pub fn add_task(mut self, id: impl Into<TaskId>) -> Self {
        self.edges.push((id.into(), Vec::new()));
        self
    }

    /// Declare a task together with its dependencies.
    pub fn add_task_with_deps(mut self, id: impl Into<TaskId>, depends_on: &[&str]) -> Self {
        let deps = depends_on.iter().map(|d| TaskId::new(*d)).collect();
        self.edges.push((id.into(), deps));
        self
    }

    /// Validate and build the graph.
    pub fn build(self) -> Result<DependencyGraph, GraphError> {
        DependencyGraph::build(self.edges)
    }
}
