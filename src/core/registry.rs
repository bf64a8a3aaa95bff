//! Task registry: the implementations behind graph nodes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::context::FieldSet;
use super::fallback::FallbackPolicy;
use super::graph::GraphError;
use super::retry::RetryPolicy;
use super::task::Task;
use super::types::TaskId;

/// A registered task with its declared fields and optional fallback.
#[derive(Clone)]
pub struct Registration {
    id: TaskId,
    task: Arc<dyn Task>,
    fallback: Option<FallbackPolicy>,
    reads: Arc<FieldSet>,
    writes: Arc<FieldSet>,
}

impl Registration {
    fn new(task: Arc<dyn Task>, fallback: Option<FallbackPolicy>) -> Self {
        let reads = task.reads().into_iter().collect();
        let writes = task.writes().into_iter().collect();
        Self {
            id: TaskId::new(task.name()),
            task,
            fallback,
            reads: Arc::new(reads),
            writes: Arc::new(writes),
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn task(&self) -> &dyn Task {
        self.task.as_ref()
    }

    pub fn fallback(&self) -> Option<&FallbackPolicy> {
        self.fallback.as_ref()
    }

    pub fn reads(&self) -> &Arc<FieldSet> {
        &self.reads
    }

    pub fn writes(&self) -> &Arc<FieldSet> {
        &self.writes
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.task.retry_policy()
    }

    pub fn description(&self) -> Option<&str> {
        self.task.description()
    }

    /// One line for plan listings: id, description and fallback, when known.
    pub fn outline(&self) -> String {
        let mut line = match self.description() {
            Some(description) => format!("{}: {}", self.id, description),
            None => self.id.to_string(),
        };
        if let Some(fallback) = &self.fallback {
            let described = fallback.fallback().description().unwrap_or("no description");
            line.push_str(&format!(" [fallback: {}]", described));
        }
        line
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .field("fallback", &self.fallback)
            .finish()
    }
}

/// Registered tasks keyed by ID, in registration order.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    entries: HashMap<TaskId, Registration>,
    order: Vec<TaskId>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task without a fallback.
    pub fn register(&mut self, task: Arc<dyn Task>) -> Result<(), GraphError> {
        self.insert(Registration::new(task, None))
    }

    /// Register a task with a degraded implementation.
    pub fn register_with_fallback(
        &mut self,
        task: Arc<dyn Task>,
        policy: FallbackPolicy,
    ) -> Result<(), GraphError> {
        self.insert(Registration::new(task, Some(policy)))
    }

    fn insert(&mut self, registration: Registration) -> Result<(), GraphError> {
        let id = registration.id.clone();
        if self.entries.contains_key(&id) {
            return Err(GraphError::DuplicateTask(id));
        }
        self.order.push(id.clone());
        self.entries.insert(id, registration);
        Ok(())
    }

    pub fn get(&self, id: &TaskId) -> Option<&Registration> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Registered IDs in registration order.
    pub fn ids(&self) -> &[TaskId] {
        &self.order
    }
}
