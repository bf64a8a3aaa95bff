//! Field ownership checks.
//!
//! Every field a task reads must either be supplied by the caller before
//! the run (an initial field) or be written by one of the task's ancestors.

use std::collections::BTreeSet;

use super::graph::{DependencyGraph, GraphError};
use super::registry::TaskRegistry;
use super::types::FieldName;

/// The initial fields a caller promises to populate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextSchema {
    initial: BTreeSet<FieldName>,
}

impl ContextSchema {
    pub fn new<I, F>(initial: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<FieldName>,
    {
        Self {
            initial: initial.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, field: &str) -> bool {
        self.initial.contains(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldName> {
        self.initial.iter()
    }
}

/// Verify every declared read has a producer.
pub fn check_producers(
    graph: &DependencyGraph,
    registry: &TaskRegistry,
    schema: &ContextSchema,
) -> Result<(), GraphError> {
    for id in graph.task_ids() {
        let Some(registration) = registry.get(id) else {
            continue;
        };

        let ancestors = graph.ancestors(id);
        let produced: BTreeSet<&FieldName> = ancestors
            .iter()
            .filter_map(|a| registry.get(a))
            .flat_map(|r| r.writes().iter())
            .collect();

        for field in registration.reads().iter() {
            if !schema.contains(field.as_str()) && !produced.contains(field) {
                return Err(GraphError::MissingProducer {
                    task: id.clone(),
                    field: field.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::TaskContext;
    use crate::core::graph::GraphBuilder;
    use crate::core::task::{Task, TaskError};
    use crate::core::types::TaskId;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Declared {
        name: &'static str,
        reads: &'static [&'static str],
        writes: &'static [&'static str],
    }

    #[async_trait]
    impl Task for Declared {
        fn name(&self) -> &str {
            self.name
        }

        fn reads(&self) -> Vec<FieldName> {
            self.reads.iter().map(|f| FieldName::new(*f)).collect()
        }

        fn writes(&self) -> Vec<FieldName> {
            self.writes.iter().map(|f| FieldName::new(*f)).collect()
        }

        async fn execute(&self, _ctx: &mut TaskContext) -> Result<(), TaskError> {
            Ok(())
        }
    }

    fn registry(tasks: Vec<Declared>) -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        for task in tasks {
            registry.register(Arc::new(task)).unwrap();
        }
        registry
    }

    #[test]
    fn test_reads_satisfied_by_initial_and_ancestors() {
        let graph = GraphBuilder::new()
            .add_task("route")
            .add_task_with_deps("generate", &["route"])
            .add_task_with_deps("fetch", &["generate"])
            .build()
            .unwrap();
        let registry = registry(vec![
            Declared {
                name: "route",
                reads: &["query"],
                writes: &["intent"],
            },
            Declared {
                name: "generate",
                reads: &["query", "intent"],
                writes: &["crm_queries"],
            },
            Declared {
                name: "fetch",
                reads: &["crm_queries", "intent"],
                writes: &["crm_data"],
            },
        ]);
        let schema = ContextSchema::new(["query"]);

        assert!(check_producers(&graph, &registry, &schema).is_ok());
    }

    #[test]
    fn test_read_of_sibling_output_is_rejected() {
        // siblings run in the same layer, so neither may read the other
        let graph = GraphBuilder::new()
            .add_task("left")
            .add_task("right")
            .build()
            .unwrap();
        let registry = registry(vec![
            Declared {
                name: "left",
                reads: &[],
                writes: &["left_out"],
            },
            Declared {
                name: "right",
                reads: &["left_out"],
                writes: &[],
            },
        ]);

        let err = check_producers(&graph, &registry, &ContextSchema::default()).unwrap_err();

        assert_eq!(
            err,
            GraphError::MissingProducer {
                task: TaskId::new("right"),
                field: FieldName::new("left_out"),
            }
        );
    }

    #[test]
    fn test_unknown_initial_field_is_rejected() {
        let graph = GraphBuilder::new().add_task("route").build().unwrap();
        let registry = registry(vec![Declared {
            name: "route",
            reads: &["query", "history"],
            writes: &["intent"],
        }]);

        let err = check_producers(&graph, &registry, &ContextSchema::new(["query"])).unwrap_err();
        assert!(err.to_string().contains("history"));
    }

    #[test]
    fn test_schema_contains() {
        let schema = ContextSchema::new(["query", "schema"]);
        assert!(schema.contains("query"));
        assert!(!schema.contains("intent"));
        assert_eq!(schema.fields().count(), 2);
    }
}
