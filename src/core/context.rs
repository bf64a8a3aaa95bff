//! Shared run context and per-task views of it.
//!
//! One [`SharedContext`] exists per run. The orchestrator owns it
//! exclusively; tasks never touch it directly:
//!
//! - [`ContextView`]: Read-only snapshot taken at layer start, limited to
//!   the task's declared reads
//! - [`OutputBuffer`]: Task-local write buffer limited to the task's
//!   declared writes, committed only after the task succeeds
//! - [`TaskContext`]: Combines both with configuration and the run's
//!   cancellation token

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::types::{FieldName, TaskId};

/// Field storage shared between the run and its snapshots.
pub type Fields = BTreeMap<FieldName, Value>;

/// Set of field names a task declared.
pub type FieldSet = BTreeSet<FieldName>;

/// Errors that can occur when working with the context.
#[derive(Debug, Error)]
pub enum ContextError {
    /// Key was not found in the context.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Failed to deserialize value from context.
    #[error("deserialization error for key '{key}': {message}")]
    DeserializationError { key: String, message: String },

    /// Failed to serialize value for context.
    #[error("serialization error for key '{key}': {message}")]
    SerializationError { key: String, message: String },

    /// A task read a field it did not declare.
    #[error("task '{task}' did not declare a read of '{field}'")]
    UndeclaredRead { task: TaskId, field: FieldName },

    /// A task wrote a field it did not declare.
    #[error("task '{task}' did not declare a write of '{field}'")]
    UndeclaredWrite { task: TaskId, field: FieldName },
}

/// Category of a recorded run error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A task failed after retries and fallback.
    Task,
    /// The run exceeded its deadline.
    Timeout,
}

/// An error recorded during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// The failing task, `None` for run-level errors.
    pub task_id: Option<TaskId>,
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorEntry {
    /// Error attributed to a task.
    pub fn task(task_id: TaskId, message: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id),
            kind: ErrorKind::Task,
            message: message.into(),
        }
    }

    /// Run-level timeout.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            task_id: None,
            kind: ErrorKind::Timeout,
            message: message.into(),
        }
    }
}

/// A completed task in the execution path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathEntry {
    pub task_id: TaskId,
    /// Whether the output came from the fallback.
    pub degraded: bool,
}

/// Per-run context: fields, recorded errors, and the execution path.
///
/// Initial fields are set by the caller before the run; every other field
/// is written by exactly one task and committed at a layer barrier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharedContext {
    fields: Arc<Fields>,
    errors: Vec<ErrorEntry>,
    execution_path: Vec<PathEntry>,
}

impl SharedContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set a field.
    pub fn with<T: Serialize>(
        mut self,
        field: impl Into<FieldName>,
        value: T,
    ) -> Result<Self, ContextError> {
        self.insert(field, value)?;
        Ok(self)
    }

    /// Set a field, replacing any previous value.
    pub fn insert<T: Serialize>(
        &mut self,
        field: impl Into<FieldName>,
        value: T,
    ) -> Result<(), ContextError> {
        let field = field.into();
        let value = serde_json::to_value(value).map_err(|e| ContextError::SerializationError {
            key: field.to_string(),
            message: e.to_string(),
        })?;
        Arc::make_mut(&mut self.fields).insert(field, value);
        Ok(())
    }

    /// Get a field by name.
    pub fn get<T: DeserializeOwned>(&self, field: &str) -> Result<T, ContextError> {
        decode(&self.fields, field)
    }

    /// Get an optional field. Returns None if it is absent or has another shape.
    pub fn get_optional<T: DeserializeOwned>(&self, field: &str) -> Option<T> {
        let value = self.fields.get(field)?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Get the raw JSON value of a field.
    pub fn get_raw(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Check if a field is populated.
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Names of all populated fields.
    pub fn field_names(&self) -> Vec<&FieldName> {
        self.fields.keys().collect()
    }

    /// Errors recorded during the run, in the order they were recorded.
    pub fn errors(&self) -> &[ErrorEntry] {
        &self.errors
    }

    /// Tasks that completed, in commit order.
    pub fn execution_path(&self) -> &[PathEntry] {
        &self.execution_path
    }

    /// IDs from the execution path.
    pub fn executed_tasks(&self) -> Vec<&TaskId> {
        self.execution_path.iter().map(|e| &e.task_id).collect()
    }

    /// Cheap snapshot of the current fields for a layer.
    pub(crate) fn snapshot(&self) -> Arc<Fields> {
        Arc::clone(&self.fields)
    }

    /// Commit a successful task's buffer and append it to the path.
    ///
    /// Only called at a layer barrier, after every snapshot of the layer
    /// has been dropped, so the copy-on-write rarely copies.
    pub(crate) fn commit(&mut self, buffer: OutputBuffer, degraded: bool) {
        let task_id = buffer.task_id.clone();
        let fields = Arc::make_mut(&mut self.fields);
        for (field, value) in buffer.outputs {
            fields.insert(field, value);
        }
        self.execution_path.push(PathEntry { task_id, degraded });
    }

    pub(crate) fn record_error(&mut self, entry: ErrorEntry) {
        self.errors.push(entry);
    }
}

fn decode<T: DeserializeOwned>(fields: &Fields, field: &str) -> Result<T, ContextError> {
    let value = fields
        .get(field)
        .ok_or_else(|| ContextError::KeyNotFound(field.to_string()))?;
    serde_json::from_value(value.clone()).map_err(|e| ContextError::DeserializationError {
        key: field.to_string(),
        message: e.to_string(),
    })
}

/// Read-only view of the context for one task.
///
/// The view is a snapshot taken when the task's layer starts, so tasks in
/// the same layer never observe each other's writes.
#[derive(Debug, Clone)]
pub struct ContextView {
    task_id: TaskId,
    fields: Arc<Fields>,
    readable: Arc<FieldSet>,
}

impl ContextView {
    /// Create a view over a snapshot.
    pub fn new(task_id: TaskId, fields: Arc<Fields>, readable: Arc<FieldSet>) -> Self {
        Self {
            task_id,
            fields,
            readable,
        }
    }

    /// Get a declared field.
    pub fn get<T: DeserializeOwned>(&self, field: &str) -> Result<T, ContextError> {
        self.check_declared(field)?;
        decode(&self.fields, field)
    }

    /// Get a declared field that upstream tasks may have left unset.
    pub fn get_optional<T: DeserializeOwned>(
        &self,
        field: &str,
    ) -> Result<Option<T>, ContextError> {
        self.check_declared(field)?;
        if !self.fields.contains_key(field) {
            return Ok(None);
        }
        decode(&self.fields, field).map(Some)
    }

    /// Raw JSON of a declared field, if populated.
    pub fn get_raw(&self, field: &str) -> Result<Option<&Value>, ContextError> {
        self.check_declared(field)?;
        Ok(self.fields.get(field))
    }

    /// Check if a declared field is populated.
    pub fn contains(&self, field: &str) -> bool {
        self.readable.contains(field) && self.fields.contains_key(field)
    }

    fn check_declared(&self, field: &str) -> Result<(), ContextError> {
        if self.readable.contains(field) {
            Ok(())
        } else {
            Err(ContextError::UndeclaredRead {
                task: self.task_id.clone(),
                field: FieldName::new(field),
            })
        }
    }
}

/// Task-local output buffer.
///
/// Tasks write outputs to this buffer during execution. The buffer is
/// committed to the [`SharedContext`] only after the attempt succeeds;
/// failed attempts are discarded with their buffer.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    task_id: TaskId,
    writable: Arc<FieldSet>,
    outputs: BTreeMap<FieldName, Value>,
}

impl OutputBuffer {
    /// Create a new output buffer for a task.
    pub fn new(task_id: TaskId, writable: Arc<FieldSet>) -> Self {
        Self {
            task_id,
            writable,
            outputs: BTreeMap::new(),
        }
    }

    /// Write a declared field.
    pub fn set<T: Serialize>(&mut self, field: &str, value: T) -> Result<(), ContextError> {
        if !self.writable.contains(field) {
            return Err(ContextError::UndeclaredWrite {
                task: self.task_id.clone(),
                field: FieldName::new(field),
            });
        }
        let json_value =
            serde_json::to_value(value).map_err(|e| ContextError::SerializationError {
                key: field.to_string(),
                message: e.to_string(),
            })?;
        self.outputs.insert(FieldName::new(field), json_value);
        Ok(())
    }

    /// Get the task ID associated with this buffer.
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Get the number of outputs in the buffer.
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Get all written fields.
    pub fn keys(&self) -> Vec<&FieldName> {
        self.outputs.keys().collect()
    }

    /// Get a value from the buffer (for testing/debugging).
    pub fn get_raw(&self, field: &str) -> Option<&Value> {
        self.outputs.get(field)
    }
}

/// Execution context passed to tasks and fallbacks.
///
/// A fresh context is created for every attempt.
pub struct TaskContext {
    /// Read declared inputs (snapshot, read-only).
    pub inputs: ContextView,

    /// Write declared outputs (local buffer, committed on success).
    pub outputs: OutputBuffer,

    /// Run-level configuration values.
    pub config: Arc<HashMap<String, Value>>,

    cancellation: CancellationToken,
}

impl TaskContext {
    /// Create a new task context.
    pub fn new(
        inputs: ContextView,
        outputs: OutputBuffer,
        config: Arc<HashMap<String, Value>>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            inputs,
            outputs,
            config,
            cancellation,
        }
    }

    /// ID of the task this context belongs to.
    pub fn task_id(&self) -> &TaskId {
        self.outputs.task_id()
    }

    /// Token cancelled when the run is aborted.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Check whether the run has been aborted.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Get a configuration value by key.
    pub fn get_config<T: DeserializeOwned>(&self, key: &str) -> Result<T, ContextError> {
        self.config
            .get(key)
            .ok_or_else(|| ContextError::KeyNotFound(key.to_string()))
            .and_then(|v| {
                serde_json::from_value(v.clone()).map_err(|e| ContextError::DeserializationError {
                    key: key.to_string(),
                    message: e.to_string(),
                })
            })
    }

    /// Get an optional configuration value.
    pub fn get_config_optional<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.config
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Consume the context, keeping its buffered writes.
    pub fn into_outputs(self) -> OutputBuffer {
        self.outputs
    }
}
