//! Collaborators the pipeline tasks call out to.
//!
//! Each backend sits behind a trait so tasks can run against remote services
//! or the simulated ones in [`super::simulated`]. Every backend is also an
//! [`AvailabilityProbe`], checked once when the pipeline is assembled.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::config::ModelTier;
use crate::core::fallback::AvailabilityProbe;
use crate::core::task::TaskError;

use super::intent::Intent;
use super::records::ModelDefinition;

/// Errors returned by backends.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request could not be sent or its body could not be read.
    #[error("request failed: {0}")]
    Request(String),

    /// The backend answered with an error status.
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The backend answered, but not with what was asked for.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The backend cannot be used at all.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("request timed out")]
    Timeout,
}

impl ServiceError {
    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Request(_) | ServiceError::Timeout => true,
            ServiceError::Status { status, .. } => *status == 429 || *status >= 500,
            ServiceError::InvalidResponse(_) | ServiceError::Unavailable(_) => false,
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ServiceError::Timeout
        } else if err.is_decode() {
            ServiceError::InvalidResponse(err.to_string())
        } else {
            ServiceError::Request(err.to_string())
        }
    }
}

impl From<ServiceError> for TaskError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unavailable(reason) => TaskError::Unavailable(reason),
            err if err.is_transient() => TaskError::Transient(err.to_string()),
            err => TaskError::ExecutionFailed(err.to_string()),
        }
    }
}

/// What a prompt is for. Lets backends pick a model tier per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKind {
    IntentClassification,
    QueryGeneration,
    ModelSelection,
    ModelGeneration,
    DataFusion,
    Response,
}

impl PromptKind {
    pub const ALL: [PromptKind; 6] = [
        PromptKind::IntentClassification,
        PromptKind::QueryGeneration,
        PromptKind::ModelSelection,
        PromptKind::ModelGeneration,
        PromptKind::DataFusion,
        PromptKind::Response,
    ];

    /// The cheapest tier that handles this job well.
    pub fn tier(&self) -> ModelTier {
        match self {
            PromptKind::IntentClassification => ModelTier::UltraFast,
            PromptKind::QueryGeneration => ModelTier::Fast,
            PromptKind::DataFusion => ModelTier::Balanced,
            PromptKind::ModelSelection | PromptKind::ModelGeneration | PromptKind::Response => {
                ModelTier::Accurate
            }
        }
    }
}

/// A two-message chat prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub kind: PromptKind,
    pub system: String,
    pub user: String,
    /// Overrides the backend's default completion length.
    pub max_tokens: Option<u32>,
}

impl Prompt {
    pub fn new(kind: PromptKind, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            kind,
            system: system.into(),
            user: user.into(),
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// A language model.
#[async_trait]
pub trait CompletionService: AvailabilityProbe {
    async fn generate(&self, prompt: &Prompt) -> Result<String, ServiceError>;
}

/// The CRM the questions are about.
#[async_trait]
pub trait CrmService: AvailabilityProbe {
    /// Run one query and return its records.
    async fn query(&self, soql: &str) -> Result<Value, ServiceError>;
}

/// Runs and deploys analytics models.
#[async_trait]
pub trait ModelService: AvailabilityProbe {
    /// Run models by name, returning results keyed by model.
    async fn run_models(&self, models: &[String]) -> Result<Value, ServiceError>;

    /// Deploy a new model and run it once.
    async fn deploy(&self, definition: &ModelDefinition) -> Result<Value, ServiceError>;
}

/// The data warehouse used for cross-source analytics.
#[async_trait]
pub trait WarehouseService: AvailabilityProbe {
    async fn analyze(&self, intent: Intent, models: &[String]) -> Result<Value, ServiceError>;
}

/// Handles to every backend the pipeline uses.
#[derive(Clone)]
pub struct Services {
    pub completion: Arc<dyn CompletionService>,
    pub crm: Arc<dyn CrmService>,
    pub models: Arc<dyn ModelService>,
    pub warehouse: Arc<dyn WarehouseService>,
}

impl Services {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        crm: Arc<dyn CrmService>,
        models: Arc<dyn ModelService>,
        warehouse: Arc<dyn WarehouseService>,
    ) -> Self {
        Self {
            completion,
            crm,
            models,
            warehouse,
        }
    }

    /// Replace the language model, keeping the other backends.
    pub fn with_completion(mut self, completion: Arc<dyn CompletionService>) -> Self {
        self.completion = completion;
        self
    }
}
