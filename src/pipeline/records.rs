//! Values the pipeline tasks exchange through the shared context.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::intent::Intent;

/// One message of the conversation so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Routing decision for a question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentDecision {
    pub intent: Intent,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// A CRM query and what it is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmQuery {
    #[serde(default)]
    pub name: String,
    pub soql: String,
    #[serde(default)]
    pub purpose: String,
}

/// Analytics models chosen for a question.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub models: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

/// Outcome of asking for a new model when none fits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratedModel {
    pub created: bool,
    pub model_name: Option<String>,
    pub description: Option<String>,
    pub message: String,
    /// Backend response to the deployment.
    pub deployment: Option<Value>,
}

impl GeneratedModel {
    /// Name of the new model, if one was deployed.
    pub fn deployed_name(&self) -> Option<&str> {
        if self.created {
            self.model_name.as_deref()
        } else {
            None
        }
    }
}

/// Definition of a model to deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub sql: String,
}

/// Combined analysis handed to the response writer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FusedData {
    pub summary: String,
    #[serde(default)]
    pub key_metrics: Map<String, Value>,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl FusedData {
    /// Fusion result carrying only a summary.
    pub fn summary_only(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }
}
