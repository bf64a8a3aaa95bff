//! Simulated backends.
//!
//! Deterministic stand-ins for every collaborator. They back the degraded
//! paths of the pipeline and the offline mode of the CLI.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::core::fallback::{Availability, AvailabilityProbe};

use super::catalog;
use super::intent::Intent;
use super::records::ModelDefinition;
use super::services::{
    CompletionService, CrmService, ModelService, Prompt, PromptKind, ServiceError, Services,
    WarehouseService,
};

/// Canned results for running the given models.
pub fn model_results(models: &[String]) -> Value {
    let results: serde_json::Map<String, Value> = models
        .iter()
        .map(|model| {
            let result = json!({
                "status": "success",
                "rows_affected": 100,
                "execution_time": "2.5s",
                "data_preview": {
                    "total_records": 100,
                    "sample_data": [
                        {"metric": "value1", "count": 50},
                        {"metric": "value2", "count": 30},
                        {"metric": "value3", "count": 20}
                    ]
                }
            });
            (model.clone(), result)
        })
        .collect();
    Value::Object(results)
}

/// Canned cross-source analytics.
pub fn warehouse_metrics() -> Value {
    json!({
        "query": "Simulated complex analytics query",
        "result": {
            "forecast_accuracy": 0.87,
            "slippage_trend": -0.12,
            "win_rate_volatility": 0.08,
            "revenue_forecast": 1250000,
            "risk_deals": 15
        },
        "status": "success"
    })
}

/// Value of a `Label: value` line in a prompt.
fn prompt_line<'a>(text: &'a str, label: &str) -> Option<&'a str> {
    text.lines().find_map(|line| {
        line.strip_prefix(label)
            .and_then(|rest| rest.strip_prefix(':'))
            .map(str::trim)
    })
}

/// Language model that answers from keyword rules.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedCompletion;

#[async_trait]
impl AvailabilityProbe for SimulatedCompletion {
    fn backend(&self) -> &str {
        "simulated-llm"
    }

    async fn probe(&self) -> Availability {
        Availability::Available
    }
}

#[async_trait]
impl CompletionService for SimulatedCompletion {
    async fn generate(&self, prompt: &Prompt) -> Result<String, ServiceError> {
        let query = prompt_line(&prompt.user, "Query").unwrap_or_default();
        let intent = prompt_line(&prompt.user, "Intent")
            .and_then(|s| s.parse::<Intent>().ok())
            .unwrap_or_else(|| Intent::classify(query));

        let answer = match prompt.kind {
            PromptKind::IntentClassification => json!({
                "intent": Intent::classify(query),
                "confidence": 0.9,
                "reasoning": "matched question keywords"
            })
            .to_string(),
            PromptKind::QueryGeneration => {
                let mut queries = vec![json!({
                    "name": "open_pipeline",
                    "soql": "SELECT Id, Name, Amount, StageName, CloseDate FROM Opportunity \
                             WHERE IsClosed = false ORDER BY Amount DESC LIMIT 10",
                    "purpose": "Largest open opportunities"
                })];
                if intent.needs_analytics() {
                    queries.push(json!({
                        "name": "closed_deals",
                        "soql": "SELECT Id, Amount, IsWon, Owner.Name FROM Opportunity \
                                 WHERE IsClosed = true LIMIT 200",
                        "purpose": "Win rate inputs"
                    }));
                }
                Value::Array(queries).to_string()
            }
            PromptKind::ModelSelection => json!({
                "models": catalog::select_by_keywords(query, intent),
                "reasoning": "matched selection guidelines"
            })
            .to_string(),
            PromptKind::ModelGeneration => json!({
                "name": "a_custom_question_analysis",
                "description": format!("Custom analysis for: {}", query),
                "sql": "select 1 as placeholder"
            })
            .to_string(),
            PromptKind::DataFusion => json!({
                "summary": "Pipeline coverage is steady; 15 deals carry slippage risk.",
                "key_metrics": {
                    "forecast_accuracy": 0.87,
                    "revenue_forecast": 1250000,
                    "risk_deals": 15
                },
                "insights": ["Slippage trend improved by 12% quarter over quarter"],
                "recommendations": ["Review the 15 at-risk deals with their owners"]
            })
            .to_string(),
            PromptKind::Response => match intent {
                Intent::HelpRequest => "I can answer questions about your pipeline, forecasts, \
                                        win rates and deal slippage."
                    .to_string(),
                Intent::Conversational => {
                    "Hello! Ask me anything about your sales data.".to_string()
                }
                _ => format!(
                    "Here is what I found for \"{}\": pipeline coverage is steady \
                     and 15 deals carry slippage risk.",
                    query
                ),
            },
        };
        Ok(answer)
    }
}

/// CRM returning a fixed set of opportunities.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedCrm;

#[async_trait]
impl AvailabilityProbe for SimulatedCrm {
    fn backend(&self) -> &str {
        "simulated-crm"
    }

    async fn probe(&self) -> Availability {
        Availability::Available
    }
}

#[async_trait]
impl CrmService for SimulatedCrm {
    async fn query(&self, soql: &str) -> Result<Value, ServiceError> {
        if soql.trim().is_empty() {
            return Err(ServiceError::InvalidResponse("empty query".into()));
        }
        Ok(json!({
            "records": [
                {
                    "Id": "0060000001",
                    "Name": "Acme renewal",
                    "Amount": 120000,
                    "StageName": "Negotiation"
                },
                {
                    "Id": "0060000002",
                    "Name": "Globex expansion",
                    "Amount": 85000,
                    "StageName": "Proposal"
                },
                {
                    "Id": "0060000003",
                    "Name": "Initech pilot",
                    "Amount": 30000,
                    "StageName": "Qualification"
                }
            ],
            "totalSize": 3,
            "done": true
        }))
    }
}

/// Model runner returning canned results.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedModels;

#[async_trait]
impl AvailabilityProbe for SimulatedModels {
    fn backend(&self) -> &str {
        "simulated-models"
    }

    async fn probe(&self) -> Availability {
        Availability::Available
    }
}

#[async_trait]
impl ModelService for SimulatedModels {
    async fn run_models(&self, models: &[String]) -> Result<Value, ServiceError> {
        Ok(model_results(models))
    }

    async fn deploy(&self, definition: &ModelDefinition) -> Result<Value, ServiceError> {
        Ok(json!({
            "status": "success",
            "model": definition.name,
            "rows_affected": 100
        }))
    }
}

/// Warehouse returning canned metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedWarehouse;

#[async_trait]
impl AvailabilityProbe for SimulatedWarehouse {
    fn backend(&self) -> &str {
        "simulated-warehouse"
    }

    async fn probe(&self) -> Availability {
        Availability::Available
    }
}

#[async_trait]
impl WarehouseService for SimulatedWarehouse {
    async fn analyze(&self, _intent: Intent, _models: &[String]) -> Result<Value, ServiceError> {
        Ok(warehouse_metrics())
    }
}

impl Services {
    /// Every backend simulated.
    pub fn simulated() -> Self {
        Services::new(
            Arc::new(SimulatedCompletion),
            Arc::new(SimulatedCrm),
            Arc::new(SimulatedModels),
            Arc::new(SimulatedWarehouse),
        )
    }
}
