//! Degraded implementations of the pipeline tasks.

use async_trait::async_trait;
use serde_json::json;

use crate::core::context::TaskContext;
use crate::core::fallback::Fallback;
use crate::core::task::TaskError;

use super::catalog;
use super::fields::{
    CRM_DATA, CRM_QUERIES, FINAL_RESPONSE, FUSED_DATA, GENERATED_MODEL, INTENT, MODEL_RESULTS,
    MODEL_SELECTION, QUERY, WAREHOUSE_DATA,
};
use super::intent::Intent;
use super::records::{CrmQuery, FusedData, GeneratedModel, IntentDecision, ModelSelection};
use super::simulated;
use super::tasks::{models_to_run, read_intent};

/// Routes by keywords.
pub struct KeywordRouter;

#[async_trait]
impl Fallback for KeywordRouter {
    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let query: String = ctx.inputs.get(QUERY)?;
        let decision = IntentDecision {
            intent: Intent::classify(&query),
            confidence: 0.5,
            reasoning: "keyword routing".to_string(),
        };
        ctx.outputs.set(INTENT, &decision)?;
        Ok(())
    }

    fn description(&self) -> Option<&str> {
        Some("keyword intent routing")
    }
}

/// Selects models by topic keywords.
pub struct KeywordModelSelection;

#[async_trait]
impl Fallback for KeywordModelSelection {
    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let intent = read_intent(&ctx.inputs)?;
        if !intent.needs_analytics() {
            return Ok(());
        }
        let query: String = ctx.inputs.get(QUERY)?;
        let selection = ModelSelection {
            models: catalog::select_by_keywords(&query, intent),
            reasoning: "keyword selection".to_string(),
        };
        ctx.outputs.set(MODEL_SELECTION, &selection)?;
        Ok(())
    }

    fn description(&self) -> Option<&str> {
        Some("keyword model selection")
    }
}

/// Records that no model could be generated.
pub struct NoGeneratedModel;

#[async_trait]
impl Fallback for NoGeneratedModel {
    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let intent = read_intent(&ctx.inputs)?;
        let selection: Option<ModelSelection> = ctx.inputs.get_optional(MODEL_SELECTION)?;
        let covered = selection.is_some_and(|s| !s.models.is_empty());
        if !intent.needs_analytics() || covered {
            return Ok(());
        }
        let generated = GeneratedModel {
            message: "Model generation unavailable".to_string(),
            ..GeneratedModel::default()
        };
        ctx.outputs.set(GENERATED_MODEL, &generated)?;
        Ok(())
    }

    fn description(&self) -> Option<&str> {
        Some("skip model generation")
    }
}

/// CRM data with no records.
pub struct EmptyCrmData;

#[async_trait]
impl Fallback for EmptyCrmData {
    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let queries: Vec<CrmQuery> = ctx.inputs.get_optional(CRM_QUERIES)?.unwrap_or_default();
        if queries.is_empty() {
            return Ok(());
        }
        ctx.outputs.set(
            CRM_DATA,
            json!({"results": {}, "errors": ["CRM data unavailable"]}),
        )?;
        Ok(())
    }

    fn description(&self) -> Option<&str> {
        Some("empty CRM data")
    }
}

/// Canned model results for the requested models.
pub struct SimulatedModelResults;

#[async_trait]
impl Fallback for SimulatedModelResults {
    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let models = models_to_run(&ctx.inputs)?;
        if models.is_empty() {
            return Ok(());
        }
        ctx.outputs
            .set(MODEL_RESULTS, simulated::model_results(&models))?;
        Ok(())
    }

    fn description(&self) -> Option<&str> {
        Some("simulated model results")
    }
}

/// Canned warehouse metrics.
pub struct SimulatedWarehouseMetrics;

#[async_trait]
impl Fallback for SimulatedWarehouseMetrics {
    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        if !read_intent(&ctx.inputs)?.needs_analytics() {
            return Ok(());
        }
        ctx.outputs
            .set(WAREHOUSE_DATA, simulated::warehouse_metrics())?;
        Ok(())
    }

    fn description(&self) -> Option<&str> {
        Some("simulated warehouse metrics")
    }
}

pub const FUSION_UNAVAILABLE: &str = "Unable to fuse data due to technical issues";

/// Fusion result with only an apology for a summary.
pub struct SummaryOnlyFusion;

#[async_trait]
impl Fallback for SummaryOnlyFusion {
    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        ctx.outputs
            .set(FUSED_DATA, FusedData::summary_only(FUSION_UNAVAILABLE))?;
        Ok(())
    }

    fn description(&self) -> Option<&str> {
        Some("summary-only fusion")
    }
}

const CAPABILITIES: &str = "I can answer questions about your sales pipeline: open \
opportunities, win rates by owner or industry, deal velocity and slippage, revenue \
forecasts, and executive briefings.";

/// Answer assembled from the fused data without a language model.
pub struct TemplateResponse;

impl TemplateResponse {
    /// Render an answer for `query` from whatever fusion produced.
    pub fn render(query: &str, intent: Intent, fused: Option<&FusedData>) -> String {
        match intent {
            Intent::HelpRequest => return CAPABILITIES.to_string(),
            Intent::Conversational => {
                return "Hello! Ask me anything about your sales data.".to_string();
            }
            _ => {}
        }

        let Some(fused) = fused.filter(|f| !f.summary.is_empty()) else {
            return format!(
                "I couldn't gather enough data to answer \"{}\" right now.",
                query
            );
        };

        let mut answer = format!("Here's what I found: {}", fused.summary);
        if !fused.insights.is_empty() {
            answer.push_str("\n\nKey insights:");
            for insight in &fused.insights {
                answer.push_str("\n- ");
                answer.push_str(insight);
            }
        }
        if !fused.recommendations.is_empty() {
            answer.push_str("\n\nRecommendations:");
            for recommendation in &fused.recommendations {
                answer.push_str("\n- ");
                answer.push_str(recommendation);
            }
        }
        answer
    }
}

#[async_trait]
impl Fallback for TemplateResponse {
    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let query: String = ctx.inputs.get(QUERY)?;
        let intent = read_intent(&ctx.inputs)?;
        let fused: Option<FusedData> = ctx.inputs.get_optional(FUSED_DATA)?;

        let answer = Self::render(&query, intent, fused.as_ref());
        ctx.outputs.set(FINAL_RESPONSE, answer)?;
        Ok(())
    }

    fn description(&self) -> Option<&str> {
        Some("template response")
    }
}
