//! The nine tasks of the question pipeline.
//!
//! Tasks that do not apply to the routed intent complete without writing.
//! Remote failures surface as [`TaskError`]s; retries and degraded paths are
//! left to the orchestrator.

use async_trait::async_trait;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::context::{ContextError, ContextView, TaskContext};
use crate::core::retry::RetryPolicy;
use crate::core::task::{Task, TaskError};
use crate::core::types::FieldName;

use super::catalog;
use super::fields::{
    CRM_DATA, CRM_QUERIES, FINAL_RESPONSE, FUSED_DATA, GENERATED_MODEL, HISTORY, INTENT,
    MODEL_RESULTS, MODEL_SELECTION, QUERY, SCHEMA, WAREHOUSE_DATA,
};
use super::intent::Intent;
use super::records::{
    CrmQuery, FusedData, GeneratedModel, IntentDecision, ModelDefinition, ModelSelection, Turn,
};
use super::services::{
    CompletionService, CrmService, ModelService, Prompt, PromptKind, WarehouseService,
};
use super::task_ids;

/// Config key for the per-source summary length handed to fusion.
pub const SUMMARY_LIMIT_KEY: &str = "summary_limit";
const DEFAULT_SUMMARY_LIMIT: usize = 800;

pub(crate) fn field_names(fields: &[&str]) -> Vec<FieldName> {
    fields.iter().map(|f| FieldName::new(*f)).collect()
}

/// First `limit` characters of `text`.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Parse JSON from a model reply, tolerating a surrounding code fence.
pub(crate) fn parse_json<T: DeserializeOwned>(reply: &str) -> Result<T, TaskError> {
    let trimmed = reply.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim())
        .map_err(|e| TaskError::ExecutionFailed(format!("unparseable model reply: {}", e)))
}

pub(crate) fn read_intent(inputs: &ContextView) -> Result<Intent, ContextError> {
    Ok(inputs.get::<IntentDecision>(INTENT)?.intent)
}

/// Models to run: the selected ones plus any newly deployed one.
pub(crate) fn models_to_run(inputs: &ContextView) -> Result<Vec<String>, ContextError> {
    let mut models = inputs
        .get_optional::<ModelSelection>(MODEL_SELECTION)?
        .map(|s| s.models)
        .unwrap_or_default();
    if let Some(generated) = inputs.get_optional::<GeneratedModel>(GENERATED_MODEL)? {
        if let Some(name) = generated.deployed_name() {
            if !models.iter().any(|m| m == name) {
                models.push(name.to_string());
            }
        }
    }
    Ok(models)
}

fn history_line(history: &[Turn]) -> String {
    history
        .iter()
        .map(|turn| format!("{}: {}", turn.role, turn.content.replace('\n', " ")))
        .collect::<Vec<_>>()
        .join(" | ")
}

const INTENT_SYSTEM: &str = "\
You route business questions about a sales CRM.
Choose one intent:
- SIMPLE_QUERY: a direct data lookup
- ANALYTICS_DEEP: analysis across several sources (trends, causes, insights)
- EXECUTIVE_BRIEFING: leadership-level summary with forecasting
- HELP_REQUEST: questions about what you can do
- CONVERSATIONAL: greetings and small talk
Reply with JSON: {\"intent\": \"...\", \"confidence\": 0.0-1.0, \"reasoning\": \"...\"}";

/// Classifies the question.
pub struct IntentRouter {
    completion: Arc<dyn CompletionService>,
    retry: RetryPolicy,
}

impl IntentRouter {
    pub fn new(completion: Arc<dyn CompletionService>, retry: RetryPolicy) -> Self {
        Self { completion, retry }
    }
}

#[async_trait]
impl Task for IntentRouter {
    fn name(&self) -> &str {
        task_ids::INTENT_ROUTER
    }

    fn reads(&self) -> Vec<FieldName> {
        field_names(&[QUERY, HISTORY])
    }

    fn writes(&self) -> Vec<FieldName> {
        field_names(&[INTENT])
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let query: String = ctx.inputs.get(QUERY)?;
        let history: Vec<Turn> = ctx.inputs.get_optional(HISTORY)?.unwrap_or_default();

        let user = format!("Query: {}\nHistory: {}", query, history_line(&history));
        let reply = self
            .completion
            .generate(&Prompt::new(PromptKind::IntentClassification, INTENT_SYSTEM, user))
            .await?;
        let decision: IntentDecision = parse_json(&reply)?;

        info!(intent = %decision.intent, confidence = decision.confidence, "intent routed");
        ctx.outputs.set(INTENT, &decision)?;
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }

    fn description(&self) -> Option<&str> {
        Some("Classify the question")
    }
}

const QUERY_SYSTEM: &str = "\
You write Salesforce SOQL for business questions.
Use relationship fields (Account.Name, Owner.Name) instead of joins, add LIMIT
clauses to large result sets, and only use fields present in the schema.
Reply with a JSON array: [{\"name\": \"...\", \"soql\": \"...\", \"purpose\": \"...\"}]";

/// Writes CRM queries for data-bearing intents.
pub struct QueryGenerator {
    completion: Arc<dyn CompletionService>,
    retry: RetryPolicy,
}

impl QueryGenerator {
    pub fn new(completion: Arc<dyn CompletionService>, retry: RetryPolicy) -> Self {
        Self { completion, retry }
    }
}

#[async_trait]
impl Task for QueryGenerator {
    fn name(&self) -> &str {
        task_ids::QUERY_GENERATOR
    }

    fn description(&self) -> Option<&str> {
        Some("Write SOQL queries for the question")
    }

    fn reads(&self) -> Vec<FieldName> {
        field_names(&[QUERY, SCHEMA, INTENT])
    }

    fn writes(&self) -> Vec<FieldName> {
        field_names(&[CRM_QUERIES])
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let intent = read_intent(&ctx.inputs)?;
        if !intent.needs_crm_data() {
            debug!(intent = %intent, "no CRM data needed");
            return Ok(());
        }

        let query: String = ctx.inputs.get(QUERY)?;
        let schema: String = ctx.inputs.get_optional(SCHEMA)?.unwrap_or_default();
        let system = format!("{}\n\nSchema:\n{}", QUERY_SYSTEM, schema);
        let user = format!("Query: {}\nIntent: {}", query, intent);

        let reply = self
            .completion
            .generate(&Prompt::new(PromptKind::QueryGeneration, system, user))
            .await?;
        let queries: Vec<CrmQuery> = parse_json::<Vec<CrmQuery>>(&reply)?
            .into_iter()
            .filter(|q| !q.soql.trim().is_empty())
            .collect();
        if queries.is_empty() {
            return Err(TaskError::ExecutionFailed("no queries generated".into()));
        }

        info!(count = queries.len(), "CRM queries generated");
        ctx.outputs.set(CRM_QUERIES, &queries)?;
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }
}

/// Picks analytics models for analytics intents.
pub struct ModelSelector {
    completion: Arc<dyn CompletionService>,
    retry: RetryPolicy,
}

impl ModelSelector {
    pub fn new(completion: Arc<dyn CompletionService>, retry: RetryPolicy) -> Self {
        Self { completion, retry }
    }
}

#[async_trait]
impl Task for ModelSelector {
    fn name(&self) -> &str {
        task_ids::MODEL_SELECTOR
    }

    fn description(&self) -> Option<&str> {
        Some("Pick analytics models for the intent")
    }

    fn reads(&self) -> Vec<FieldName> {
        field_names(&[QUERY, INTENT])
    }

    fn writes(&self) -> Vec<FieldName> {
        field_names(&[MODEL_SELECTION])
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let intent = read_intent(&ctx.inputs)?;
        if !intent.needs_analytics() {
            return Ok(());
        }

        let query: String = ctx.inputs.get(QUERY)?;
        let system = format!(
            "Select analytics models for a business question.\n\n\
             Available models:\n{}\n\n\
             Guidelines:\n{}\n\n\
             Reply with JSON: {{\"models\": [\"...\"], \"reasoning\": \"...\"}}",
            catalog::AVAILABLE_MODELS.join(", "),
            catalog::guidelines()
        );
        let user = format!("Query: {}\nIntent: {}", query, intent);

        let reply = self
            .completion
            .generate(&Prompt::new(PromptKind::ModelSelection, system, user))
            .await?;
        let mut selection: ModelSelection = parse_json(&reply)?;
        selection.models.retain(|model| {
            let known = catalog::is_known_model(model);
            if !known {
                warn!(model = %model, "dropping unknown model");
            }
            known
        });

        info!(models = ?selection.models, "models selected");
        ctx.outputs.set(MODEL_SELECTION, &selection)?;
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }
}

const GENERATOR_SYSTEM: &str = "\
No existing analytics model answers this question. Design one dbt model.
Reply with JSON: {\"name\": \"a_snake_case_name\", \"description\": \"...\", \"sql\": \"...\"}";

/// Designs and deploys a model when none of the existing ones fit.
pub struct ModelGenerator {
    completion: Arc<dyn CompletionService>,
    models: Arc<dyn ModelService>,
    retry: RetryPolicy,
}

impl ModelGenerator {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        models: Arc<dyn ModelService>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            completion,
            models,
            retry,
        }
    }
}

#[async_trait]
impl Task for ModelGenerator {
    fn name(&self) -> &str {
        task_ids::MODEL_GENERATOR
    }

    fn description(&self) -> Option<&str> {
        Some("Generate a model when none of the catalog fits")
    }

    fn reads(&self) -> Vec<FieldName> {
        field_names(&[QUERY, INTENT, MODEL_SELECTION])
    }

    fn writes(&self) -> Vec<FieldName> {
        field_names(&[GENERATED_MODEL])
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let intent = read_intent(&ctx.inputs)?;
        if !intent.needs_analytics() {
            return Ok(());
        }
        let selection: Option<ModelSelection> = ctx.inputs.get_optional(MODEL_SELECTION)?;
        if selection.is_some_and(|s| !s.models.is_empty()) {
            debug!("existing models cover the question");
            return Ok(());
        }

        let query: String = ctx.inputs.get(QUERY)?;
        let user = format!("Query: {}\nIntent: {}", query, intent);
        let reply = self
            .completion
            .generate(&Prompt::new(PromptKind::ModelGeneration, GENERATOR_SYSTEM, user))
            .await?;
        let definition: ModelDefinition = parse_json(&reply)?;
        let deployment = self.models.deploy(&definition).await?;

        info!(model = %definition.name, "new model deployed");
        let generated = GeneratedModel {
            created: true,
            model_name: Some(definition.name),
            description: Some(definition.description),
            message: "New model created".to_string(),
            deployment: Some(deployment),
        };
        ctx.outputs.set(GENERATED_MODEL, &generated)?;
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }
}

/// Runs the generated CRM queries concurrently.
pub struct DataFetcher {
    crm: Arc<dyn CrmService>,
    retry: RetryPolicy,
}

impl DataFetcher {
    pub fn new(crm: Arc<dyn CrmService>, retry: RetryPolicy) -> Self {
        Self { crm, retry }
    }
}

#[async_trait]
impl Task for DataFetcher {
    fn name(&self) -> &str {
        task_ids::DATA_FETCHER
    }

    fn description(&self) -> Option<&str> {
        Some("Run the queries against the CRM")
    }

    fn reads(&self) -> Vec<FieldName> {
        field_names(&[CRM_QUERIES])
    }

    fn writes(&self) -> Vec<FieldName> {
        field_names(&[CRM_DATA])
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let queries: Vec<CrmQuery> = ctx.inputs.get_optional(CRM_QUERIES)?.unwrap_or_default();
        if queries.is_empty() {
            return Ok(());
        }

        let outcomes = join_all(queries.iter().map(|q| self.crm.query(&q.soql))).await;

        let mut results = Map::new();
        let mut errors = Vec::new();
        for (query, outcome) in queries.iter().zip(outcomes) {
            match outcome {
                Ok(data) => {
                    results.insert(query.soql.clone(), data);
                }
                Err(err) => {
                    warn!(query = %query.soql, error = %err, "CRM query failed");
                    errors.push(format!("{}: {}", query.name, err));
                }
            }
        }
        if results.is_empty() {
            return Err(TaskError::Transient(format!(
                "all {} CRM queries failed: {}",
                queries.len(),
                errors.join("; ")
            )));
        }

        info!(fetched = results.len(), failed = errors.len(), "CRM data fetched");
        ctx.outputs
            .set(CRM_DATA, json!({"results": results, "errors": errors}))?;
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }
}

/// Runs the selected and generated analytics models.
pub struct ModelExecutor {
    models: Arc<dyn ModelService>,
    retry: RetryPolicy,
}

impl ModelExecutor {
    pub fn new(models: Arc<dyn ModelService>, retry: RetryPolicy) -> Self {
        Self { models, retry }
    }
}

#[async_trait]
impl Task for ModelExecutor {
    fn name(&self) -> &str {
        task_ids::MODEL_EXECUTOR
    }

    fn description(&self) -> Option<&str> {
        Some("Run the selected models")
    }

    fn reads(&self) -> Vec<FieldName> {
        field_names(&[MODEL_SELECTION, GENERATED_MODEL])
    }

    fn writes(&self) -> Vec<FieldName> {
        field_names(&[MODEL_RESULTS])
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let models = models_to_run(&ctx.inputs)?;
        if models.is_empty() {
            return Ok(());
        }
        let results = self.models.run_models(&models).await?;
        info!(models = models.len(), "models executed");
        ctx.outputs.set(MODEL_RESULTS, results)?;
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }
}

/// Cross-source analytics in the warehouse.
pub struct WarehouseAnalytics {
    warehouse: Arc<dyn WarehouseService>,
    retry: RetryPolicy,
}

impl WarehouseAnalytics {
    pub fn new(warehouse: Arc<dyn WarehouseService>, retry: RetryPolicy) -> Self {
        Self { warehouse, retry }
    }
}

#[async_trait]
impl Task for WarehouseAnalytics {
    fn name(&self) -> &str {
        task_ids::WAREHOUSE
    }

    fn description(&self) -> Option<&str> {
        Some("Compute warehouse metrics for the intent")
    }

    fn reads(&self) -> Vec<FieldName> {
        field_names(&[INTENT, MODEL_SELECTION])
    }

    fn writes(&self) -> Vec<FieldName> {
        field_names(&[WAREHOUSE_DATA])
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let intent = read_intent(&ctx.inputs)?;
        if !intent.needs_analytics() {
            return Ok(());
        }
        let models = ctx
            .inputs
            .get_optional::<ModelSelection>(MODEL_SELECTION)?
            .map(|s| s.models)
            .unwrap_or_default();

        let data = self.warehouse.analyze(intent, &models).await?;
        ctx.outputs.set(WAREHOUSE_DATA, data)?;
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }
}

const FUSION_SYSTEM: &str = "\
Combine live CRM data with model and warehouse results into one analysis.
Look for patterns and correlations and call out key metrics and trends.
Reply with JSON: {\"summary\": \"...\", \"key_metrics\": {}, \
\"insights\": [], \"recommendations\": []}";

/// Text of a source for the fusion prompt, cut to `limit` characters.
fn source_summary(
    inputs: &ContextView,
    field: &str,
    missing: &str,
    limit: usize,
) -> Result<String, ContextError> {
    Ok(match inputs.get_raw(field)? {
        Some(value) => truncate_chars(&value.to_string(), limit),
        None => missing.to_string(),
    })
}

/// Merges every data source into one analysis.
pub struct DataFusion {
    completion: Arc<dyn CompletionService>,
    retry: RetryPolicy,
}

impl DataFusion {
    pub fn new(completion: Arc<dyn CompletionService>, retry: RetryPolicy) -> Self {
        Self { completion, retry }
    }
}

#[async_trait]
impl Task for DataFusion {
    fn name(&self) -> &str {
        task_ids::DATA_FUSION
    }

    fn description(&self) -> Option<&str> {
        Some("Merge every data source into one analysis")
    }

    fn reads(&self) -> Vec<FieldName> {
        field_names(&[INTENT, CRM_DATA, MODEL_RESULTS, WAREHOUSE_DATA, GENERATED_MODEL])
    }

    fn writes(&self) -> Vec<FieldName> {
        field_names(&[FUSED_DATA])
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let intent = read_intent(&ctx.inputs)?;
        let limit = ctx
            .get_config_optional::<usize>(SUMMARY_LIMIT_KEY)
            .unwrap_or(DEFAULT_SUMMARY_LIMIT);

        let inputs = &ctx.inputs;
        let user = format!(
            "CRM: {}\nModels: {}\nWarehouse: {}\nGenerated model: {}\nIntent: {}",
            source_summary(inputs, CRM_DATA, "No CRM data", limit)?,
            source_summary(inputs, MODEL_RESULTS, "No model results", limit)?,
            source_summary(inputs, WAREHOUSE_DATA, "No warehouse data", limit)?,
            source_summary(inputs, GENERATED_MODEL, "No generated model", limit)?,
            intent
        );

        let prompt = Prompt::new(PromptKind::DataFusion, FUSION_SYSTEM, user).with_max_tokens(800);
        let reply = self.completion.generate(&prompt).await?;
        let fused = match parse_json::<FusedData>(&reply) {
            Ok(fused) => fused,
            Err(err) => {
                warn!(error = %err, "fusion reply was not JSON, keeping it as the summary");
                FusedData::summary_only(truncate_chars(&reply, 500))
            }
        };

        ctx.outputs.set(FUSED_DATA, &fused)?;
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }
}

const RESPONSE_SYSTEM: &str = "\
Answer the user's question in natural, concise language from the fused data.
Lead with the key insight, include the most relevant metrics, and close with
recommendations where they help. Executive questions get strategic framing,
help requests get an overview of capabilities.";

/// Writes the final answer.
pub struct ResponseWriter {
    completion: Arc<dyn CompletionService>,
    retry: RetryPolicy,
}

impl ResponseWriter {
    pub fn new(completion: Arc<dyn CompletionService>, retry: RetryPolicy) -> Self {
        Self { completion, retry }
    }
}

#[async_trait]
impl Task for ResponseWriter {
    fn name(&self) -> &str {
        task_ids::RESPONSE
    }

    fn description(&self) -> Option<&str> {
        Some("Write the answer")
    }

    fn reads(&self) -> Vec<FieldName> {
        field_names(&[QUERY, INTENT, FUSED_DATA])
    }

    fn writes(&self) -> Vec<FieldName> {
        field_names(&[FINAL_RESPONSE])
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let query: String = ctx.inputs.get(QUERY)?;
        let intent = read_intent(&ctx.inputs)?;
        let fused = ctx
            .inputs
            .get_raw(FUSED_DATA)?
            .cloned()
            .unwrap_or(Value::Null);

        let user = format!("Query: {}\nIntent: {}\nFused data: {}", query, intent, fused);
        let reply = self
            .completion
            .generate(&Prompt::new(PromptKind::Response, RESPONSE_SYSTEM, user))
            .await?;
        let answer = reply.trim();
        if answer.is_empty() {
            return Err(TaskError::ExecutionFailed("empty response".into()));
        }

        info!(length = answer.len(), "response generated");
        ctx.outputs.set(FINAL_RESPONSE, answer)?;
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }
}
