//! Business question pipeline.
//!
//! Nine tasks that turn a sales question into an answer, run in six layers:
//!
//! ```text
//! 0  intent_router
//! 1  query_generator, model_selector
//! 2  model_generator, data_fetcher, warehouse
//! 3  model_executor
//! 4  data_fusion
//! 5  response
//! ```
//!
//! Every backend is injected through [`Services`]; nothing here reaches for
//! a global client.

pub mod catalog;
pub mod fallbacks;
pub mod http;
pub mod intent;
pub mod records;
pub mod services;
pub mod simulated;
pub mod tasks;

use serde_json::json;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::context::{ContextError, SharedContext};
use crate::core::fallback::FallbackPolicy;
use crate::core::graph::{DependencyGraph, GraphBuilder, GraphError};
use crate::core::registry::TaskRegistry;
use crate::core::retry::RetryPolicy;
use crate::events::EventBus;
use crate::execution::{ExecutionReport, Orchestrator, RunStatus};

pub use intent::Intent;
pub use records::Turn;
pub use services::{ServiceError, Services};

use fallbacks::{
    EmptyCrmData, KeywordModelSelection, KeywordRouter, NoGeneratedModel, SimulatedModelResults,
    SimulatedWarehouseMetrics, SummaryOnlyFusion, TemplateResponse,
};
use http::HttpCompletionService;
use tasks::{
    DataFetcher, DataFusion, IntentRouter, ModelExecutor, ModelGenerator, ModelSelector,
    QueryGenerator, ResponseWriter, SUMMARY_LIMIT_KEY, WarehouseAnalytics,
};

/// Context fields exchanged by the pipeline tasks.
pub mod fields {
    /// The user's question. Supplied by the caller.
    pub const QUERY: &str = "query";
    /// Earlier turns of the conversation. Supplied by the caller.
    pub const HISTORY: &str = "history";
    /// CRM schema description. Supplied by the caller.
    pub const SCHEMA: &str = "schema";

    pub const INTENT: &str = "intent";
    pub const CRM_QUERIES: &str = "crm_queries";
    pub const MODEL_SELECTION: &str = "model_selection";
    pub const GENERATED_MODEL: &str = "generated_model";
    pub const CRM_DATA: &str = "crm_data";
    pub const MODEL_RESULTS: &str = "model_results";
    pub const WAREHOUSE_DATA: &str = "warehouse_data";
    pub const FUSED_DATA: &str = "fused_data";
    /// The answer.
    pub const FINAL_RESPONSE: &str = "final_response";
}

/// Task identifiers.
pub mod task_ids {
    pub const INTENT_ROUTER: &str = "intent_router";
    pub const QUERY_GENERATOR: &str = "query_generator";
    pub const MODEL_SELECTOR: &str = "model_selector";
    pub const MODEL_GENERATOR: &str = "model_generator";
    pub const DATA_FETCHER: &str = "data_fetcher";
    pub const MODEL_EXECUTOR: &str = "model_executor";
    pub const WAREHOUSE: &str = "warehouse";
    pub const DATA_FUSION: &str = "data_fusion";
    pub const RESPONSE: &str = "response";
}

pub const GRAPH_ID: &str = "business_question";

/// Shown when no answer can be given.
pub const APOLOGY: &str = "I encountered an error processing your request.";

use task_ids::*;

/// The pipeline's dependency graph.
pub fn graph() -> Result<DependencyGraph, GraphError> {
    GraphBuilder::new()
        .add_task(INTENT_ROUTER)
        .add_task_with_deps(QUERY_GENERATOR, &[INTENT_ROUTER])
        .add_task_with_deps(MODEL_SELECTOR, &[INTENT_ROUTER])
        .add_task_with_deps(MODEL_GENERATOR, &[MODEL_SELECTOR])
        .add_task_with_deps(DATA_FETCHER, &[QUERY_GENERATOR])
        .add_task_with_deps(MODEL_EXECUTOR, &[MODEL_SELECTOR, MODEL_GENERATOR])
        .add_task_with_deps(WAREHOUSE, &[MODEL_SELECTOR])
        .add_task_with_deps(
            DATA_FUSION,
            &[DATA_FETCHER, MODEL_EXECUTOR, WAREHOUSE, MODEL_GENERATOR],
        )
        .add_task_with_deps(RESPONSE, &[DATA_FUSION])
        .build()
}

/// Register every pipeline task against the given backends.
///
/// Each backend is probed once here; tasks whose backend is unreachable go
/// straight to their fallback on every run.
pub async fn registry(
    services: &Services,
    retry: &RetryPolicy,
) -> Result<TaskRegistry, GraphError> {
    let llm = &services.completion;
    let mut registry = TaskRegistry::new();

    let router_policy = FallbackPolicy::probed(KeywordRouter, llm.as_ref()).await;
    let llm_availability = router_policy.availability().clone();

    registry.register_with_fallback(
        Arc::new(IntentRouter::new(Arc::clone(llm), retry.clone())),
        router_policy,
    )?;
    registry.register(Arc::new(QueryGenerator::new(Arc::clone(llm), retry.clone())))?;
    registry.register_with_fallback(
        Arc::new(ModelSelector::new(Arc::clone(llm), retry.clone())),
        FallbackPolicy::new(KeywordModelSelection).with_availability(llm_availability.clone()),
    )?;
    registry.register_with_fallback(
        Arc::new(ModelGenerator::new(
            Arc::clone(llm),
            Arc::clone(&services.models),
            retry.clone(),
        )),
        FallbackPolicy::new(NoGeneratedModel).with_availability(llm_availability.clone()),
    )?;
    registry.register_with_fallback(
        Arc::new(DataFetcher::new(Arc::clone(&services.crm), retry.clone())),
        FallbackPolicy::probed(EmptyCrmData, services.crm.as_ref()).await,
    )?;
    registry.register_with_fallback(
        Arc::new(ModelExecutor::new(Arc::clone(&services.models), retry.clone())),
        FallbackPolicy::probed(SimulatedModelResults, services.models.as_ref()).await,
    )?;
    registry.register_with_fallback(
        Arc::new(WarehouseAnalytics::new(
            Arc::clone(&services.warehouse),
            retry.clone(),
        )),
        FallbackPolicy::probed(SimulatedWarehouseMetrics, services.warehouse.as_ref()).await,
    )?;
    registry.register_with_fallback(
        Arc::new(DataFusion::new(Arc::clone(llm), retry.clone())),
        FallbackPolicy::new(SummaryOnlyFusion).with_availability(llm_availability.clone()),
    )?;
    registry.register_with_fallback(
        Arc::new(ResponseWriter::new(Arc::clone(llm), retry.clone())),
        FallbackPolicy::new(TemplateResponse).with_availability(llm_availability.clone()),
    )?;

    Ok(registry)
}

/// Assemble a ready-to-run orchestrator for the pipeline.
pub async fn build_orchestrator(
    config: &AppConfig,
    services: &Services,
    events: Option<Arc<EventBus>>,
) -> Result<Orchestrator, GraphError> {
    let retry = RetryPolicy::from(&config.orchestrator.retry);
    let mut builder = Orchestrator::builder(graph()?, registry(services, &retry).await?)
        .graph_id(GRAPH_ID)
        .initial_fields([fields::QUERY, fields::HISTORY, fields::SCHEMA])
        .terminal(RESPONSE)
        .output_field(fields::FINAL_RESPONSE)
        .max_concurrency(config.orchestrator.max_concurrent_tasks)
        .deadline(config.orchestrator.deadline())
        .failure_policy(config.orchestrator.failure_policy)
        .config_value(SUMMARY_LIMIT_KEY, json!(config.pipeline.summary_limit));
    if let Some(bus) = events {
        builder = builder.event_bus(bus);
    }
    builder.build()
}

impl Services {
    /// Backends described by the configuration.
    ///
    /// Only the language model has a remote client; the data backends are
    /// simulated.
    pub fn from_config(config: &AppConfig) -> Result<Self, ServiceError> {
        if config.pipeline.simulate {
            return Ok(Services::simulated());
        }
        let completion = HttpCompletionService::new(&config.completion)?;
        Ok(Services::simulated().with_completion(Arc::new(completion)))
    }
}

/// A fresh context for one question.
pub fn initial_context(
    query: &str,
    history: &[Turn],
    schema: &str,
) -> Result<SharedContext, ContextError> {
    SharedContext::new()
        .with(fields::QUERY, query)?
        .with(fields::HISTORY, history)?
        .with(fields::SCHEMA, schema)
}

/// The text to show the user for a finished run.
pub fn render_answer(report: &ExecutionReport) -> String {
    let answer = report
        .answer::<String>()
        .filter(|answer| !answer.trim().is_empty());

    match (report.status, answer) {
        (RunStatus::Succeeded, Some(answer)) => answer,
        (RunStatus::PartiallyFailed, Some(answer)) => {
            let missing: Vec<&str> = report
                .failed_tasks()
                .into_iter()
                .chain(report.skipped_tasks())
                .map(|id| id.as_str())
                .collect();
            format!(
                "{}\n\n(Some data was unavailable: {}.)",
                answer,
                missing.join(", ")
            )
        }
        _ => {
            let failed: Vec<&str> = report.failed_tasks().iter().map(|id| id.as_str()).collect();
            if failed.is_empty() {
                APOLOGY.to_string()
            } else {
                format!("{} Failed steps: {}.", APOLOGY, failed.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::planner::plan_layers;
    use crate::core::types::TaskId;

    #[test]
    fn test_graph_layers() {
        let plan = plan_layers(&graph().unwrap());
        let layers: Vec<Vec<&str>> = plan
            .layers()
            .iter()
            .map(|layer| layer.iter().map(|id| id.as_str()).collect())
            .collect();

        assert_eq!(
            layers,
            vec![
                vec![INTENT_ROUTER],
                vec![QUERY_GENERATOR, MODEL_SELECTOR],
                vec![MODEL_GENERATOR, DATA_FETCHER, WAREHOUSE],
                vec![MODEL_EXECUTOR],
                vec![DATA_FUSION],
                vec![RESPONSE],
            ]
        );
    }

    #[tokio::test]
    async fn test_build_orchestrator_validates() {
        let orchestrator = build_orchestrator(&AppConfig::default(), &Services::simulated(), None)
            .await
            .unwrap();

        assert_eq!(orchestrator.terminal(), &TaskId::new(RESPONSE));
        assert_eq!(orchestrator.registry().len(), 9);
        let fusion = orchestrator.registry().get(&TaskId::new(DATA_FUSION)).unwrap();
        assert!(fusion.fallback().unwrap().primary_available());
    }

    #[tokio::test]
    async fn test_every_task_describes_itself() {
        let registry = registry(&Services::simulated(), &RetryPolicy::default())
            .await
            .unwrap();

        for id in registry.ids() {
            let registration = registry.get(id).unwrap();
            assert!(registration.description().is_some(), "{} has no description", id);
        }
        let fetcher = registry.get(&TaskId::new(DATA_FETCHER)).unwrap();
        assert!(fetcher.outline().starts_with("data_fetcher: Run the queries"));
        assert!(fetcher.outline().contains("[fallback: "));
    }

    #[tokio::test]
    async fn test_simulated_run_answers() {
        let orchestrator = build_orchestrator(&AppConfig::default(), &Services::simulated(), None)
            .await
            .unwrap();
        let ctx =
            initial_context("Why are deals slipping?", &[], "Opportunity(Id, Amount)").unwrap();

        let report = orchestrator.run(ctx).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert!(render_answer(&report).contains("Why are deals slipping?"));
        assert!(report.final_context.contains(fields::WAREHOUSE_DATA));
        // models were selected, so nothing new is generated
        assert!(!report.final_context.contains(fields::GENERATED_MODEL));
    }

    #[test]
    fn test_initial_context_fields() {
        let ctx = initial_context("q", &[Turn::user("hi")], "s").unwrap();
        let history: Vec<Turn> = ctx.get(fields::HISTORY).unwrap();
        assert_eq!(history, vec![Turn::user("hi")]);
        assert_eq!(ctx.get::<String>(fields::SCHEMA).unwrap(), "s");
    }
}
