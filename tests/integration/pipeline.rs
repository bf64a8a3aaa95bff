//! The business question pipeline against test doubles.

use askflow::pipeline::fields::{FINAL_RESPONSE, FUSED_DATA, MODEL_RESULTS, WAREHOUSE_DATA};
use askflow::pipeline::records::FusedData;
use askflow::pipeline::services::PromptKind;
use askflow::pipeline::task_ids::{
    DATA_FETCHER, DATA_FUSION, INTENT_ROUTER, QUERY_GENERATOR, RESPONSE,
};
use askflow::pipeline::{self, APOLOGY, Services};
use askflow::testing::{OfflineBackend, ScriptedCompletion, TestHarness};
use askflow::{AppConfig, RunStatus, TaskId, TaskStatus};
use std::sync::Arc;

/// Defaults with retries that do not wait.
fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.orchestrator.retry.delay_secs = 0;
    config
}

fn with_llm(completion: Arc<dyn askflow::pipeline::services::CompletionService>) -> Services {
    Services::simulated().with_completion(completion)
}

fn degraded(report: &askflow::ExecutionReport, id: &str) -> bool {
    report.degraded_tasks().contains(&&TaskId::new(id))
}

#[tokio::test]
async fn test_simulated_analytics_question() {
    let harness = TestHarness::pipeline_with_config(&fast_config(), Services::simulated())
        .await
        .unwrap();

    let report = harness
        .ask("Analyze why deals are slipping this quarter")
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(report.degraded_tasks().is_empty());
    for field in [MODEL_RESULTS, WAREHOUSE_DATA, FUSED_DATA, FINAL_RESPONSE] {
        assert!(report.final_context.contains(field), "missing {}", field);
    }

    // commit order follows the layers
    let layer_of = |id: &TaskId| {
        report
            .layers
            .iter()
            .position(|layer| layer.contains(id))
            .unwrap()
    };
    let order: Vec<usize> = report
        .execution_path()
        .iter()
        .map(|entry| layer_of(&entry.task_id))
        .collect();
    assert!(order.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[tokio::test]
async fn test_offline_llm_greeting_uses_fallbacks() {
    let services = with_llm(Arc::new(OfflineBackend::new("llm")));
    let harness = TestHarness::pipeline_with_config(&fast_config(), services)
        .await
        .unwrap();

    let report = harness.ask("hello").await.unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(degraded(&report, INTENT_ROUTER));
    assert!(degraded(&report, RESPONSE));
    assert_eq!(
        report.answer::<String>().as_deref(),
        Some("Hello! Ask me anything about your sales data.")
    );
}

#[tokio::test]
async fn test_offline_llm_data_question_aborts_with_apology() {
    let services = with_llm(Arc::new(OfflineBackend::new("llm")));
    let harness = TestHarness::pipeline_with_config(&fast_config(), services)
        .await
        .unwrap();

    let report = harness
        .ask("Show the largest open opportunities")
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(
        report.status_of(&TaskId::new(QUERY_GENERATOR)),
        Some(TaskStatus::Failed)
    );
    for skipped in [DATA_FETCHER, DATA_FUSION, RESPONSE] {
        assert_eq!(
            report.status_of(&TaskId::new(skipped)),
            Some(TaskStatus::Skipped)
        );
    }
    let rendered = pipeline::render_answer(&report);
    assert!(rendered.starts_with(APOLOGY));
    assert!(rendered.contains(QUERY_GENERATOR));
}

#[tokio::test]
async fn test_prose_fusion_reply_becomes_summary() {
    let llm = ScriptedCompletion::new().reply(PromptKind::DataFusion, "Coverage looks thin.");
    let harness = TestHarness::pipeline_with_config(&fast_config(), with_llm(Arc::new(llm)))
        .await
        .unwrap();

    let report = harness
        .ask("Give me an executive briefing on the forecast")
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    let fused: FusedData = report.final_context.get(FUSED_DATA).unwrap();
    assert_eq!(fused.summary, "Coverage looks thin.");
    assert!(fused.insights.is_empty());
    assert!(!degraded(&report, DATA_FUSION));
}

#[tokio::test]
async fn test_failing_response_is_retried_then_templated() {
    let llm = Arc::new(ScriptedCompletion::new().fail(PromptKind::Response, 503));
    let harness = TestHarness::pipeline_with_config(&fast_config(), with_llm(llm.clone()))
        .await
        .unwrap();

    let report = harness.ask("What is our win rate?").await.unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(degraded(&report, RESPONSE));
    let result = report.get_task_result(&TaskId::new(RESPONSE)).unwrap();
    assert_eq!(result.attempts, 2);

    let response_calls = llm
        .prompts()
        .await
        .into_iter()
        .filter(|kind| *kind == PromptKind::Response)
        .count();
    assert_eq!(response_calls, 2);
    assert!(pipeline::render_answer(&report).starts_with("Here's what I found"));
}

#[tokio::test]
async fn test_unparseable_intent_falls_back_to_keywords() {
    let llm = ScriptedCompletion::new().reply(PromptKind::IntentClassification, "not json");
    let harness = TestHarness::pipeline_with_config(&fast_config(), with_llm(Arc::new(llm)))
        .await
        .unwrap();

    let report = harness.ask("what can you do?").await.unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(degraded(&report, INTENT_ROUTER));
    // an unparseable reply is not transient, so it is not retried
    let result = report.get_task_result(&TaskId::new(INTENT_ROUTER)).unwrap();
    assert_eq!(result.attempts, 1);
}

#[tokio::test]
async fn test_orchestrator_answers_repeated_questions() {
    let harness = TestHarness::pipeline(Services::simulated()).await.unwrap();

    let first = harness.ask("What is our win rate?").await.unwrap();
    let second = harness.ask("hello").await.unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.status, RunStatus::Succeeded);
    assert_eq!(second.status, RunStatus::Succeeded);
}
