//! Configuration files driving the pipeline.

use askflow::config::{ConfigError, ModelTiers};
use askflow::pipeline::Services;
use askflow::pipeline::http::HttpCompletionService;
use askflow::pipeline::services::PromptKind;
use askflow::testing::TestHarness;
use askflow::{FailurePolicy, RetryCondition, RetryPolicy, YamlLoader};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn test_config_file_shapes_the_orchestrator() {
    let file = write_config(
        r#"
orchestrator:
  max_concurrent_tasks: 2
  deadline_secs: 15
  failure_policy: fail_fast
  retry:
    max_attempts: 3
    delay_secs: 0
    condition: always
pipeline:
  simulate: true
  summary_limit: 200
"#,
    );

    let config = YamlLoader::load_config(file.path()).unwrap();
    assert_eq!(config.orchestrator.failure_policy, FailurePolicy::FailFast);
    assert_eq!(
        RetryPolicy::from(&config.orchestrator.retry),
        RetryPolicy::fixed(3, Duration::ZERO).with_condition(RetryCondition::Always)
    );
    // unspecified sections keep their defaults
    assert_eq!(config.completion.models, ModelTiers::default());

    let harness = TestHarness::pipeline_with_config(&config, Services::simulated())
        .await
        .unwrap();
    let orchestrator = harness.orchestrator();
    assert_eq!(orchestrator.failure_policy(), FailurePolicy::FailFast);
    assert_eq!(orchestrator.deadline(), Some(Duration::from_secs(15)));

    let report = harness.ask("Why is win rate trending down?").await.unwrap();
    assert!(report.is_success());
}

#[test]
fn test_model_tiers_from_file_reach_the_completion_client() {
    let file = write_config(
        r#"
completion:
  models:
    ultra_fast: router-mini
    accurate: analyst-large
"#,
    );

    let config = YamlLoader::load_config(file.path()).unwrap();
    let client = HttpCompletionService::new(&config.completion).unwrap();

    assert_eq!(client.model_for(PromptKind::IntentClassification), "router-mini");
    assert_eq!(client.model_for(PromptKind::Response), "analyst-large");
    assert_eq!(client.model_for(PromptKind::ModelGeneration), "analyst-large");
    assert_eq!(
        client.model_for(PromptKind::QueryGeneration),
        ModelTiers::default().fast
    );
}

#[test]
fn test_invalid_config_file_is_rejected() {
    let file = write_config("orchestrator:\n  max_concurrent_tasks: 0\n");

    let err = YamlLoader::load_config(file.path()).unwrap_err();

    assert!(matches!(err, ConfigError::InvalidConfig(_)));
}

#[test]
fn test_missing_config_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.yaml");

    let err = YamlLoader::load_or_default(Some(&path)).unwrap_err();

    match err {
        ConfigError::FileReadError { path: reported, .. } => assert_eq!(reported, path),
        other => panic!("expected FileReadError, got {:?}", other),
    }
    assert!(YamlLoader::load_or_default(None).is_ok());
}
