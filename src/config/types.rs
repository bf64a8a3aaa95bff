//! Configuration type definitions.
//!
//! Every section and field is optional in the file; missing values take the
//! defaults below.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::retry::{RetryCondition, RetryPolicy};
use crate::execution::FailurePolicy;

/// Top-level configuration (askflow.yaml).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub orchestrator: OrchestratorConfig,
    pub completion: CompletionConfig,
    pub pipeline: PipelineConfig,
}

/// Run-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum tasks running at once within a layer.
    pub max_concurrent_tasks: usize,
    /// Wall-clock budget for a whole run.
    pub deadline_secs: u64,
    pub failure_policy: FailurePolicy,
    /// Retry policy applied to tasks that talk to remote backends.
    pub retry: RetryConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            deadline_secs: 60,
            failure_policy: FailurePolicy::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_attempts: u32,
    /// Delay between retries in seconds.
    pub delay_secs: u64,
    pub condition: RetryCondition,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay_secs: 1,
            condition: RetryCondition::TransientOnly,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy::fixed(config.max_attempts, Duration::from_secs(config.delay_secs))
            .with_condition(config.condition)
    }
}

/// Language model endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Base URL of an OpenAI-compatible API.
    pub base_url: String,
    /// Model used for each cost tier.
    pub models: ModelTiers,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            models: ModelTiers::default(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 30,
            max_tokens: 1000,
        }
    }
}

impl CompletionConfig {
    /// The API key, if its environment variable is set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn model_for(&self, tier: ModelTier) -> &str {
        self.models.get(tier)
    }
}

/// Cost tier of a completion, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    UltraFast,
    Fast,
    Balanced,
    Accurate,
}

impl ModelTier {
    pub const ALL: [ModelTier; 4] = [
        ModelTier::UltraFast,
        ModelTier::Fast,
        ModelTier::Balanced,
        ModelTier::Accurate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::UltraFast => "ultra_fast",
            ModelTier::Fast => "fast",
            ModelTier::Balanced => "balanced",
            ModelTier::Accurate => "accurate",
        }
    }
}

/// Model name per tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelTiers {
    pub ultra_fast: String,
    pub fast: String,
    pub balanced: String,
    pub accurate: String,
}

impl Default for ModelTiers {
    fn default() -> Self {
        Self {
            ultra_fast: "gpt-4o-mini".to_string(),
            fast: "gpt-3.5-turbo".to_string(),
            balanced: "gpt-4o".to_string(),
            accurate: "gpt-4-turbo".to_string(),
        }
    }
}

impl ModelTiers {
    pub fn get(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::UltraFast => &self.ultra_fast,
            ModelTier::Fast => &self.fast,
            ModelTier::Balanced => &self.balanced,
            ModelTier::Accurate => &self.accurate,
        }
    }
}

/// Business pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Use simulated backends instead of remote services.
    pub simulate: bool,
    /// Maximum characters of each data summary handed to fusion.
    pub summary_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            simulate: false,
            summary_limit: 800,
        }
    }
}
