//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for the orchestrator, the
//! completion backend, and the business pipeline.

mod error;
mod types;
mod yaml;

pub use error::ConfigError;
pub use types::{
    AppConfig, CompletionConfig, ModelTier, ModelTiers, OrchestratorConfig, PipelineConfig,
    RetryConfig,
};
pub use yaml::YamlLoader;
