//! YAML configuration parsing.
//!
//! Parses the application configuration from YAML files.

use std::path::Path;

use super::error::ConfigError;
use super::types::{AppConfig, ModelTier};

/// YAML configuration loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load configuration from a file.
    pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_config(&content)
    }

    /// Parse configuration from a YAML string.
    ///
    /// An empty document yields the defaults.
    pub fn parse_config(yaml: &str) -> Result<AppConfig, ConfigError> {
        let config: AppConfig = if yaml.trim().is_empty() {
            AppConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        Self::validate_config(&config)?;
        Ok(config)
    }

    /// Load a file if given, otherwise use the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
        match path {
            Some(path) => Self::load_config(path),
            None => Ok(AppConfig::default()),
        }
    }

    fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
        let orchestrator = &config.orchestrator;
        if orchestrator.max_concurrent_tasks == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_concurrent_tasks cannot be zero".into(),
            ));
        }
        if orchestrator.deadline_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "deadline_secs cannot be zero".into(),
            ));
        }

        let completion = &config.completion;
        for tier in ModelTier::ALL {
            if completion.model_for(tier).trim().is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "completion.models.{}",
                    tier.as_str()
                )));
            }
        }
        if completion.base_url.trim().is_empty() {
            return Err(ConfigError::MissingField("completion.base_url".into()));
        }
        if completion.timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "completion timeout_secs cannot be zero".into(),
            ));
        }

        if config.pipeline.summary_limit == 0 {
            return Err(ConfigError::InvalidConfig(
                "summary_limit cannot be zero".into(),
            ));
        }

        Ok(())
    }
}
