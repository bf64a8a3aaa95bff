//! Errors raised while loading `askflow.yaml`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The document is not YAML, or a value has the wrong type.
    #[error("config is not valid YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A required string is empty.
    #[error("missing required field: {0}")]
    MissingField(String),
}
