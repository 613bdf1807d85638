//! Error types for the host agent

use ota_updater::error::{ConfigError, StoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),

    #[error("Invalid partition layout: {0}")]
    InvalidLayout(String),

    #[error("No valid image to roll back to in {0}")]
    NoRollbackTarget(String),

    #[error("Partition store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

impl AgentError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            AgentError::InvalidConfiguration(_)
            | AgentError::InvalidLayout(_)
            | AgentError::JsonError(_)
            | AgentError::YamlError(_) => 4,
            AgentError::NoRollbackTarget(_) => 3,
            AgentError::Store(_) | AgentError::IoError(_) => 2,
        }
    }
}
