//! Agent configuration
//!
//! Loaded from a JSON or YAML file, picked by extension. Every field has a
//! default, so a file holding only `ota.update_url` is enough.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use ota_updater::config::OtaConfig;
use ota_updater::partition::{Partition, PartitionKind};
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Settings for the host agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Orchestrator settings
    pub ota: OtaConfig,

    /// Directory holding the slot images and the boot record
    pub storage_dir: PathBuf,

    /// Application slots, in update order
    pub partitions: Vec<Partition>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ota: OtaConfig::default(),
            storage_dir: PathBuf::from("ota-data"),
            partitions: default_partitions(),
        }
    }
}

/// Two 1 MiB application slots
pub fn default_partitions() -> Vec<Partition> {
    vec![
        Partition::app("ota_0", 16, 0x0001_0000, 0x0010_0000),
        Partition::app("ota_1", 17, 0x0011_0000, 0x0010_0000),
    ]
}

impl AgentConfig {
    /// Read and validate a config file
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::parse(&text, is_yaml(path))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse config text without validating it
    pub fn parse(text: &str, yaml: bool) -> Result<Self, AgentError> {
        if yaml {
            Ok(serde_yaml::from_str(text)?)
        } else {
            Ok(serde_json::from_str(text)?)
        }
    }

    /// Check the orchestrator settings and the partition layout
    pub fn validate(&self) -> Result<(), AgentError> {
        self.ota.validate()?;

        let apps = self
            .partitions
            .iter()
            .filter(|p| p.kind == PartitionKind::App)
            .count();
        if apps < 2 {
            return Err(AgentError::InvalidLayout(format!(
                "need at least two app partitions, found {apps}"
            )));
        }

        let mut labels = HashSet::new();
        for partition in &self.partitions {
            if partition.label.is_empty() || partition.label.contains(['/', '\\']) {
                return Err(AgentError::InvalidLayout(format!(
                    "unusable partition label {:?}",
                    partition.label
                )));
            }
            if !labels.insert(partition.label.as_str()) {
                return Err(AgentError::InvalidLayout(format!(
                    "duplicate partition label {}",
                    partition.label
                )));
            }
        }
        Ok(())
    }

    /// Application slots only
    pub fn app_partitions(&self) -> Vec<Partition> {
        self.partitions
            .iter()
            .filter(|p| p.kind == PartitionKind::App)
            .cloned()
            .collect()
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    )
}
