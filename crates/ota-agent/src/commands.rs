//! Subcommand implementations

use std::sync::Arc;

use ota_updater::orchestrator::{UpdateOrchestrator, UpdateReport};
use ota_updater::partition::{Partition, PartitionStore};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::file_store::FileStore;
use crate::http::HttpTransport;

/// How `run` ended
#[derive(Debug)]
pub enum RunOutcome {
    /// An update was committed and a restart requested
    Committed(UpdateReport),
    /// A single attempt ended without an update
    NotUpdated(String),
    /// Interrupted before an update was committed
    Interrupted,
}

/// Open the store described by `config`
pub fn open_store(config: &AgentConfig) -> Result<FileStore, AgentError> {
    FileStore::open(&config.storage_dir, config.app_partitions())
}

/// Run the orchestrator until an update is committed.
///
/// Ctrl-C stops polling once the attempt in progress, if any, has ended.
/// With `once`, run a single attempt right away instead of polling.
pub async fn run(config: &AgentConfig, once: bool) -> Result<RunOutcome, AgentError> {
    let store = Arc::new(open_store(config)?);
    let transport = Arc::new(HttpTransport::new());
    let mut orchestrator = UpdateOrchestrator::new(store, transport, config.ota.clone())?;

    if once {
        orchestrator.log_boot_state();
        return Ok(match orchestrator.run_attempt().await {
            Ok(report) => {
                orchestrator.reboot().await;
                RunOutcome::Committed(report)
            }
            Err(e) => RunOutcome::NotUpdated(e.to_string()),
        });
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    };
    match orchestrator.run_until(shutdown).await {
        Some(report) => Ok(RunOutcome::Committed(report)),
        None => {
            info!("Shutting down");
            Ok(RunOutcome::Interrupted)
        }
    }
}

/// One slot in the status output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotStatus {
    pub partition: Partition,
    pub running: bool,
    pub boot: bool,
    pub last_invalid: bool,
    pub image: Option<ImageSummary>,
}

/// Descriptor fields shown by `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSummary {
    pub version: String,
    pub project: String,
    pub built: String,
    pub elf_sha256: String,
}

/// Snapshot of the partition store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub running: String,
    pub boot: String,
    pub last_invalid: Option<String>,
    pub slots: Vec<SlotStatus>,
}

impl StatusReport {
    /// Collect the status of every slot in `store`
    pub fn collect(store: &FileStore) -> Self {
        let running = store.running_partition();
        let boot = store.configured_boot_partition();
        let invalid = store.last_invalid_partition();

        let slots = store
            .slots()
            .iter()
            .map(|p| SlotStatus {
                partition: p.clone(),
                running: *p == running,
                boot: *p == boot,
                last_invalid: invalid.as_ref() == Some(p),
                image: store.descriptor_of(p).map(|d| ImageSummary {
                    version: d.version_str(),
                    project: d.project_name_str(),
                    built: d.build_stamp().trim().to_string(),
                    elf_sha256: d.elf_sha256_hex(),
                }),
            })
            .collect();

        Self {
            running: running.label,
            boot: boot.label,
            last_invalid: invalid.map(|p| p.label),
            slots,
        }
    }

    /// Human-readable rendering
    pub fn render(&self) -> String {
        let mut out = String::new();
        for slot in &self.slots {
            let mut flags = Vec::new();
            if slot.running {
                flags.push("running");
            }
            if slot.boot {
                flags.push("boot");
            }
            if slot.last_invalid {
                flags.push("invalid");
            }
            let image = slot
                .image
                .as_ref()
                .map_or_else(|| "empty".to_string(), |i| format!("{} {}", i.project, i.version));
            out.push_str(&format!(
                "{:<8} 0x{:08x} {:>8}  {:<24} [{}]\n",
                slot.partition.label,
                slot.partition.offset,
                slot.partition.size,
                image,
                flags.join(",")
            ));
        }
        if self.running != self.boot {
            out.push_str(&format!("pending restart: {} -> {}\n", self.running, self.boot));
        }
        out
    }
}

/// Collect the status report for `config`
pub fn status(config: &AgentConfig) -> Result<StatusReport, AgentError> {
    Ok(StatusReport::collect(&open_store(config)?))
}

/// Mark the boot image invalid and roll back to the other slot
pub async fn mark_invalid(config: &AgentConfig) -> Result<(Partition, Partition), AgentError> {
    open_store(config)?.mark_boot_invalid().await
}
