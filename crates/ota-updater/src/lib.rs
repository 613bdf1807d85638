//! Dual-bank firmware self-update
//!
//! This crate downloads a firmware image, checks it against the running image
//! and the last image that failed to boot, streams it into the inactive bank
//! and switches the boot target only once the whole image arrived and passed
//! validation:
//! - A/B partition model with a pluggable partition store
//! - Image header parsing straight from the first downloaded chunk
//! - Equality-based version and rollback guard
//! - Staged writes that are always finalized or aborted
//! - A polling state machine that retries forever on a fixed interval
//!
//! # Architecture
//!
//! - [`partition`]: partition model and the [`PartitionStore`] trait
//! - [`transport`]: the [`Transport`] / [`TransportStream`] traits
//! - [`image`]: image header layout and descriptor parsing
//! - [`guard`]: version/rollback decision
//! - [`writer`]: staged write session
//! - [`orchestrator`]: the update state machine
//! - [`config`]: orchestrator configuration
//! - [`error`]: error types
//!
//! # Safety
//!
//! The running partition is never written. A failed attempt at any stage
//! leaves the boot record untouched, so the device keeps booting the image it
//! runs now.
//!
//! # Example
//!
//! ```ignore
//! use ota_updater::prelude::*;
//!
//! # async fn example(store: Arc<dyn PartitionStore>, transport: Arc<dyn Transport>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = OtaConfig::with_url("https://fw.example.com/app.bin");
//! let mut orchestrator = UpdateOrchestrator::new(store, transport, config)?;
//!
//! // Only returns if the store's restart hook returns
//! let report = orchestrator.run().await;
//! println!("Installed {} into {}", report.version, report.target);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod error;
pub mod guard;
pub mod image;
pub mod orchestrator;
pub mod partition;
pub mod prelude;
pub mod transport;
pub mod writer;

#[cfg(test)]
mod test_support;

pub use config::OtaConfig;
pub use error::{ConfigError, ErrorCategory, ImageError, OtaError, StoreError, TransportError};
pub use guard::{GuardDecision, RejectReason};
pub use image::{FirmwareDescriptor, HEADER_REGION_LEN, parse_descriptor};
pub use orchestrator::{AttemptStats, UpdateEvent, UpdateOrchestrator, UpdateReport, UpdateState};
pub use partition::{Partition, PartitionKind, PartitionStore, WriteHandle};
pub use transport::{Transport, TransportConfig, TransportStream};
pub use writer::{StagedWriter, WriterState};
