//! Host agent for the dual-bank update orchestrator.
//!
//! Pairs [`ota_updater::UpdateOrchestrator`] with a directory-backed
//! [`FileStore`] and an HTTP [`HttpTransport`], so the full update flow can
//! run on a development host or a Linux gateway.

#![deny(clippy::unwrap_used)]

pub mod commands;
pub mod config;
pub mod error;
pub mod file_store;
pub mod http;

pub use config::AgentConfig;
pub use error::AgentError;
pub use file_store::{FileStore, OtaData};
pub use http::HttpTransport;
