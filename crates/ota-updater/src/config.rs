//! Update orchestrator configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::image::HEADER_REGION_LEN;
use crate::transport::TransportConfig;

/// Default delay between update checks
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// Default connect/read timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Default size of the chunk buffer
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Settings supplied by the surrounding process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    /// Location of the firmware image
    pub update_url: String,

    /// Delay before every update check, in milliseconds
    pub poll_interval_ms: u64,

    /// Connect/read timeout passed to the transport, in milliseconds
    pub timeout_ms: u64,

    /// Keep the transport connection alive
    pub keep_alive: bool,

    /// Size of the chunk buffer used for every read
    pub chunk_size: usize,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            update_url: String::new(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            keep_alive: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl OtaConfig {
    /// Config with defaults for everything but the URL
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            update_url: url.into(),
            ..Self::default()
        }
    }

    /// Check that the configuration can drive an update.
    ///
    /// The chunk buffer must hold the whole header region, because the
    /// descriptor is only looked for in the first chunk.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.update_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "update_url",
                reason: "must not be empty".to_string(),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "poll_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.chunk_size < HEADER_REGION_LEN {
            return Err(ConfigError::InvalidValue {
                field: "chunk_size",
                reason: format!(
                    "{} is smaller than the {} byte image header region",
                    self.chunk_size, HEADER_REGION_LEN
                ),
            });
        }
        Ok(())
    }

    /// Delay between update checks
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Transport parameters derived from this config
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            url: self.update_url.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
            keep_alive: self.keep_alive,
        }
    }
}
