//! Transport stream interface
//!
//! The orchestrator sees the download as a plain byte stream: bounded reads
//! that return `Ok(0)` at a clean end of stream, plus a completion predicate
//! that tells a finished body apart from a truncated one.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;

/// Connection parameters handed to the transport on every attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Location of the firmware image
    pub url: String,

    /// Connect and read timeout
    pub timeout: Duration,

    /// Keep the connection alive between attempts
    pub keep_alive: bool,
}

/// Opens firmware download streams
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and start the download
    async fn open(&self, config: &TransportConfig)
    -> Result<Box<dyn TransportStream>, TransportError>;
}

/// An open firmware download
#[async_trait]
pub trait TransportStream: Send {
    /// Read up to `buf.len()` bytes. `Ok(0)` means the stream ended.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Whether the whole body was received
    fn is_complete(&self) -> bool;

    /// Body length announced by the server, if any
    fn content_length(&self) -> Option<u64> {
        None
    }

    /// Tear the connection down
    async fn close(&mut self);
}
