//! Staged writer over a partition store write session
//!
//! The writer owns the session handle. Whatever happens, the handle is handed
//! back to the store exactly once: through `end_write` when the image is
//! finalized, through `abort_write` on every other path.

use tracing::{debug, error, info};

use crate::error::StoreError;
use crate::partition::{Partition, PartitionStore, WriteHandle};

/// Lifecycle of a write session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Session open, chunks may be appended
    Open,
    /// `end_write` was called (successfully or not)
    Finalized,
    /// `abort_write` was called
    Aborted,
}

/// Sequential write session into the update partition
pub struct StagedWriter<'a> {
    store: &'a dyn PartitionStore,
    target: Partition,
    handle: Option<WriteHandle>,
    bytes_written: u64,
    state: WriterState,
}

impl<'a> StagedWriter<'a> {
    /// Open a write session on `target`
    pub async fn begin(
        store: &'a dyn PartitionStore,
        target: &Partition,
    ) -> Result<StagedWriter<'a>, StoreError> {
        let handle = store.begin_write(target).await.map_err(|e| match e {
            StoreError::BeginFailed(_) => e,
            other => StoreError::BeginFailed(other.to_string()),
        })?;
        info!(partition = %target, "Write session opened");

        Ok(Self {
            store,
            target: target.clone(),
            handle: Some(handle),
            bytes_written: 0,
            state: WriterState::Open,
        })
    }

    /// Append a chunk. Any store failure ends the attempt.
    pub async fn append(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        let handle = match (self.state, self.handle) {
            (WriterState::Open, Some(handle)) => handle,
            _ => return Err(StoreError::SessionClosed),
        };

        self.store.write(handle, chunk).await.map_err(|e| match e {
            StoreError::WriteFailed(_) => e,
            other => StoreError::WriteFailed(other.to_string()),
        })?;

        self.bytes_written = self.bytes_written.saturating_add(chunk.len() as u64);
        debug!(bytes_written = self.bytes_written, "Written image length");
        Ok(())
    }

    /// Close the session and let the store validate the image.
    ///
    /// The handle is consumed whether or not validation passes.
    pub async fn finalize(&mut self) -> Result<u64, StoreError> {
        let handle = match (self.state, self.handle.take()) {
            (WriterState::Open, Some(handle)) => handle,
            _ => return Err(StoreError::SessionClosed),
        };
        self.state = WriterState::Finalized;

        match self.store.end_write(handle).await {
            Ok(()) => {
                info!(
                    partition = %self.target,
                    bytes_written = self.bytes_written,
                    "Image finalized"
                );
                Ok(self.bytes_written)
            }
            Err(StoreError::ValidationFailed(reason)) => {
                error!(%reason, "Image validation failed, image is corrupted");
                Err(StoreError::ValidationFailed(reason))
            }
            Err(e) => {
                error!(error = %e, "Ending write session failed");
                Err(match e {
                    StoreError::EndFailed(_) => e,
                    other => StoreError::EndFailed(other.to_string()),
                })
            }
        }
    }

    /// Release the session without validating. No-op if already closed.
    pub async fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.store.abort_write(handle).await;
            self.state = WriterState::Aborted;
            info!(
                partition = %self.target,
                bytes_written = self.bytes_written,
                "Write session aborted"
            );
        }
    }

    /// Bytes appended so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Current lifecycle state
    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Partition being written
    pub fn target(&self) -> &Partition {
        &self.target
    }
}

impl Drop for StagedWriter<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle {
            error!(
                ?handle,
                partition = %self.target,
                "Write session dropped while still open"
            );
        }
    }
}
