//! A/B partition model and the partition store interface
//!
//! The store owns the partition table, the boot record and the flash write
//! primitives. The orchestrator only ever refers to partitions by identity.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::image::FirmwareDescriptor;

/// Kind of content a partition holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKind {
    /// Bootable application image
    App,
    /// Data region (boot record, NVS, ...)
    Data,
}

impl std::fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionKind::App => write!(f, "app"),
            PartitionKind::Data => write!(f, "data"),
        }
    }
}

/// A contiguous storage region holding at most one firmware image
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    /// Human-readable label from the partition table
    pub label: String,

    /// Kind of content held
    pub kind: PartitionKind,

    /// Ordinal among partitions of the same kind
    pub subtype: u8,

    /// Base address in flash
    pub offset: u32,

    /// Size of the region in bytes
    pub size: u32,
}

impl Partition {
    /// Create an application partition
    pub fn app(label: impl Into<String>, subtype: u8, offset: u32, size: u32) -> Self {
        Self {
            label: label.into(),
            kind: PartitionKind::App,
            subtype,
            offset,
            size,
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} subtype {} @ 0x{:08x})",
            self.label, self.kind, self.subtype, self.offset
        )
    }
}

/// Opaque token for an open write session, issued by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteHandle(pub u32);

/// Partition table, boot record and flash primitives of the device
#[async_trait]
pub trait PartitionStore: Send + Sync {
    /// Partition the current firmware executes from
    fn running_partition(&self) -> Partition;

    /// Partition the boot record currently points at
    fn configured_boot_partition(&self) -> Partition;

    /// Next partition to write an update into, starting after `hint` or the
    /// running partition when no hint is given
    fn next_update_partition(&self, hint: Option<&Partition>) -> Option<Partition>;

    /// Partition holding the last image that failed to boot, if recorded
    fn last_invalid_partition(&self) -> Option<Partition>;

    /// Application descriptor of the image stored in `partition`
    fn descriptor_of(&self, partition: &Partition) -> Option<FirmwareDescriptor>;

    /// Open a sequential write session on `partition`
    async fn begin_write(&self, partition: &Partition) -> Result<WriteHandle, StoreError>;

    /// Append `data` to the session
    async fn write(&self, handle: WriteHandle, data: &[u8]) -> Result<(), StoreError>;

    /// Close the session and validate the written image
    async fn end_write(&self, handle: WriteHandle) -> Result<(), StoreError>;

    /// Release the session without validating
    async fn abort_write(&self, handle: WriteHandle);

    /// Point the boot record at `partition`
    async fn set_boot_partition(&self, partition: &Partition) -> Result<(), StoreError>;

    /// Restart the device. Real hardware never returns from this call.
    async fn restart(&self);
}
