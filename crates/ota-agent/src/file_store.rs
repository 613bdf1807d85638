//! Directory-backed partition store
//!
//! Layout of the storage directory:
//!
//! ```text
//! <dir>/<label>.bin       committed image of each app slot
//! <dir>/<label>.bin.part  image being staged
//! <dir>/otadata.json      boot record: {"boot": ..., "last_invalid": ...}
//! ```
//!
//! A staged image only replaces the slot file once it passed validation, and
//! the boot record is replaced atomically, so an interrupted update never
//! leaves a half-written slot or record behind.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use ota_updater::error::StoreError;
use ota_updater::image::{
    APP_DESC_MAGIC, FirmwareDescriptor, HEADER_REGION_LEN, has_image_magic, parse_descriptor,
};
use ota_updater::partition::{Partition, PartitionStore, WriteHandle};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::AgentError;

const OTADATA_FILE: &str = "otadata.json";

/// Persistent boot record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaData {
    /// Label of the slot to boot
    pub boot: Option<String>,

    /// Label of the slot whose image failed to boot
    pub last_invalid: Option<String>,
}

struct OpenWrite {
    handle: WriteHandle,
    partition: Partition,
    path: PathBuf,
    file: fs::File,
    written: u64,
}

/// Partition store backed by files in one directory
pub struct FileStore {
    dir: PathBuf,
    slots: Vec<Partition>,
    running: Partition,
    otadata: RwLock<OtaData>,
    session: Mutex<Option<OpenWrite>>,
    next_handle: AtomicU32,
    restart_requested: AtomicBool,
}

impl FileStore {
    /// Open (creating if needed) the store in `dir` with the given app slots.
    ///
    /// The running slot is the boot slot recorded at this moment.
    pub fn open(dir: impl Into<PathBuf>, slots: Vec<Partition>) -> Result<Self, AgentError> {
        let dir = dir.into();
        if slots.len() < 2 {
            return Err(AgentError::InvalidLayout(format!(
                "need at least two app partitions, found {}",
                slots.len()
            )));
        }
        std::fs::create_dir_all(&dir)?;

        let record_path = dir.join(OTADATA_FILE);
        let otadata = if record_path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&record_path)?)?
        } else {
            OtaData::default()
        };

        let running = otadata
            .boot
            .as_deref()
            .and_then(|label| slots.iter().find(|p| p.label == label))
            .or_else(|| slots.first())
            .cloned()
            .ok_or_else(|| AgentError::InvalidLayout("no app partitions".into()))?;
        debug!(dir = %dir.display(), running = %running, "Opened partition store");

        Ok(Self {
            dir,
            slots,
            running,
            otadata: RwLock::new(otadata),
            session: Mutex::new(None),
            next_handle: AtomicU32::new(1),
            restart_requested: AtomicBool::new(false),
        })
    }

    /// Storage directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// App slots in update order
    pub fn slots(&self) -> &[Partition] {
        &self.slots
    }

    /// Current boot record
    pub fn otadata(&self) -> OtaData {
        self.otadata.read().clone()
    }

    /// Whether `restart` was called since the store was opened
    pub fn restart_requested(&self) -> bool {
        self.restart_requested.load(Ordering::SeqCst)
    }

    /// Path of the committed image for `partition`
    pub fn image_path(&self, partition: &Partition) -> PathBuf {
        self.dir.join(format!("{}.bin", partition.label))
    }

    fn part_path(&self, partition: &Partition) -> PathBuf {
        self.dir.join(format!("{}.bin.part", partition.label))
    }

    fn slot(&self, label: &str) -> Option<&Partition> {
        self.slots.iter().find(|p| p.label == label)
    }

    fn slot_after(&self, from: &Partition) -> Option<Partition> {
        let index = self.slots.iter().position(|p| p == from)?;
        let next = self.slots.iter().cycle().nth(index.saturating_add(1))?;
        (next != from).then(|| next.clone())
    }

    /// Mark the current boot slot as invalid and boot the previous image.
    ///
    /// Does what a bootloader does after a failed boot of a new image.
    /// Returns `(invalidated, now_booting)`.
    pub async fn mark_boot_invalid(&self) -> Result<(Partition, Partition), AgentError> {
        let invalid = self.configured_boot_partition();
        let fallback = self
            .slot_after(&invalid)
            .filter(|p| self.descriptor_of(p).is_some())
            .ok_or_else(|| AgentError::NoRollbackTarget(self.dir.display().to_string()))?;

        let record = OtaData {
            boot: Some(fallback.label.clone()),
            last_invalid: Some(invalid.label.clone()),
        };
        self.persist(record).await?;
        warn!(invalid = %invalid, boot = %fallback, "Marked boot image invalid, rolled back");
        Ok((invalid, fallback))
    }

    async fn persist(&self, record: OtaData) -> Result<(), std::io::Error> {
        let path = self.dir.join(OTADATA_FILE);
        let tmp = self.dir.join(format!("{OTADATA_FILE}.tmp"));
        let body = serde_json::to_vec_pretty(&record).map_err(std::io::Error::other)?;

        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &path).await?;
        *self.otadata.write() = record;
        Ok(())
    }

    async fn validate_staged(&self, write: &OpenWrite) -> Result<(), StoreError> {
        let data = fs::read(&write.path)
            .await
            .map_err(|e| StoreError::EndFailed(e.to_string()))?;

        if !has_image_magic(&data) {
            return Err(StoreError::ValidationFailed("invalid image magic".into()));
        }
        let desc =
            parse_descriptor(&data).map_err(|e| StoreError::ValidationFailed(e.to_string()))?;
        if desc.magic != APP_DESC_MAGIC {
            return Err(StoreError::ValidationFailed(format!(
                "invalid descriptor magic 0x{:08x}",
                desc.magic
            )));
        }
        if data.len() as u64 > u64::from(write.partition.size) {
            return Err(StoreError::ValidationFailed(format!(
                "image of {} bytes exceeds {}",
                data.len(),
                write.partition
            )));
        }
        Ok(())
    }
}

fn read_header(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut header = Vec::with_capacity(HEADER_REGION_LEN);
    std::fs::File::open(path)?
        .take(HEADER_REGION_LEN as u64)
        .read_to_end(&mut header)?;
    Ok(header)
}

#[async_trait]
impl PartitionStore for FileStore {
    fn running_partition(&self) -> Partition {
        self.running.clone()
    }

    fn configured_boot_partition(&self) -> Partition {
        self.otadata
            .read()
            .boot
            .as_deref()
            .and_then(|label| self.slot(label))
            .unwrap_or(&self.running)
            .clone()
    }

    fn next_update_partition(&self, hint: Option<&Partition>) -> Option<Partition> {
        self.slot_after(hint.unwrap_or(&self.running))
    }

    fn last_invalid_partition(&self) -> Option<Partition> {
        let record = self.otadata.read();
        record
            .last_invalid
            .as_deref()
            .and_then(|label| self.slot(label))
            .cloned()
    }

    fn descriptor_of(&self, partition: &Partition) -> Option<FirmwareDescriptor> {
        let path = self.image_path(partition);
        let header = match read_header(&path) {
            Ok(header) => header,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No readable image");
                return None;
            }
        };
        if !has_image_magic(&header) {
            return None;
        }
        parse_descriptor(&header)
            .ok()
            .filter(FirmwareDescriptor::has_valid_magic)
    }

    async fn begin_write(&self, partition: &Partition) -> Result<WriteHandle, StoreError> {
        if *partition == self.running {
            return Err(StoreError::TargetIsRunning(partition.label.clone()));
        }
        if self.slot(&partition.label) != Some(partition) {
            return Err(StoreError::BeginFailed(format!("unknown partition {partition}")));
        }

        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(StoreError::BeginFailed("a write session is already open".into()));
        }

        let path = self.part_path(partition);
        let file = fs::File::create(&path)
            .await
            .map_err(|e| StoreError::BeginFailed(e.to_string()))?;
        let handle = WriteHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        debug!(path = %path.display(), ?handle, "Staging image");

        *session = Some(OpenWrite {
            handle,
            partition: partition.clone(),
            path,
            file,
            written: 0,
        });
        Ok(handle)
    }

    async fn write(&self, handle: WriteHandle, data: &[u8]) -> Result<(), StoreError> {
        let mut session = self.session.lock().await;
        let write = session
            .as_mut()
            .filter(|w| w.handle == handle)
            .ok_or_else(|| StoreError::WriteFailed(format!("unknown handle {handle:?}")))?;

        let written = write.written.saturating_add(data.len() as u64);
        if written > u64::from(write.partition.size) {
            return Err(StoreError::WriteFailed(format!(
                "image exceeds {}",
                write.partition
            )));
        }
        write
            .file
            .write_all(data)
            .await
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        write.written = written;
        Ok(())
    }

    async fn end_write(&self, handle: WriteHandle) -> Result<(), StoreError> {
        let mut write = {
            let mut session = self.session.lock().await;
            match session.take() {
                Some(w) if w.handle == handle => w,
                other => {
                    *session = other;
                    return Err(StoreError::EndFailed(format!("unknown handle {handle:?}")));
                }
            }
        };

        let synced = async {
            write.file.flush().await?;
            write.file.sync_all().await
        }
        .await;
        if let Err(e) = synced {
            discard(&write.path).await;
            return Err(StoreError::EndFailed(e.to_string()));
        }

        if let Err(e) = self.validate_staged(&write).await {
            discard(&write.path).await;
            return Err(e);
        }

        let target = self.image_path(&write.partition);
        fs::rename(&write.path, &target)
            .await
            .map_err(|e| StoreError::EndFailed(e.to_string()))?;
        info!(path = %target.display(), bytes = write.written, "Image staged");
        Ok(())
    }

    async fn abort_write(&self, handle: WriteHandle) {
        let write = {
            let mut session = self.session.lock().await;
            match session.take() {
                Some(w) if w.handle == handle => Some(w),
                other => {
                    *session = other;
                    None
                }
            }
        };
        if let Some(write) = write {
            drop(write.file);
            discard(&write.path).await;
            debug!(?handle, "Write session aborted");
        }
    }

    async fn set_boot_partition(&self, partition: &Partition) -> Result<(), StoreError> {
        if self.slot(&partition.label) != Some(partition) {
            return Err(StoreError::SetBootFailed(format!("unknown partition {partition}")));
        }
        if self.descriptor_of(partition).is_none() {
            return Err(StoreError::SetBootFailed(format!(
                "{partition} holds no valid image"
            )));
        }

        let mut record = self.otadata();
        record.boot = Some(partition.label.clone());
        if record.last_invalid.as_deref() == Some(partition.label.as_str()) {
            record.last_invalid = None;
        }
        self.persist(record)
            .await
            .map_err(|e| StoreError::SetBootFailed(e.to_string()))
    }

    async fn restart(&self) {
        info!("Restart requested; exit so the supervisor relaunches into the new image");
        self.restart_requested.store(true, Ordering::SeqCst);
    }
}

async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to remove staged image");
    }
}
