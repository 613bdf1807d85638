//! In-crate fakes for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{StoreError, TransportError};
use crate::image::{DESCRIPTOR_OFFSET, FirmwareDescriptor, IMAGE_MAGIC};
use crate::partition::{Partition, PartitionStore, WriteHandle};
use crate::transport::{Transport, TransportConfig, TransportStream};

pub(crate) fn image(version: &str, payload_len: usize) -> Vec<u8> {
    let mut out = vec![0u8; DESCRIPTOR_OFFSET];
    if let Some(first) = out.first_mut() {
        *first = IMAGE_MAGIC;
    }
    out.extend_from_slice(&FirmwareDescriptor::new(version, "unit").to_bytes());
    out.extend((0..payload_len).map(|i| (i % 251) as u8));
    out
}

fn slot(n: u8) -> Partition {
    Partition::app(format!("ota_{n}"), 16 + n, 0x1_0000 + u32::from(n) * 0x10_0000, 0x10_0000)
}

#[derive(Default)]
struct Counters {
    begins: usize,
    boot_switches: usize,
    restarted: bool,
}

pub(crate) struct FakeStore {
    running: FirmwareDescriptor,
    boot_mismatch: bool,
    counters: Mutex<Counters>,
}

impl FakeStore {
    pub(crate) fn running(version: &str) -> Self {
        Self {
            running: FirmwareDescriptor::new(version, "unit"),
            boot_mismatch: false,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub(crate) fn with_boot_mismatch(mut self) -> Self {
        self.boot_mismatch = true;
        self
    }

    fn with_counters<R>(&self, f: impl FnOnce(&mut Counters) -> R) -> R {
        match self.counters.lock() {
            Ok(mut c) => f(&mut c),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub(crate) fn begins(&self) -> usize {
        self.with_counters(|c| c.begins)
    }

    pub(crate) fn boot_switches(&self) -> usize {
        self.with_counters(|c| c.boot_switches)
    }

    pub(crate) fn restarted(&self) -> bool {
        self.with_counters(|c| c.restarted)
    }
}

#[async_trait]
impl PartitionStore for FakeStore {
    fn running_partition(&self) -> Partition {
        slot(0)
    }

    fn configured_boot_partition(&self) -> Partition {
        if self.boot_mismatch { slot(1) } else { slot(0) }
    }

    fn next_update_partition(&self, _hint: Option<&Partition>) -> Option<Partition> {
        Some(slot(1))
    }

    fn last_invalid_partition(&self) -> Option<Partition> {
        None
    }

    fn descriptor_of(&self, partition: &Partition) -> Option<FirmwareDescriptor> {
        (*partition == slot(0)).then(|| self.running.clone())
    }

    async fn begin_write(&self, _partition: &Partition) -> Result<WriteHandle, StoreError> {
        self.with_counters(|c| c.begins += 1);
        Ok(WriteHandle(1))
    }

    async fn write(&self, _handle: WriteHandle, _data: &[u8]) -> Result<(), StoreError> {
        Ok(())
    }

    async fn end_write(&self, _handle: WriteHandle) -> Result<(), StoreError> {
        Ok(())
    }

    async fn abort_write(&self, _handle: WriteHandle) {}

    async fn set_boot_partition(&self, _partition: &Partition) -> Result<(), StoreError> {
        self.with_counters(|c| c.boot_switches += 1);
        Ok(())
    }

    async fn restart(&self) {
        self.with_counters(|c| c.restarted = true);
    }
}

pub(crate) struct FakeTransport {
    body: Vec<u8>,
}

impl FakeTransport {
    pub(crate) fn serving(body: Vec<u8>) -> Self {
        Self { body }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(
        &self,
        _config: &TransportConfig,
    ) -> Result<Box<dyn TransportStream>, TransportError> {
        Ok(Box::new(FakeStream {
            pending: self.body.iter().copied().collect(),
        }))
    }
}

struct FakeStream {
    pending: VecDeque<u8>,
}

#[async_trait]
impl TransportStream for FakeStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = buf.len().min(self.pending.len());
        for (dst, src) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    async fn close(&mut self) {}
}
