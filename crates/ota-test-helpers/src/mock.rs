//! Mock implementations of the store and transport seams.
//!
//! Both mocks record what the orchestrator asked of them so tests can assert
//! on flash writes, aborts and boot switches.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use ota_updater::error::{StoreError, TransportError};
use ota_updater::image::{FirmwareDescriptor, has_image_magic, parse_descriptor};
use ota_updater::partition::{Partition, PartitionStore, WriteHandle};
use ota_updater::transport::{Transport, TransportConfig, TransportStream};

/// A call received by [`MockPartitionStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    /// `begin_write` on the labelled partition
    BeginWrite(String),
    /// `write` with this many bytes
    Write(usize),
    /// `end_write`
    EndWrite,
    /// `abort_write`
    AbortWrite,
    /// `set_boot_partition` on the labelled partition
    SetBootPartition(String),
    /// `restart`
    Restart,
}

#[derive(Debug, Default)]
struct FailurePlan {
    begin: Option<StoreError>,
    write_at: Option<usize>,
    end: Option<StoreError>,
    set_boot: Option<StoreError>,
}

#[derive(Debug, Default)]
struct Session {
    handle: Option<WriteHandle>,
    target: Option<Partition>,
    data: Vec<u8>,
    writes: usize,
}

/// Two-slot partition store kept in memory
#[derive(Debug)]
pub struct MockPartitionStore {
    slots: [Partition; 2],
    running: usize,
    boot: Mutex<usize>,
    last_invalid: Option<usize>,
    descriptors: Mutex<HashMap<String, FirmwareDescriptor>>,
    calls: Mutex<Vec<StoreCall>>,
    failures: Mutex<FailurePlan>,
    session: Mutex<Session>,
    last_image: Mutex<Vec<u8>>,
    next_handle: AtomicU32,
}

impl MockPartitionStore {
    /// Store running `version` from `ota_0`, with `ota_1` empty
    pub fn new(running_version: &str) -> Self {
        let slots = [
            Partition::app("ota_0", 16, 0x0001_0000, 0x0010_0000),
            Partition::app("ota_1", 17, 0x0011_0000, 0x0010_0000),
        ];
        let mut descriptors = HashMap::new();
        descriptors.insert(
            slots[0].label.clone(),
            FirmwareDescriptor::new(running_version, "test-device"),
        );

        Self {
            slots,
            running: 0,
            boot: Mutex::new(0),
            last_invalid: None,
            descriptors: Mutex::new(descriptors),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(FailurePlan::default()),
            session: Mutex::new(Session::default()),
            last_image: Mutex::new(Vec::new()),
            next_handle: AtomicU32::new(1),
        }
    }

    /// Record `ota_1` as holding an image with `version` that failed to boot
    pub fn with_last_invalid(mut self, version: &str) -> Self {
        self.last_invalid = Some(1);
        self.descriptors.lock().insert(
            self.slots[1].label.clone(),
            FirmwareDescriptor::new(version, "test-device"),
        );
        self
    }

    /// Record a last-invalid partition whose descriptor cannot be read
    pub fn with_unreadable_last_invalid(mut self) -> Self {
        self.last_invalid = Some(1);
        self.descriptors.lock().remove(&self.slots[1].label);
        self
    }

    /// Make the running image's descriptor unreadable
    pub fn without_running_descriptor(self) -> Self {
        self.descriptors.lock().remove(&self.slots[0].label);
        self
    }

    /// Boot record points at the update slot while running from `ota_0`
    pub fn with_boot_mismatch(self) -> Self {
        *self.boot.lock() = 1;
        self
    }

    /// Fail the next `begin_write`
    pub fn fail_begin(self) -> Self {
        self.failures.lock().begin = Some(StoreError::BeginFailed("no spare partition".into()));
        self
    }

    /// Fail the `n`th `write` of a session (1-based)
    pub fn fail_write_at(self, n: usize) -> Self {
        self.failures.lock().write_at = Some(n);
        self
    }

    /// Fail `end_write` with `error`
    pub fn fail_end(self, error: StoreError) -> Self {
        self.failures.lock().end = Some(error);
        self
    }

    /// Fail `set_boot_partition`
    pub fn fail_set_boot(self) -> Self {
        self.failures.lock().set_boot = Some(StoreError::SetBootFailed("boot record locked".into()));
        self
    }

    /// Every call received, in order
    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().clone()
    }

    /// Number of `begin_write` calls
    pub fn begin_count(&self) -> usize {
        self.count(|c| matches!(c, StoreCall::BeginWrite(_)))
    }

    /// Number of `end_write` calls
    pub fn end_count(&self) -> usize {
        self.count(|c| matches!(c, StoreCall::EndWrite))
    }

    /// Number of `abort_write` calls
    pub fn abort_count(&self) -> usize {
        self.count(|c| matches!(c, StoreCall::AbortWrite))
    }

    /// Number of `set_boot_partition` calls
    pub fn boot_switches(&self) -> usize {
        self.count(|c| matches!(c, StoreCall::SetBootPartition(_)))
    }

    /// Whether `restart` was called
    pub fn restarted(&self) -> bool {
        self.count(|c| matches!(c, StoreCall::Restart)) > 0
    }

    /// Bytes written by the last session that reached `end_write`
    pub fn last_image(&self) -> Vec<u8> {
        self.last_image.lock().clone()
    }

    /// Whether a write session is currently open
    pub fn has_open_session(&self) -> bool {
        self.session.lock().handle.is_some()
    }

    /// Partition the boot record points at
    pub fn boot_partition(&self) -> Partition {
        self.configured_boot_partition()
    }

    fn count(&self, pred: impl Fn(&StoreCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: StoreCall) {
        self.calls.lock().push(call);
    }

    fn slot(&self, index: usize) -> Partition {
        self.slots.get(index).cloned().unwrap_or_else(|| self.slots[0].clone())
    }

    fn check_handle(&self, session: &Session, handle: WriteHandle) -> Result<(), StoreError> {
        if session.handle == Some(handle) {
            Ok(())
        } else {
            Err(StoreError::WriteFailed(format!("unknown handle {handle:?}")))
        }
    }
}

#[async_trait]
impl PartitionStore for MockPartitionStore {
    fn running_partition(&self) -> Partition {
        self.slot(self.running)
    }

    fn configured_boot_partition(&self) -> Partition {
        self.slot(*self.boot.lock())
    }

    fn next_update_partition(&self, hint: Option<&Partition>) -> Option<Partition> {
        let from = hint.cloned().unwrap_or_else(|| self.running_partition());
        self.slots.iter().find(|p| **p != from).cloned()
    }

    fn last_invalid_partition(&self) -> Option<Partition> {
        self.last_invalid.map(|i| self.slot(i))
    }

    fn descriptor_of(&self, partition: &Partition) -> Option<FirmwareDescriptor> {
        self.descriptors.lock().get(&partition.label).cloned()
    }

    async fn begin_write(&self, partition: &Partition) -> Result<WriteHandle, StoreError> {
        self.record(StoreCall::BeginWrite(partition.label.clone()));
        if let Some(e) = self.failures.lock().begin.take() {
            return Err(e);
        }

        let mut session = self.session.lock();
        if session.handle.is_some() {
            return Err(StoreError::BeginFailed("session already open".into()));
        }
        let handle = WriteHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        *session = Session {
            handle: Some(handle),
            target: Some(partition.clone()),
            data: Vec::new(),
            writes: 0,
        };
        Ok(handle)
    }

    async fn write(&self, handle: WriteHandle, data: &[u8]) -> Result<(), StoreError> {
        self.record(StoreCall::Write(data.len()));
        let mut session = self.session.lock();
        self.check_handle(&session, handle)?;

        session.writes += 1;
        if self.failures.lock().write_at == Some(session.writes) {
            return Err(StoreError::WriteFailed("flash program error".into()));
        }
        session.data.extend_from_slice(data);
        Ok(())
    }

    async fn end_write(&self, handle: WriteHandle) -> Result<(), StoreError> {
        self.record(StoreCall::EndWrite);
        let session = std::mem::take(&mut *self.session.lock());
        self.check_handle(&session, handle)
            .map_err(|e| StoreError::EndFailed(e.to_string()))?;

        *self.last_image.lock() = session.data.clone();
        if let Some(e) = self.failures.lock().end.take() {
            return Err(e);
        }

        if !has_image_magic(&session.data) {
            return Err(StoreError::ValidationFailed("invalid image magic".into()));
        }
        let desc = parse_descriptor(&session.data)
            .map_err(|e| StoreError::ValidationFailed(e.to_string()))?;
        if let Some(target) = session.target {
            self.descriptors.lock().insert(target.label, desc);
        }
        Ok(())
    }

    async fn abort_write(&self, handle: WriteHandle) {
        self.record(StoreCall::AbortWrite);
        let mut session = self.session.lock();
        if session.handle == Some(handle) {
            *session = Session::default();
        }
    }

    async fn set_boot_partition(&self, partition: &Partition) -> Result<(), StoreError> {
        self.record(StoreCall::SetBootPartition(partition.label.clone()));
        if let Some(e) = self.failures.lock().set_boot.take() {
            return Err(e);
        }
        match self.slots.iter().position(|p| p == partition) {
            Some(index) => {
                *self.boot.lock() = index;
                Ok(())
            }
            None => Err(StoreError::SetBootFailed(format!("unknown partition {partition}"))),
        }
    }

    async fn restart(&self) {
        self.record(StoreCall::Restart);
    }
}

/// One step of a scripted download
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStep {
    /// Deliver these bytes (split across reads if the buffer is smaller)
    Data(Vec<u8>),
    /// Clean end of stream
    Eof,
    /// Fail the read
    Fail(TransportError),
}

/// A scripted server response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    /// Error returned by `open` instead of a stream
    pub open_error: Option<TransportError>,
    /// Reads, in order
    pub steps: Vec<ReadStep>,
    /// Completion predicate reported after the stream ended
    pub complete: bool,
}

impl Script {
    /// Serve `body` in `chunk`-sized reads, then end cleanly
    pub fn body(body: &[u8], chunk: usize) -> Self {
        let mut steps: Vec<ReadStep> = body
            .chunks(chunk.max(1))
            .map(|c| ReadStep::Data(c.to_vec()))
            .collect();
        steps.push(ReadStep::Eof);
        Self {
            open_error: None,
            steps,
            complete: true,
        }
    }

    /// Serve the first `chunks` reads of `body`, then end without the rest
    pub fn truncated(body: &[u8], chunk: usize, chunks: usize) -> Self {
        let mut script = Self::body(body, chunk);
        script.steps.truncate(chunks);
        script.steps.push(ReadStep::Eof);
        script.complete = false;
        script
    }

    /// Serve the first `chunks` reads of `body`, then reset the connection
    pub fn dropped_after(body: &[u8], chunk: usize, chunks: usize) -> Self {
        let mut script = Self::body(body, chunk);
        script.steps.truncate(chunks);
        script.steps.push(ReadStep::Fail(TransportError::ConnectionReset));
        script.complete = false;
        script
    }

    /// Fail to connect
    pub fn unreachable() -> Self {
        Self {
            open_error: Some(TransportError::Open {
                url: "http://fw.test/app.bin".into(),
                reason: "connection refused".into(),
            }),
            steps: Vec::new(),
            complete: false,
        }
    }
}

#[derive(Debug, Default)]
struct TransportCounters {
    opens: AtomicUsize,
    closes: AtomicUsize,
    bytes_served: AtomicU64,
}

/// Transport that plays back scripts, one per `open`.
///
/// Once the queue runs dry the last script is replayed forever.
#[derive(Debug)]
pub struct ScriptedTransport {
    queue: Mutex<VecDeque<Script>>,
    last: Mutex<Option<Script>>,
    counters: Arc<TransportCounters>,
    configs: Mutex<Vec<TransportConfig>>,
}

impl ScriptedTransport {
    /// Transport answering every open with `script`
    pub fn new(script: Script) -> Self {
        Self::sequence(vec![script])
    }

    /// Transport answering opens with `scripts` in order
    pub fn sequence(scripts: Vec<Script>) -> Self {
        Self {
            queue: Mutex::new(scripts.into()),
            last: Mutex::new(None),
            counters: Arc::new(TransportCounters::default()),
            configs: Mutex::new(Vec::new()),
        }
    }

    /// Number of `open` calls
    pub fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    /// Number of streams closed
    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    /// Total bytes handed out by all reads
    pub fn bytes_served(&self) -> u64 {
        self.counters.bytes_served.load(Ordering::SeqCst)
    }

    /// Configs passed to `open`
    pub fn configs(&self) -> Vec<TransportConfig> {
        self.configs.lock().clone()
    }

    fn next_script(&self) -> Option<Script> {
        let next = self.queue.lock().pop_front();
        match next {
            Some(script) => {
                *self.last.lock() = Some(script.clone());
                Some(script)
            }
            None => self.last.lock().clone(),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(
        &self,
        config: &TransportConfig,
    ) -> Result<Box<dyn TransportStream>, TransportError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        self.configs.lock().push(config.clone());

        let script = self.next_script().ok_or_else(|| TransportError::Open {
            url: config.url.clone(),
            reason: "no script".into(),
        })?;
        if let Some(e) = script.open_error {
            return Err(e);
        }

        Ok(Box::new(ScriptedStream {
            steps: script.steps.into(),
            complete: script.complete,
            ended: false,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct ScriptedStream {
    steps: VecDeque<ReadStep>,
    complete: bool,
    ended: bool,
    counters: Arc<TransportCounters>,
}

#[async_trait]
impl TransportStream for ScriptedStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.steps.pop_front() {
            Some(ReadStep::Data(data)) => {
                let n = buf.len().min(data.len());
                if let (Some(dst), Some(src)) = (buf.get_mut(..n), data.get(..n)) {
                    dst.copy_from_slice(src);
                }
                if let Some(rest) = data.get(n..).filter(|r| !r.is_empty()) {
                    self.steps.push_front(ReadStep::Data(rest.to_vec()));
                }
                self.counters
                    .bytes_served
                    .fetch_add(n as u64, Ordering::SeqCst);
                Ok(n)
            }
            Some(ReadStep::Fail(e)) => Err(e),
            Some(ReadStep::Eof) | None => {
                self.ended = true;
                Ok(0)
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.ended && self.complete
    }

    async fn close(&mut self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}
