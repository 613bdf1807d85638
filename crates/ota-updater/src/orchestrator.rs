//! Update orchestrator state machine
//!
//! One attempt at a time walks
//! `Idle → Connecting → AwaitingHeader → {Streaming | Rejected} → Finalizing
//! → Committing → Reboot`. Any failure drops the attempt and the machine goes
//! back to `Idle` until the next poll tick. Nothing is written to flash until
//! the header passed the guard, and the boot target is only switched after
//! the full image was received and validated.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::config::OtaConfig;
use crate::error::{ConfigError, ImageError, OtaError, StoreError, TransportError};
use crate::guard;
use crate::image::{FirmwareDescriptor, parse_descriptor};
use crate::partition::{Partition, PartitionStore};
use crate::transport::{Transport, TransportStream};
use crate::writer::StagedWriter;

const EVENT_CAPACITY: usize = 64;

/// Orchestrator states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum UpdateState {
    /// Waiting for the next poll tick
    #[default]
    Idle,
    /// Opening the transport
    Connecting,
    /// Waiting for the first chunk carrying the image header
    AwaitingHeader,
    /// Writing chunks into the update partition
    Streaming,
    /// The image was turned away before any write
    Rejected,
    /// Closing and validating the write session
    Finalizing,
    /// Switching the boot partition
    Committing,
    /// Restart requested
    Reboot,
}

impl UpdateState {
    /// Whether an attempt is running in this state
    pub fn is_in_progress(&self) -> bool {
        !matches!(
            self,
            UpdateState::Idle | UpdateState::Rejected | UpdateState::Reboot
        )
    }
}

impl std::fmt::Display for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UpdateState::Idle => "IDLE",
            UpdateState::Connecting => "CONNECTING",
            UpdateState::AwaitingHeader => "AWAITING_HEADER",
            UpdateState::Streaming => "STREAMING",
            UpdateState::Rejected => "REJECTED",
            UpdateState::Finalizing => "FINALIZING",
            UpdateState::Committing => "COMMITTING",
            UpdateState::Reboot => "REBOOT",
        };
        f.write_str(name)
    }
}

/// A state transition, published to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEvent {
    /// Attempt counter, starting at 1
    pub attempt: u64,

    /// State entered
    pub state: UpdateState,

    /// Version of the offered image, once its header was read
    pub version: Option<String>,
}

/// Summary of a committed update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReport {
    /// Attempt that committed
    pub attempt: u64,

    /// Partition the new image was written to, now the boot target
    pub target: Partition,

    /// Version of the new image
    pub version: String,

    /// Version that was running, if its descriptor was readable
    pub previous_version: Option<String>,

    /// Total bytes written, equal to the bytes received
    pub bytes_written: u64,
}

/// Cumulative attempt counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptStats {
    /// Attempts started
    pub attempts: u64,
    /// Attempts ended by the version/rollback guard or an unusable header
    pub rejections: u64,
    /// Attempts ended by transport or store failures
    pub failures: u64,
    /// Attempts that switched the boot partition
    pub commits: u64,
}

/// Transient state of one attempt. Never outlives the attempt.
struct UpdateSession<'a> {
    target: Partition,
    buffer: Vec<u8>,
    writer: Option<StagedWriter<'a>>,
}

impl<'a> UpdateSession<'a> {
    fn new(target: Partition, chunk_size: usize) -> Self {
        Self {
            target,
            buffer: vec![0; chunk_size],
            writer: None,
        }
    }

    async fn read(&mut self, stream: &mut dyn TransportStream) -> Result<usize, TransportError> {
        let n = stream.read(&mut self.buffer).await?;
        if n > self.buffer.len() {
            return Err(TransportError::Read(format!(
                "stream reported {} bytes for a {} byte buffer",
                n,
                self.buffer.len()
            )));
        }
        Ok(n)
    }

    fn chunk(&self, len: usize) -> &[u8] {
        self.buffer.get(..len).unwrap_or_default()
    }

    async fn write_chunk(&mut self, len: usize) -> Result<(), StoreError> {
        let chunk = self.buffer.get(..len).unwrap_or_default();
        match self.writer.as_mut() {
            Some(writer) => writer.append(chunk).await,
            None => Err(StoreError::SessionClosed),
        }
    }

    fn bytes_written(&self) -> u64 {
        self.writer.as_ref().map_or(0, StagedWriter::bytes_written)
    }

    async fn abort(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            writer.abort().await;
        }
    }
}

/// Drives firmware update attempts against a partition store and transport
pub struct UpdateOrchestrator {
    store: Arc<dyn PartitionStore>,
    transport: Arc<dyn Transport>,
    config: OtaConfig,
    state: UpdateState,
    stats: AttemptStats,
    offered_version: Option<String>,
    events: broadcast::Sender<UpdateEvent>,
}

impl UpdateOrchestrator {
    /// Create an orchestrator. Fails if the configuration is unusable.
    pub fn new(
        store: Arc<dyn PartitionStore>,
        transport: Arc<dyn Transport>,
        config: OtaConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            store,
            transport,
            config,
            state: UpdateState::Idle,
            stats: AttemptStats::default(),
            offered_version: None,
            events,
        })
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.events.subscribe()
    }

    /// Current state
    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// Counters since creation
    pub fn stats(&self) -> &AttemptStats {
        &self.stats
    }

    /// Active configuration
    pub fn config(&self) -> &OtaConfig {
        &self.config
    }

    /// Log which partition is running and warn if the boot record disagrees.
    pub fn log_boot_state(&self) {
        let configured = self.store.configured_boot_partition();
        let running = self.store.running_partition();

        if configured != running {
            warn!(
                configured = %configured,
                running = %running,
                "Configured boot partition differs from the running partition"
            );
            warn!("This can happen if the boot data or the preferred boot image became corrupted");
        }
        info!(
            kind = %running.kind,
            subtype = running.subtype,
            offset = format_args!("0x{:08x}", running.offset),
            "Running partition"
        );

        match self.store.descriptor_of(&running) {
            Some(desc) => info!(
                version = %desc.version_str(),
                project = %desc.project_name_str(),
                built = %desc.build_stamp(),
                elf_sha256 = %desc.elf_sha256_hex(),
                "Running firmware"
            ),
            None => warn!(partition = %running, "Running image has no readable descriptor"),
        }
    }

    /// Poll until an update is committed, then restart.
    ///
    /// On a device the restart never returns. When the store's restart hook
    /// does return, the committed update is reported back.
    pub async fn run(&mut self) -> UpdateReport {
        info!(url = %self.config.update_url, "Starting update checks");
        self.log_boot_state();

        loop {
            if let Ok(report) = self.poll_once().await {
                self.reboot().await;
                return report;
            }
        }
    }

    /// Poll like [`UpdateOrchestrator::run`] until an update is committed or
    /// `shutdown` resolves.
    ///
    /// `shutdown` is only observed while waiting for the next poll. An attempt
    /// that has started always runs to its end, so a staged write is either
    /// finalized or aborted before this returns `None`.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Option<UpdateReport>
    where
        F: Future<Output = ()>,
    {
        info!(url = %self.config.update_url, "Starting update checks");
        self.log_boot_state();

        let mut shutdown = std::pin::pin!(shutdown);
        loop {
            if tokio::time::timeout(self.config.poll_interval(), shutdown.as_mut())
                .await
                .is_ok()
            {
                info!(attempts = self.stats.attempts, "Stopping update checks");
                return None;
            }
            if let Ok(report) = self.run_attempt().await {
                self.reboot().await;
                return Some(report);
            }
        }
    }

    /// Wait one poll interval, then run one attempt
    pub async fn poll_once(&mut self) -> Result<UpdateReport, OtaError> {
        tokio::time::sleep(self.config.poll_interval()).await;
        self.run_attempt().await
    }

    /// Run one attempt immediately.
    ///
    /// On success the new partition is the boot target and the state is
    /// `Committing`; call [`UpdateOrchestrator::reboot`] to finish.
    pub async fn run_attempt(&mut self) -> Result<UpdateReport, OtaError> {
        self.stats.attempts = self.stats.attempts.saturating_add(1);
        self.offered_version = None;

        let result = self.attempt().await;

        match &result {
            Ok(report) => {
                self.stats.commits = self.stats.commits.saturating_add(1);
                info!(
                    version = %report.version,
                    partition = %report.target,
                    bytes_written = report.bytes_written,
                    "Update committed"
                );
            }
            Err(e) => {
                if matches!(self.state, UpdateState::Rejected) || e.is_policy_rejection() {
                    self.stats.rejections = self.stats.rejections.saturating_add(1);
                    warn!(category = %e.category(), reason = %e, "Update rejected");
                } else {
                    self.stats.failures = self.stats.failures.saturating_add(1);
                    error!(
                        category = %e.category(),
                        error = %e,
                        state = %self.state,
                        "Update attempt failed"
                    );
                }
                self.transition(UpdateState::Idle);
            }
        }

        result
    }

    /// Request a restart into the newly committed image
    pub async fn reboot(&mut self) {
        self.transition(UpdateState::Reboot);
        info!("Prepare to restart system");
        self.store.restart().await;
    }

    async fn attempt(&mut self) -> Result<UpdateReport, OtaError> {
        self.transition(UpdateState::Connecting);

        let mut stream = self.transport.open(&self.config.transport()).await?;
        if let Some(len) = stream.content_length() {
            debug!(content_length = len, "Connection opened");
        }

        let result = self.download(stream.as_mut()).await;
        stream.close().await;
        result
    }

    async fn download(
        &mut self,
        stream: &mut dyn TransportStream,
    ) -> Result<UpdateReport, OtaError> {
        let store = Arc::clone(&self.store);
        let running = store.running_partition();
        let target = store
            .next_update_partition(None)
            .ok_or(StoreError::NoUpdatePartition)?;
        if target == running {
            return Err(StoreError::TargetIsRunning(target.label).into());
        }
        info!(
            partition = %target,
            subtype = target.subtype,
            offset = format_args!("0x{:08x}", target.offset),
            "Writing to partition"
        );

        let mut session = UpdateSession::new(target, self.config.chunk_size);
        let result = self
            .drive(store.as_ref(), &running, stream, &mut session)
            .await;

        if result.is_err() {
            session.abort().await;
        }
        if session.writer.is_some() {
            info!(
                bytes_written = session.bytes_written(),
                "Total write binary data length"
            );
        }
        result
    }

    async fn drive<'a>(
        &mut self,
        store: &'a dyn PartitionStore,
        running: &Partition,
        stream: &mut dyn TransportStream,
        session: &mut UpdateSession<'a>,
    ) -> Result<UpdateReport, OtaError> {
        self.transition(UpdateState::AwaitingHeader);

        let first_len = session.read(stream).await?;
        if first_len == 0 {
            if !stream.is_complete() {
                return Err(TransportError::Incomplete { received: 0 }.into());
            }
            self.transition(UpdateState::Rejected);
            return Err(ImageError::Empty.into());
        }

        let new_desc = match parse_descriptor(session.chunk(first_len)) {
            Ok(desc) => desc,
            Err(e) => {
                error!(received = first_len, "Received package is too short for an image header");
                self.transition(UpdateState::Rejected);
                return Err(e.into());
            }
        };
        self.offered_version = Some(new_desc.version_str());

        let running_desc = self.check_header(store, running, &new_desc)?;

        session.writer = Some(StagedWriter::begin(store, &session.target).await?);
        self.transition(UpdateState::Streaming);

        // the header is part of the image and is persisted with the rest
        session.write_chunk(first_len).await?;
        loop {
            let n = session.read(stream).await?;
            if n == 0 {
                if !stream.is_complete() {
                    warn!(
                        received = session.bytes_written(),
                        "Error in receiving complete file"
                    );
                    return Err(TransportError::Incomplete {
                        received: session.bytes_written(),
                    }
                    .into());
                }
                info!("Connection closed, image fully received");
                break;
            }
            session.write_chunk(n).await?;
        }

        self.transition(UpdateState::Finalizing);
        let bytes_written = match session.writer.as_mut() {
            Some(writer) => writer.finalize().await?,
            None => return Err(StoreError::SessionClosed.into()),
        };

        self.transition(UpdateState::Committing);
        store
            .set_boot_partition(&session.target)
            .await
            .map_err(|e| match e {
                StoreError::SetBootFailed(_) => e,
                other => StoreError::SetBootFailed(other.to_string()),
            })?;

        Ok(UpdateReport {
            attempt: self.stats.attempts,
            target: session.target.clone(),
            version: new_desc.version_str(),
            previous_version: running_desc.map(|d| d.version_str()),
            bytes_written,
        })
    }

    /// Log the versions involved and run the guard. Returns the running
    /// descriptor for reporting.
    fn check_header(
        &mut self,
        store: &dyn PartitionStore,
        running: &Partition,
        new_desc: &FirmwareDescriptor,
    ) -> Result<Option<FirmwareDescriptor>, OtaError> {
        info!(version = %new_desc.version_str(), "New firmware version");
        if !new_desc.has_valid_magic() {
            warn!(
                magic = format_args!("0x{:08x}", new_desc.magic),
                "New image descriptor has an unexpected magic word"
            );
        }

        let running_desc = store.descriptor_of(running);
        if let Some(desc) = &running_desc {
            info!(running_version = %desc.version_str(), "Running firmware version");
        }

        let invalid_desc = match store.last_invalid_partition() {
            Some(partition) => {
                let desc = store.descriptor_of(&partition);
                match &desc {
                    Some(d) => info!(
                        invalid_version = %d.version_str(),
                        partition = %partition,
                        "Last invalid firmware version"
                    ),
                    None => warn!(
                        partition = %partition,
                        "Last invalid partition has no readable descriptor"
                    ),
                }
                desc
            }
            None => None,
        };

        let decision = guard::evaluate(new_desc, running_desc.as_ref(), invalid_desc.as_ref());
        if let Err(e) = decision.into_result(new_desc) {
            self.transition(UpdateState::Rejected);
            return Err(e);
        }
        Ok(running_desc)
    }

    fn transition(&mut self, state: UpdateState) {
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "State transition");
        self.state = state;

        let event = UpdateEvent {
            attempt: self.stats.attempts,
            state,
            version: self.offered_version.clone(),
        };
        if self.events.send(event).is_err() {
            trace!("No subscribers for update events");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeStore, FakeTransport, image};
    use tracing_test::traced_test;

    fn orchestrator(store: &Arc<FakeStore>, transport: &Arc<FakeTransport>) -> UpdateOrchestrator {
        let store: Arc<dyn PartitionStore> = store.clone();
        let transport: Arc<dyn Transport> = transport.clone();
        match UpdateOrchestrator::new(store, transport, OtaConfig::with_url("http://fw.local/app.bin")) {
            Ok(o) => o,
            Err(e) => panic!("config rejected: {e}"),
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(UpdateState::AwaitingHeader.to_string(), "AWAITING_HEADER");
        assert_eq!(UpdateState::default(), UpdateState::Idle);
        assert!(UpdateState::Streaming.is_in_progress());
        assert!(!UpdateState::Idle.is_in_progress());
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let store: Arc<dyn PartitionStore> = Arc::new(FakeStore::running("1.0.0"));
        let transport: Arc<dyn Transport> = Arc::new(FakeTransport::serving(Vec::new()));
        let result = UpdateOrchestrator::new(store, transport, OtaConfig::default());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_successful_attempt_walks_all_states() -> Result<(), OtaError> {
        let store = Arc::new(FakeStore::running("1.0.0"));
        let transport = Arc::new(FakeTransport::serving(image("1.1.0", 3000)));
        let mut ota = orchestrator(&store, &transport);
        let mut events = ota.subscribe();

        let report = ota.run_attempt().await?;
        assert_eq!(report.version, "1.1.0");
        assert_eq!(report.previous_version.as_deref(), Some("1.0.0"));
        assert_eq!(report.bytes_written, 3000 + 288);
        assert_eq!(ota.state(), UpdateState::Committing);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event.state);
        }
        assert_eq!(
            seen,
            vec![
                UpdateState::Connecting,
                UpdateState::AwaitingHeader,
                UpdateState::Streaming,
                UpdateState::Finalizing,
                UpdateState::Committing,
            ]
        );
        assert_eq!(store.boot_switches(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejection_returns_to_idle() {
        let store = Arc::new(FakeStore::running("1.0.0"));
        let transport = Arc::new(FakeTransport::serving(image("1.0.0", 512)));
        let mut ota = orchestrator(&store, &transport);

        let result = ota.run_attempt().await;
        assert!(matches!(result, Err(OtaError::NoNewerVersion { .. })));
        assert_eq!(ota.state(), UpdateState::Idle);
        assert_eq!(ota.stats().rejections, 1);
        assert_eq!(ota.stats().failures, 0);
        assert_eq!(store.begins(), 0);
    }

    #[tokio::test]
    async fn test_reboot_calls_restart() {
        let store = Arc::new(FakeStore::running("1.0.0"));
        let transport = Arc::new(FakeTransport::serving(image("2.0.0", 10)));
        let mut ota = orchestrator(&store, &transport);

        assert!(ota.run_attempt().await.is_ok());
        ota.reboot().await;
        assert_eq!(ota.state(), UpdateState::Reboot);
        assert!(store.restarted());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_rejection_is_logged_with_version() {
        let store = Arc::new(FakeStore::running("4.2.0"));
        let transport = Arc::new(FakeTransport::serving(image("4.2.0", 64)));
        let mut ota = orchestrator(&store, &transport);

        assert!(ota.run_attempt().await.is_err());
        assert!(logs_contain("New firmware version"));
        assert!(logs_contain("4.2.0"));
        assert!(logs_contain("Update rejected"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_boot_mismatch_is_logged() {
        let store = Arc::new(FakeStore::running("1.0.0").with_boot_mismatch());
        let transport = Arc::new(FakeTransport::serving(Vec::new()));
        let ota = orchestrator(&store, &transport);

        ota.log_boot_state();
        assert!(logs_contain("Configured boot partition differs"));
        assert!(logs_contain("Running firmware"));
    }
}
