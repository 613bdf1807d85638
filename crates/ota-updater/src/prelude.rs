//! Convenience re-exports for common update types

pub use crate::config::OtaConfig;
pub use crate::error::{
    ConfigError, ErrorCategory, ImageError, OtaError, StoreError, TransportError,
};
pub use crate::guard::{GuardDecision, RejectReason, evaluate};
pub use crate::image::{
    APP_DESC_LEN, DESCRIPTOR_OFFSET, FirmwareDescriptor, HEADER_REGION_LEN, IMAGE_MAGIC,
    parse_descriptor,
};
pub use crate::orchestrator::{
    AttemptStats, UpdateEvent, UpdateOrchestrator, UpdateReport, UpdateState,
};
pub use crate::partition::{Partition, PartitionKind, PartitionStore, WriteHandle};
pub use crate::transport::{Transport, TransportConfig, TransportStream};
pub use crate::writer::{StagedWriter, WriterState};
