//! Error types for firmware update operations
//!
//! Every failure an update attempt can hit maps onto one [`OtaError`] variant.
//! The orchestrator never treats any of them as process-fatal: it logs, drops
//! the attempt and retries on the next poll tick.

use core::fmt;

use thiserror::Error;

/// Errors that can occur during a firmware update attempt
#[derive(Error, Debug)]
pub enum OtaError {
    /// Connect or read failure on the transport stream
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The downloaded bytes are not a usable firmware image
    #[error("Malformed image: {0}")]
    MalformedImage(#[from] ImageError),

    /// The image carries the same version as the last image that failed to boot
    #[error("Firmware {version} was previously rolled back; refusing to install it again")]
    RollbackRejected {
        /// Version string of the rejected image
        version: String,
    },

    /// The image carries the version that is already running
    #[error("Firmware {version} is already running")]
    NoNewerVersion {
        /// Version string of the rejected image
        version: String,
    },

    /// The partition store refused an operation
    #[error("Partition store error: {0}")]
    Store(#[from] StoreError),
}

impl OtaError {
    /// Classify the error for logging and telemetry.
    pub fn category(&self) -> ErrorCategory {
        match self {
            OtaError::Transport(_) => ErrorCategory::Transport,
            OtaError::MalformedImage(_) => ErrorCategory::MalformedImage,
            OtaError::RollbackRejected { .. } | OtaError::NoNewerVersion { .. } => {
                ErrorCategory::Policy
            }
            OtaError::Store(StoreError::ValidationFailed(_)) => ErrorCategory::MalformedImage,
            OtaError::Store(_) => ErrorCategory::Store,
        }
    }

    /// Whether this is a policy decision rather than a fault.
    ///
    /// Policy rejections end the attempt the same way faults do but are
    /// expected in steady state and are not escalated.
    pub fn is_policy_rejection(&self) -> bool {
        self.category() == ErrorCategory::Policy
    }
}

/// Error classes used to route failures in logs and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCategory {
    /// Network connect/read failures
    Transport = 0,
    /// Short, empty or structurally invalid images
    MalformedImage = 1,
    /// Version or rollback policy rejected the image
    Policy = 2,
    /// Partition store begin/write/end/commit failures
    Store = 3,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Transport => write!(f, "Transport"),
            ErrorCategory::MalformedImage => write!(f, "MalformedImage"),
            ErrorCategory::Policy => write!(f, "Policy"),
            ErrorCategory::Store => write!(f, "Store"),
        }
    }
}

/// Transport stream failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection could not be established
    #[error("Failed to open connection to {url}: {reason}")]
    Open {
        /// Endpoint that was being opened
        url: String,
        /// Underlying failure
        reason: String,
    },

    /// The server answered with a non-success status
    #[error("Server responded with status {0}")]
    Status(u16),

    /// A read failed at the I/O layer
    #[error("Read failed: {0}")]
    Read(String),

    /// The peer reset or closed the connection mid-transfer
    #[error("Connection closed by peer")]
    ConnectionReset,

    /// The stream ended before the whole body arrived
    #[error("Transfer incomplete after {received} bytes")]
    Incomplete {
        /// Bytes received before the stream ended
        received: u64,
    },
}

/// Partition store failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store has no partition available for an update
    #[error("No update partition available")]
    NoUpdatePartition,

    /// The store offered the running partition as update target
    #[error("Update target {0} is the running partition")]
    TargetIsRunning(String),

    /// A write session could not be started
    #[error("Failed to begin write: {0}")]
    BeginFailed(String),

    /// Writing a chunk failed
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// The written image failed structural or checksum validation
    #[error("Image validation failed: {0}")]
    ValidationFailed(String),

    /// Closing the write session failed for a reason other than validation
    #[error("Failed to end write: {0}")]
    EndFailed(String),

    /// Switching the boot partition failed
    #[error("Failed to set boot partition: {0}")]
    SetBootFailed(String),

    /// The write session was already finalized or aborted
    #[error("Write session is closed")]
    SessionClosed,
}

/// Image header parsing failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    /// The buffer is too short to hold the header region
    #[error("Insufficient data for image header: need {needed} bytes, got {available}")]
    InsufficientData {
        /// Bytes required for the header region
        needed: usize,
        /// Bytes available in the buffer
        available: usize,
    },

    /// The server closed the stream without sending any bytes
    #[error("Empty response body")]
    Empty,
}

/// Configuration validation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field holds an unusable value
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Field name as it appears in the config file
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },
}
