//! Version and rollback guard
//!
//! Decides whether a downloaded image is worth writing. Versions are compared
//! for exact equality only; there is no notion of "newer".

use tracing::{info, warn};

use crate::error::OtaError;
use crate::image::FirmwareDescriptor;

/// Why an image was turned away before any flash write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Same version as the image that previously failed to boot
    SameAsInvalid,
    /// Same version as the running image
    NoNewer,
}

/// Outcome of the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    /// Write the image
    Proceed,
    /// Drop the download without writing
    Reject(RejectReason),
}

impl GuardDecision {
    /// Turn a rejection into the matching error for `new`
    pub fn into_result(self, new: &FirmwareDescriptor) -> Result<(), OtaError> {
        match self {
            GuardDecision::Proceed => Ok(()),
            GuardDecision::Reject(RejectReason::SameAsInvalid) => {
                Err(OtaError::RollbackRejected {
                    version: new.version_str(),
                })
            }
            GuardDecision::Reject(RejectReason::NoNewer) => Err(OtaError::NoNewerVersion {
                version: new.version_str(),
            }),
        }
    }
}

/// Compare `new` against the running and last-invalid descriptors.
///
/// A missing running descriptor never blocks an update, otherwise a device
/// with damaged image metadata could never recover.
pub fn evaluate(
    new: &FirmwareDescriptor,
    running: Option<&FirmwareDescriptor>,
    last_invalid: Option<&FirmwareDescriptor>,
) -> GuardDecision {
    if let Some(invalid) = last_invalid
        && invalid.same_version(new)
    {
        warn!(
            version = %new.version_str(),
            "New version matches the last invalid image; it failed to boot before and was rolled back"
        );
        return GuardDecision::Reject(RejectReason::SameAsInvalid);
    }

    match running {
        Some(running) if running.same_version(new) => {
            warn!(
                version = %new.version_str(),
                "Running version is the same as the offered one, skipping update"
            );
            GuardDecision::Reject(RejectReason::NoNewer)
        }
        Some(running) => {
            info!(
                version = %new.version_str(),
                running_version = %running.version_str(),
                "New firmware accepted"
            );
            GuardDecision::Proceed
        }
        None => {
            warn!(
                version = %new.version_str(),
                "Running image has no readable descriptor, allowing update"
            );
            GuardDecision::Proceed
        }
    }
}
