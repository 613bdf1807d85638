//! Fuzzes the version/rollback guard with arbitrary descriptors.
//!
//! Run with:
//!   cargo +nightly fuzz run fuzz_version_guard
#![no_main]
use libfuzzer_sys::fuzz_target;
use ota_updater::guard::{GuardDecision, RejectReason, evaluate};
use ota_updater::image::{HEADER_REGION_LEN, parse_descriptor};

fuzz_target!(|data: &[u8]| {
    let mut chunks = data.chunks_exact(HEADER_REGION_LEN);
    let (Some(new), Some(running), Some(invalid)) = (
        chunks.next().and_then(|c| parse_descriptor(c).ok()),
        chunks.next().and_then(|c| parse_descriptor(c).ok()),
        chunks.next().and_then(|c| parse_descriptor(c).ok()),
    ) else {
        return;
    };

    match evaluate(&new, Some(&running), Some(&invalid)) {
        GuardDecision::Reject(RejectReason::SameAsInvalid) => assert!(new.same_version(&invalid)),
        GuardDecision::Reject(RejectReason::NoNewer) => {
            assert!(!new.same_version(&invalid) && new.same_version(&running));
        }
        GuardDecision::Proceed => {
            assert!(!new.same_version(&invalid) && !new.same_version(&running));
        }
    }
    assert_eq!(evaluate(&new, None, None), GuardDecision::Proceed);
});
