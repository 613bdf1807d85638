//! Convenience re-exports for common test utilities.

pub use crate::fixtures::{ImageBuilder, descriptor};
pub use crate::must::{must, must_async, must_some, must_with};

#[cfg(feature = "mock")]
pub use crate::mock::{MockPartitionStore, ReadStep, Script, ScriptedTransport, StoreCall};

pub use crate::{assert_boot_untouched, assert_category, assert_sessions_balanced};

/// Result type for tests that use `?`
pub type TestResult = Result<(), Box<dyn std::error::Error>>;
