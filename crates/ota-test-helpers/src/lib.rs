//! Shared test utilities for the OTA crates.
//!
//! # Modules
//!
//! - [`mod@must`] - Unwrap helpers with `#[track_caller]`
//! - [`assertions`] - Assertion macros for update scenarios
//! - [`mock`] - In-memory partition store and scripted transport
//! - [`fixtures`] - Firmware image builders
//! - [`prelude`] - Convenience re-exports
//!
//! ```rust,ignore
//! use ota_test_helpers::prelude::*;
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::panic)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod assertions;
pub mod fixtures;
pub mod must;
pub mod prelude;

#[cfg(feature = "mock")]
#[cfg_attr(docsrs, doc(cfg(feature = "mock")))]
pub mod mock;

pub use must::*;
