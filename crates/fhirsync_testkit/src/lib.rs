//! # fhirsync testkit
//!
//! Test utilities for the fhirsync engine.
//!
//! This crate provides:
//! - FHIR JSON fixtures and matching normalized records
//! - A harness wiring `SyncEngine` to in-memory collaborators
//! - A mapper that fails on chosen resources
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fhirsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn first_sync_is_full() {
//!     let harness = TestHarness::new();
//!     harness.fetcher.set_response(sample_fetch("2024-02-01T00:00:00Z"));
//!     let result = harness.engine.sync(SyncOptions::default()).await;
//!     assert!(result.full_refresh);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod harness;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::harness::*;
    pub use fhirsync_engine::SyncOptions;
}

pub use fixtures::*;
pub use generators::*;
pub use harness::*;
