//! Logflow Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the logflow workspace.
//!
//! - **Error Handling**: `LogflowError` and the crate `Result` alias
//! - **Checksums**: streaming content digests used to identify log files
//! - **Logging**: tracing subscriber setup shared by every binary
//! - **Types**: small value types shared across crates
//!
//! # Example
//!
//! ```no_run
//! use logflow_common::checksum::compute_file_checksum;
//! use logflow_common::types::ChecksumAlgorithm;
//!
//! fn digest(path: &str) -> logflow_common::Result<String> {
//!     compute_file_checksum(path, ChecksumAlgorithm::Sha256)
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

pub use error::{LogflowError, Result};
