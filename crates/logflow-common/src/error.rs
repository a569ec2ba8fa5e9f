//! Error types shared by logflow crates

use thiserror::Error;

/// Result type alias for shared logflow operations
pub type Result<T> = std::result::Result<T, LogflowError>;

/// Errors raised by the shared utilities
#[derive(Error, Debug)]
pub enum LogflowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown checksum algorithm: {0}")]
    UnknownAlgorithm(String),
}
