//! Error types for log ingestion
//!
//! Only file-level and store-level failures are errors. Individual lines that
//! fail to parse are reported as [`crate::parser::SkipReason`] values and never
//! reach this type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// The log file could not be opened or read
    #[error("Cannot read log file '{path}': {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File system operation failed
    #[error("File operation failed: {0}")]
    Io(#[from] std::io::Error),

    /// A completed metadata row already exists for this digest
    #[error("Log with digest {0} has already been ingested")]
    DuplicateDigest(String),

    /// A merge would break `rows_after == rows_before + batch_rows`
    #[error("Partition {partition} row count mismatch: {before} existing + {batch} new != {after} written")]
    RowCountMismatch {
        partition: String,
        before: u64,
        batch: u64,
        after: u64,
    },

    /// A failed merge could not restore every partition it had replaced
    #[error("Merge failed and partitions {partitions:?} keep the new rows: {reason}")]
    PartialMerge {
        partitions: Vec<String>,
        reason: String,
    },

    /// The log changed between hashing and reading its rows
    #[error("Log file '{path}' changed while it was ingested (digest {expected}, read {actual})")]
    ContentChanged {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// An existing partition does not have the canonical record schema
    #[error("Partition {partition} has an incompatible schema: {reason}")]
    SchemaMismatch { partition: String, reason: String },

    #[error("Metadata store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Invalid signature pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Invalid user-agent rules in {source_name}: {reason}")]
    UserAgentRules { source_name: String, reason: String },

    #[error("Crawler feed error: {0}")]
    Feed(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}. Check the command line flags or LOGFLOW_* variables.")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("CSV export failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("Ingestion worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Common(#[from] logflow_common::LogflowError),
}

impl IngestError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn feed(msg: impl Into<String>) -> Self {
        Self::Feed(msg.into())
    }

    pub fn unreadable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Unreadable {
            path: path.into(),
            source,
        }
    }
}
