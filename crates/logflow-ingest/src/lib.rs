//! Logflow Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Turns rotated HTTP access logs into monthly Parquet partitions with
//! per-file ingestion metadata.
//!
//! # Overview
//!
//! - **Parsing**: [`parser::LineParser`] reads extended and combined log lines
//! - **Classification**: [`classifier::UserAgentClassifier`] assigns a family and category
//! - **Ingestion**: [`ingestor::FileIngestor`] streams one file into records and statistics
//! - **Exactly once**: [`ledger::IdempotencyLedger`] keyed by content digest, backed by [`meta::MetaStore`]
//! - **Storage**: [`sink::PartitionedSink`] merges records into `<namespace>/<YYYY-MM>.parquet`
//! - **Orchestration**: [`pipeline::Pipeline`] and [`pipeline::BatchRunner`]
//!
//! # Example
//!
//! ```no_run
//! use logflow_ingest::config::IngestConfig;
//! use logflow_ingest::pipeline::{prepare_classifier, Pipeline};
//! use std::sync::Arc;
//!
//! # async fn run() -> logflow_ingest::Result<()> {
//! let config = IngestConfig {
//!     namespace: "rest".to_string(),
//!     ..IngestConfig::default()
//! };
//! let classifier = Arc::new(prepare_classifier(&config).await?);
//! let pipeline = Pipeline::new(&config, classifier);
//! let report = pipeline.process_file("logs/rest.2023-10-01.log".as_ref())?;
//! println!("{:?}", report.outcome);
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod cli;
pub mod commands;
pub mod config;
pub mod decode;
pub mod discover;
pub mod error;
pub mod ingestor;
pub mod ledger;
pub mod meta;
pub mod parser;
pub mod pipeline;
pub mod record;
pub mod sink;

pub use cli::Cli;
pub use error::{IngestError, Result};
pub use ingestor::{FileIngestionResult, FileIngestor};
pub use record::RequestRecord;
