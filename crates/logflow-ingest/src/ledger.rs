//! Exactly-once bookkeeping for log files
//!
//! Files are identified by a digest of their content, never by path, so a
//! renamed or copied log is still recognised. The ledger protocol is:
//!
//! 1. `seen` - skip files whose digest already has a completed row
//! 2. `claim` - atomically insert a pending row; losing the race means
//!    another worker owns the file
//! 3. `record` - promote the claim to a completed row with statistics
//! 4. `release` - drop the pending row after a failed merge so a later run
//!    can retry the file

use logflow_common::checksum::{compute_checksum, compute_file_checksum};
use logflow_common::types::ChecksumAlgorithm;
use logflow_common::LogflowError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{IngestError, Result};
use crate::ingestor::FileIngestionResult;

/// Algorithm-tagged content digest, displayed as `sha256:<hex>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileDigest {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl FileDigest {
    /// Digest of the full content of the file at `path`
    pub fn compute(path: impl AsRef<Path>, algorithm: ChecksumAlgorithm) -> Result<Self> {
        let path = path.as_ref();
        let hex = compute_file_checksum(path, algorithm).map_err(|e| match e {
            LogflowError::Io(source) => IngestError::unreadable(path, source),
            other => IngestError::Common(other),
        })?;
        Ok(Self { algorithm, hex })
    }

    pub(crate) fn from_hex(algorithm: ChecksumAlgorithm, hex: String) -> Self {
        Self { algorithm, hex }
    }

    pub fn of_bytes(bytes: &[u8], algorithm: ChecksumAlgorithm) -> Result<Self> {
        let hex = compute_checksum(&mut std::io::Cursor::new(bytes), algorithm)?;
        Ok(Self { algorithm, hex })
    }

    /// Parse the `algorithm:hex` form
    pub fn parse(tagged: &str) -> Result<Self> {
        let (algorithm, hex) = tagged
            .split_once(':')
            .ok_or_else(|| IngestError::config(format!("Digest '{tagged}' has no algorithm tag")))?;
        let algorithm: ChecksumAlgorithm = algorithm.parse()?;

        if hex.len() != algorithm.hex_len() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(IngestError::config(format!(
                "Digest '{tagged}' is not a valid {algorithm} value"
            )));
        }

        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    pub fn tagged(&self) -> String {
        format!("{}:{}", self.algorithm, self.hex)
    }
}

impl std::fmt::Display for FileDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// Lifecycle state of a ledger row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimState {
    Pending,
    Complete,
}

impl ClaimState {
    pub fn as_str(self) -> &'static str {
        match self {
            ClaimState::Pending => "pending",
            ClaimState::Complete => "complete",
        }
    }
}

impl std::str::FromStr for ClaimState {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ClaimState::Pending),
            "complete" => Ok(ClaimState::Complete),
            other => Err(IngestError::config(format!("Unknown ledger state '{other}'"))),
        }
    }
}

impl std::fmt::Display for ClaimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to own one file for the duration of its ingestion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub digest: FileDigest,
    pub namespace: String,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller owns the file
    Claimed,
    /// A row for the digest already exists
    Taken { state: ClaimState },
}

/// Digest-keyed record of which files have been ingested
pub trait IdempotencyLedger {
    /// True only when a completed row exists for `digest`
    fn seen(&self, digest: &FileDigest) -> Result<bool>;

    fn claim(&self, claim: &Claim) -> Result<ClaimOutcome>;

    /// Store the final statistics for a claimed (or unclaimed) file
    fn record(&self, result: &FileIngestionResult) -> Result<()>;

    /// Drop a pending claim; returns false when there was none
    fn release(&self, digest: &FileDigest) -> Result<bool>;
}
