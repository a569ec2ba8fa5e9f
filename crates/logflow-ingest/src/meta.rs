//! SQLite metadata store
//!
//! One row per log file digest in `ingested_logs`. The digest is the primary
//! key, which is what makes claims race-safe across processes: the second
//! `INSERT` for a digest fails with a constraint violation instead of
//! creating a duplicate.
//!
//! [`MetaStore`] implements both [`IdempotencyLedger`] and [`MetaRecorder`].
//! A store handle is opened per file and dropped when the file is done.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{IngestError, Result};
use crate::ingestor::{FileIngestionResult, StatusCounts};
use crate::ledger::{Claim, ClaimOutcome, ClaimState, FileDigest, IdempotencyLedger};
use crate::record::StatusClass;

pub const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 30;

/// Columns of the legacy `meta.csv` export, in order
pub const CSV_COLUMNS: [&str; 10] = [
    "namespace",
    "log_path",
    "total_bytes",
    "lines_imported",
    "lines_skipped",
    "status_1xx",
    "status_2xx",
    "status_3xx",
    "status_4xx",
    "status_5xx",
];

const SELECT_COLUMNS: &str = "digest, state, namespace, log_path, total_bytes, lines_total, \
     lines_imported, lines_skipped, lines_filtered, rows_written, agents_too_short, \
     status_1xx, status_2xx, status_3xx, status_4xx, status_5xx, claimed_at, ingested_at";

/// Persists the final statistics of an ingested file
pub trait MetaRecorder {
    /// Fails with [`IngestError::DuplicateDigest`] when the digest is already complete
    fn commit(&self, result: &FileIngestionResult) -> Result<()>;
}

/// Create the metadata schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS ingested_logs (
            digest TEXT PRIMARY KEY NOT NULL,
            state TEXT NOT NULL CHECK (state IN ('pending', 'complete')),
            namespace TEXT NOT NULL,
            log_path TEXT NOT NULL,

            total_bytes INTEGER NOT NULL DEFAULT 0,
            lines_total INTEGER NOT NULL DEFAULT 0,
            lines_imported INTEGER NOT NULL DEFAULT 0,
            lines_skipped INTEGER NOT NULL DEFAULT 0,
            lines_filtered INTEGER NOT NULL DEFAULT 0,
            rows_written INTEGER NOT NULL DEFAULT 0,
            agents_too_short INTEGER NOT NULL DEFAULT 0,

            status_1xx INTEGER NOT NULL DEFAULT 0,
            status_2xx INTEGER NOT NULL DEFAULT 0,
            status_3xx INTEGER NOT NULL DEFAULT 0,
            status_4xx INTEGER NOT NULL DEFAULT 0,
            status_5xx INTEGER NOT NULL DEFAULT 0,

            claimed_at TEXT,
            ingested_at TEXT
        )
        "#,
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ingested_logs_state ON ingested_logs(state)",
        [],
    )?;

    Ok(())
}

/// One row of `ingested_logs`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetaRow {
    pub digest: String,
    pub state: ClaimState,
    pub namespace: String,
    pub log_path: String,
    pub total_bytes: u64,
    pub lines_total: u64,
    pub lines_imported: u64,
    pub lines_skipped: u64,
    pub lines_filtered: u64,
    pub rows_written: u64,
    pub agents_too_short: u64,
    pub status_counts: StatusCounts,
    pub claimed_at: Option<DateTime<Utc>>,
    pub ingested_at: Option<DateTime<Utc>>,
}

impl MetaRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let state: String = row.get(1)?;
        let state = state.parse::<ClaimState>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?;

        let mut status_counts = StatusCounts::default();
        for (offset, class) in StatusClass::ALL.into_iter().enumerate() {
            status_counts.set(class, row.get(11 + offset)?);
        }

        Ok(Self {
            digest: row.get(0)?,
            state,
            namespace: row.get(2)?,
            log_path: row.get(3)?,
            total_bytes: row.get(4)?,
            lines_total: row.get(5)?,
            lines_imported: row.get(6)?,
            lines_skipped: row.get(7)?,
            lines_filtered: row.get(8)?,
            rows_written: row.get(9)?,
            agents_too_short: row.get(10)?,
            status_counts,
            claimed_at: parse_timestamp(row.get(16)?),
            ingested_at: parse_timestamp(row.get(17)?),
        })
    }
}

fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// Handle on the metadata database
pub struct MetaStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for MetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaStore").field("path", &self.path).finish()
    }
}

impl MetaStore {
    /// Open (and create if needed) the database at `path`
    ///
    /// Concurrent writers wait up to `busy_timeout` for the database lock.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "Opened metadata store");

        init_schema(&conn)?;

        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory database
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn state_of(&self, digest: &FileDigest) -> Result<Option<ClaimState>> {
        let state: Option<String> = self
            .conn
            .query_row(
                "SELECT state FROM ingested_logs WHERE digest = ?1",
                params![digest.tagged()],
                |row| row.get(0),
            )
            .optional()?;
        state.map(|s| s.parse()).transpose()
    }

    pub fn get(&self, digest: &FileDigest) -> Result<Option<MetaRow>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM ingested_logs WHERE digest = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![digest.tagged()], MetaRow::from_row)
            .optional()?)
    }

    fn rows_in_state(&self, state: ClaimState, order_by: &str) -> Result<Vec<MetaRow>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM ingested_logs WHERE state = ?1 ORDER BY {order_by}, digest"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![state.as_str()], MetaRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Completed files, oldest first
    pub fn list_completed(&self) -> Result<Vec<MetaRow>> {
        self.rows_in_state(ClaimState::Complete, "ingested_at")
    }

    /// Claims that never completed, oldest first
    pub fn list_pending(&self) -> Result<Vec<MetaRow>> {
        self.rows_in_state(ClaimState::Pending, "claimed_at")
    }

    /// Number of rows in any state
    pub fn count(&self) -> Result<u64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM ingested_logs", [], |row| row.get(0))?)
    }

    /// Write completed rows in the legacy `meta.csv` layout
    pub fn export_csv<W: Write>(&self, writer: W) -> Result<usize> {
        let rows = self.list_completed()?;
        let mut csv = csv::Writer::from_writer(writer);
        csv.write_record(CSV_COLUMNS)?;

        for row in &rows {
            let mut record = vec![
                row.namespace.clone(),
                row.log_path.clone(),
                row.total_bytes.to_string(),
                row.lines_imported.to_string(),
                row.lines_skipped.to_string(),
            ];
            record.extend(row.status_counts.iter().map(|(_, count)| count.to_string()));
            csv.write_record(&record)?;
        }

        csv.flush()?;
        Ok(rows.len())
    }
}

impl IdempotencyLedger for MetaStore {
    fn seen(&self, digest: &FileDigest) -> Result<bool> {
        Ok(self.state_of(digest)? == Some(ClaimState::Complete))
    }

    fn claim(&self, claim: &Claim) -> Result<ClaimOutcome> {
        let inserted = self.conn.execute(
            r#"
            INSERT INTO ingested_logs (digest, state, namespace, log_path, claimed_at)
            VALUES (?1, 'pending', ?2, ?3, ?4)
            "#,
            params![
                claim.digest.tagged(),
                claim.namespace,
                claim.log_path.to_string_lossy().into_owned(),
                Utc::now().to_rfc3339(),
            ],
        );

        match inserted {
            Ok(_) => Ok(ClaimOutcome::Claimed),
            Err(e) if is_constraint_violation(&e) => {
                let state = self.state_of(&claim.digest)?.unwrap_or(ClaimState::Pending);
                Ok(ClaimOutcome::Taken { state })
            },
            Err(e) => Err(e.into()),
        }
    }

    fn record(&self, result: &FileIngestionResult) -> Result<()> {
        self.commit(result)
    }

    fn release(&self, digest: &FileDigest) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM ingested_logs WHERE digest = ?1 AND state = 'pending'",
            params![digest.tagged()],
        )?;
        Ok(deleted > 0)
    }
}

impl MetaRecorder for MetaStore {
    fn commit(&self, result: &FileIngestionResult) -> Result<()> {
        let digest = result.digest.tagged();
        let log_path = result.log_path.to_string_lossy().into_owned();
        let ingested_at = result.ingested_at.unwrap_or_else(Utc::now).to_rfc3339();
        let counts = &result.status_counts;

        let tx = self.conn.unchecked_transaction()?;

        let updated = tx.execute(
            r#"
            UPDATE ingested_logs SET
                state = 'complete', namespace = ?2, log_path = ?3,
                total_bytes = ?4, lines_total = ?5, lines_imported = ?6,
                lines_skipped = ?7, lines_filtered = ?8, rows_written = ?9,
                agents_too_short = ?10,
                status_1xx = ?11, status_2xx = ?12, status_3xx = ?13,
                status_4xx = ?14, status_5xx = ?15,
                ingested_at = ?16
            WHERE digest = ?1 AND state = 'pending'
            "#,
            params![
                digest,
                result.namespace,
                log_path,
                result.total_bytes,
                result.lines_total,
                result.lines_imported,
                result.lines_skipped,
                result.lines_filtered,
                result.rows_written,
                result.agents_too_short,
                counts.get(StatusClass::Informational),
                counts.get(StatusClass::Success),
                counts.get(StatusClass::Redirection),
                counts.get(StatusClass::ClientError),
                counts.get(StatusClass::ServerError),
                ingested_at,
            ],
        )?;

        if updated == 0 {
            let inserted = tx.execute(
                r#"
                INSERT INTO ingested_logs (
                    digest, state, namespace, log_path,
                    total_bytes, lines_total, lines_imported, lines_skipped,
                    lines_filtered, rows_written, agents_too_short,
                    status_1xx, status_2xx, status_3xx, status_4xx, status_5xx,
                    claimed_at, ingested_at
                ) VALUES (?1, 'complete', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                          ?11, ?12, ?13, ?14, ?15, ?16, ?16)
                "#,
                params![
                    digest,
                    result.namespace,
                    log_path,
                    result.total_bytes,
                    result.lines_total,
                    result.lines_imported,
                    result.lines_skipped,
                    result.lines_filtered,
                    result.rows_written,
                    result.agents_too_short,
                    counts.get(StatusClass::Informational),
                    counts.get(StatusClass::Success),
                    counts.get(StatusClass::Redirection),
                    counts.get(StatusClass::ClientError),
                    counts.get(StatusClass::ServerError),
                    ingested_at,
                ],
            );

            match inserted {
                Ok(_) => {},
                Err(e) if is_constraint_violation(&e) => {
                    return Err(IngestError::DuplicateDigest(digest));
                },
                Err(e) => return Err(e.into()),
            }
        }

        tx.commit()?;
        debug!(digest = %digest, rows_written = result.rows_written, "Committed ingestion metadata");
        Ok(())
    }
}
