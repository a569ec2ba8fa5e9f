//! Monthly Parquet partitions
//!
//! Records land in `<root>/<namespace>/<YYYY-MM>.parquet`, one file per UTC
//! calendar month. A merge never edits a partition in place: existing rows and
//! the new batch are written to a temporary file next to the partition, the
//! row count of that file is checked against `before + batch`, and only then
//! is it renamed over the partition. A merge touching several months renames
//! nothing until every month has been staged. Writers of the same partition
//! serialize on an exclusive lock of `<YYYY-MM>.parquet.lock`.

use arrow::array::{
    ArrayRef, Float64Array, Int32Array, StringArray, TimestampMicrosecondArray, UInt16Array,
    UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{IngestError, Result};
use crate::ledger::FileDigest;
use crate::record::RequestRecord;

static RECORD_SCHEMA: LazyLock<SchemaRef> = LazyLock::new(|| {
    Arc::new(Schema::new(vec![
        Field::new(
            "timestamp",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
        Field::new("utc_offset_seconds", DataType::Int32, false),
        Field::new("client_ip", DataType::Utf8, false),
        Field::new("method", DataType::Utf8, false),
        Field::new("request_path", DataType::Utf8, false),
        Field::new("protocol", DataType::Utf8, true),
        Field::new("status", DataType::UInt16, true),
        Field::new("bytes_sent", DataType::UInt64, false),
        Field::new("referrer", DataType::Utf8, true),
        Field::new("user_agent", DataType::Utf8, false),
        Field::new("user_agent_family", DataType::Utf8, false),
        Field::new("user_category", DataType::Utf8, false),
        Field::new("response_time", DataType::Float64, true),
        Field::new("namespace", DataType::Utf8, true),
        Field::new("source_digest", DataType::Utf8, false),
    ]))
});

/// The canonical column layout of every partition
pub fn record_schema() -> SchemaRef {
    RECORD_SCHEMA.clone()
}

/// Outcome of merging one month of records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub namespace: String,
    pub month: String,
    pub path: PathBuf,
    pub rows_before: u64,
    pub rows_batch: u64,
    pub rows_after: u64,
}

/// Build one Arrow batch in the canonical schema
pub fn records_to_batch(records: &[&RequestRecord], source_digest: &FileDigest) -> Result<RecordBatch> {
    let digest = source_digest.tagged();

    let columns: Vec<ArrayRef> = vec![
        Arc::new(
            TimestampMicrosecondArray::from(
                records
                    .iter()
                    .map(|r| r.timestamp_utc().timestamp_micros())
                    .collect::<Vec<_>>(),
            )
            .with_timezone("UTC"),
        ),
        Arc::new(Int32Array::from(
            records
                .iter()
                .map(|r| r.timestamp().offset().local_minus_utc())
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.client_ip()))),
        Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.method().as_str()))),
        Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.request_path()))),
        Arc::new(StringArray::from(
            records.iter().map(|r| r.protocol()).collect::<Vec<_>>(),
        )),
        Arc::new(UInt16Array::from(
            records.iter().map(|r| r.status().code()).collect::<Vec<_>>(),
        )),
        Arc::new(UInt64Array::from(
            records.iter().map(|r| r.bytes_sent()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            records.iter().map(|r| r.referrer()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.user_agent_raw()))),
        Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.user_agent_family()),
        )),
        Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.user_category().as_str()),
        )),
        Arc::new(Float64Array::from(
            records.iter().map(|r| r.response_time()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            records.iter().map(|r| r.namespace()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from_iter_values(records.iter().map(|_| digest.as_str()))),
    ];

    Ok(RecordBatch::try_new(record_schema(), columns)?)
}

/// Removes the temporary partition unless it was renamed into place
struct TempPartition {
    path: PathBuf,
    persisted: bool,
}

impl Drop for TempPartition {
    fn drop(&mut self) {
        if !self.persisted {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// One month written to its temporary file and verified, holding the month lock
struct StagedMonth {
    report: MergeReport,
    temp: TempPartition,
    backup: PathBuf,
    _lock: File,
}

/// A partition renamed into place; `backup` is a hard link to the file it replaced
struct SwappedPartition {
    path: PathBuf,
    backup: Option<PathBuf>,
}

impl SwappedPartition {
    /// Put the replaced partition back, or remove the new one if there was none
    fn restore(&self) -> std::io::Result<()> {
        match &self.backup {
            Some(backup) => std::fs::rename(backup, &self.path),
            None => std::fs::remove_file(&self.path),
        }
    }

    fn discard_backup(self) {
        if let Some(backup) = self.backup {
            if let Err(e) = std::fs::remove_file(&backup) {
                warn!(path = %backup.display(), error = %e, "Could not remove partition backup");
            }
        }
    }
}

fn swap_into_place(temp: &mut TempPartition, path: &Path, backup: &Path) -> Result<SwappedPartition> {
    let backup = if path.exists() {
        std::fs::hard_link(path, backup)?;
        Some(backup.to_path_buf())
    } else {
        None
    };

    if let Err(e) = std::fs::rename(&temp.path, path) {
        if let Some(backup) = &backup {
            let _ = std::fs::remove_file(backup);
        }
        return Err(e.into());
    }
    temp.persisted = true;

    Ok(SwappedPartition {
        path: path.to_path_buf(),
        backup,
    })
}

/// Undo swapped partitions, newest first
///
/// Returns `cause` when every partition was restored, otherwise a
/// [`IngestError::PartialMerge`] naming the partitions that still hold new rows.
fn roll_back(swapped: Vec<SwappedPartition>, cause: IngestError) -> IngestError {
    let mut stranded = Vec::new();
    for partition in swapped.into_iter().rev() {
        if let Err(e) = partition.restore() {
            error!(path = %partition.path.display(), error = %e, "Could not roll back partition");
            stranded.push(partition.path.display().to_string());
        }
    }

    if stranded.is_empty() {
        cause
    } else {
        IngestError::PartialMerge {
            partitions: stranded,
            reason: cause.to_string(),
        }
    }
}

/// Append-only store of monthly Parquet partitions
#[derive(Debug, Clone)]
pub struct PartitionedSink {
    root: PathBuf,
}

impl PartitionedSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_path(&self, namespace: &str, month: &str) -> PathBuf {
        self.root.join(namespace).join(format!("{month}.parquet"))
    }

    fn lock_path(&self, namespace: &str, month: &str) -> PathBuf {
        self.root.join(namespace).join(format!("{month}.parquet.lock"))
    }

    /// Merge `records` into their monthly partitions
    ///
    /// Every month is written and verified before any partition is replaced,
    /// so a failure leaves all partitions as they were. Month locks are taken
    /// in month order and held until the last partition is in place.
    #[instrument(skip(self, records, source_digest), fields(records = records.len()))]
    pub fn merge(
        &self,
        namespace: &str,
        records: &[RequestRecord],
        source_digest: &FileDigest,
    ) -> Result<Vec<MergeReport>> {
        validate_namespace(namespace)?;

        let mut by_month: BTreeMap<String, Vec<&RequestRecord>> = BTreeMap::new();
        for record in records {
            by_month.entry(record.month_key()).or_default().push(record);
        }

        let mut staged = Vec::with_capacity(by_month.len());
        for (month, month_records) in by_month {
            let batch = records_to_batch(&month_records, source_digest)?;
            staged.push(self.stage_month(namespace, &month, &batch)?);
        }

        let mut swapped = Vec::with_capacity(staged.len());
        for month in &mut staged {
            match swap_into_place(&mut month.temp, &month.report.path, &month.backup) {
                Ok(partition) => swapped.push(partition),
                Err(e) => return Err(roll_back(swapped, e)),
            }
        }
        for partition in swapped {
            partition.discard_backup();
        }

        let reports: Vec<MergeReport> = staged.into_iter().map(|month| month.report).collect();
        for report in &reports {
            info!(
                partition = %format!("{}/{}", report.namespace, report.month),
                rows_before = report.rows_before,
                rows_batch = report.rows_batch,
                rows_after = report.rows_after,
                "Merged partition"
            );
        }
        Ok(reports)
    }

    fn stage_month(&self, namespace: &str, month: &str, batch: &RecordBatch) -> Result<StagedMonth> {
        let dir = self.root.join(namespace);
        std::fs::create_dir_all(&dir)?;

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path(namespace, month))?;
        lock.lock()?;

        let path = self.partition_path(namespace, month);
        let partition = format!("{namespace}/{month}");
        let staging_id = uuid::Uuid::new_v4();
        let temp = TempPartition {
            path: dir.join(format!(".{month}.{staging_id}.parquet.tmp")),
            persisted: false,
        };

        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(File::create(&temp.path)?, record_schema(), Some(props))?;

        let mut rows_before = 0u64;
        if path.exists() {
            let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&path)?)?.build()?;
            for existing in reader {
                let existing = conform(existing?, &partition)?;
                rows_before += existing.num_rows() as u64;
                writer.write(&existing)?;
            }
        }

        let rows_batch = batch.num_rows() as u64;
        writer.write(batch)?;
        writer.close()?;

        let rows_after = count_rows(&temp.path)?;
        if rows_after != rows_before + rows_batch {
            return Err(IngestError::RowCountMismatch {
                partition,
                before: rows_before,
                batch: rows_batch,
                after: rows_after,
            });
        }
        debug!(partition = %partition, rows_after, "Staged partition");

        Ok(StagedMonth {
            report: MergeReport {
                namespace: namespace.to_string(),
                month: month.to_string(),
                path,
                rows_before,
                rows_batch,
                rows_after,
            },
            temp,
            backup: dir.join(format!(".{month}.{staging_id}.parquet.bak")),
            _lock: lock,
        })
    }

    /// Rows in one partition, zero when it does not exist
    pub fn row_count(&self, namespace: &str, month: &str) -> Result<u64> {
        let path = self.partition_path(namespace, month);
        if !path.exists() {
            return Ok(0);
        }
        count_rows(&path)
    }

    /// Total rows over every partition of `namespace`
    pub fn total_rows(&self, namespace: &str) -> Result<u64> {
        let mut total = 0;
        for month in self.months(namespace)? {
            total += self.row_count(namespace, &month)?;
        }
        Ok(total)
    }

    /// Months that have a partition, in order
    pub fn months(&self, namespace: &str) -> Result<Vec<String>> {
        let dir = self.root.join(namespace);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut months = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(month) = name.strip_suffix(".parquet") {
                if !month.starts_with('.') {
                    months.push(month.to_string());
                }
            }
        }
        months.sort();
        Ok(months)
    }

    /// All rows of one partition in the canonical schema
    pub fn read_partition(&self, namespace: &str, month: &str) -> Result<Vec<RecordBatch>> {
        let path = self.partition_path(namespace, month);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let partition = format!("{namespace}/{month}");
        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&path)?)?.build()?;
        reader
            .map(|batch| conform(batch?, &partition))
            .collect()
    }
}

fn count_rows(path: &Path) -> Result<u64> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
    let rows = builder.metadata().file_metadata().num_rows();
    debug!(path = %path.display(), rows, "Counted partition rows");
    Ok(u64::try_from(rows).unwrap_or(0))
}

/// Re-attach the canonical schema to a batch read back from disk
fn conform(batch: RecordBatch, partition: &str) -> Result<RecordBatch> {
    RecordBatch::try_new(record_schema(), batch.columns().to_vec()).map_err(|e| {
        IngestError::SchemaMismatch {
            partition: partition.to_string(),
            reason: e.to_string(),
        }
    })
}

fn validate_namespace(namespace: &str) -> Result<()> {
    let valid = !namespace.is_empty()
        && namespace != "."
        && namespace != ".."
        && !namespace.contains(['/', '\\']);
    if valid {
        Ok(())
    } else {
        Err(IngestError::config(format!(
            "Namespace '{namespace}' cannot be used as a partition directory"
        )))
    }
}
