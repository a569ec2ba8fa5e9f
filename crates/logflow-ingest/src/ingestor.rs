//! Per-file log ingestion
//!
//! Streams one log file, turns each line into a [`RequestRecord`] and
//! accumulates the statistics stored in the metadata ledger. Bad lines are
//! counted and logged; only an unreadable or changing file is an error.

use chrono::{DateTime, TimeZone, Utc};
use logflow_common::checksum::HashingReader;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::{debug, instrument, warn};

use crate::classifier::{Classification, UserAgentClassifier};
use crate::decode::decode_line_bytes;
use crate::error::{IngestError, Result};
use crate::ledger::FileDigest;
use crate::parser::{LineParser, ParseOutcome, SkipReason};
use crate::record::{RequestRecord, StatusClass};

#[allow(clippy::expect_used)]
static STATIC_RESOURCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(/(images|scripts|style))|(\.(ico|css|png|jpg|svg|js|woff))|opensearch\.xml")
        .expect("static resource pattern is valid")
});

/// Earliest plausible timestamp, 2002-01-01T00:00:00Z
pub fn default_too_old() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2002, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// True for requests of images, scripts, stylesheets and similar assets
pub fn is_static_resource(request_path: &str) -> bool {
    STATIC_RESOURCE_RE.is_match(request_path)
}

/// Response counts per status class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts([u64; 5]);

impl StatusCounts {
    pub fn increment(&mut self, class: StatusClass) {
        self.0[class.index()] += 1;
    }

    pub fn get(&self, class: StatusClass) -> u64 {
        self.0[class.index()]
    }

    pub fn set(&mut self, class: StatusClass, count: u64) {
        self.0[class.index()] = count;
    }

    pub fn iter(&self) -> impl Iterator<Item = (StatusClass, u64)> + '_ {
        StatusClass::ALL.iter().map(|&class| (class, self.get(class)))
    }
}

/// Summary of one ingested file, persisted by the metadata store
///
/// Every line lands in exactly one counter, so `lines_total` is
/// `lines_imported + lines_skipped + lines_filtered + lines_blank`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileIngestionResult {
    pub log_path: PathBuf,
    pub digest: FileDigest,
    pub namespace: String,
    pub lines_total: u64,
    pub lines_imported: u64,
    /// Lines that failed to parse or predate the sanity floor
    pub lines_skipped: u64,
    /// Empty or whitespace-only lines, not stored in the metadata table
    pub lines_blank: u64,
    /// Static resource requests dropped in legacy mode
    pub lines_filtered: u64,
    pub status_counts: StatusCounts,
    /// Sum of `bytes_sent` over imported records
    pub total_bytes: u64,
    pub agents_too_short: u64,
    /// Rows merged into the sink after policy filtering
    pub rows_written: u64,
    pub ingested_at: Option<DateTime<Utc>>,
}

impl FileIngestionResult {
    pub fn new(log_path: impl Into<PathBuf>, digest: FileDigest, namespace: impl Into<String>) -> Self {
        Self {
            log_path: log_path.into(),
            digest,
            namespace: namespace.into(),
            lines_total: 0,
            lines_imported: 0,
            lines_skipped: 0,
            lines_blank: 0,
            lines_filtered: 0,
            status_counts: StatusCounts::default(),
            total_bytes: 0,
            agents_too_short: 0,
            rows_written: 0,
            ingested_at: None,
        }
    }
}

/// Per-run switches for the ingestor
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Drop static resource requests, as logged by the pre-2022 servers
    pub legacy: bool,
    pub too_old: DateTime<Utc>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            legacy: false,
            too_old: default_too_old(),
        }
    }
}

enum LineOutcome {
    Accepted(RequestRecord, bool),
    Skipped(SkipReason),
    Filtered,
}

/// Turns log files into records and statistics
pub struct FileIngestor {
    parser: LineParser,
    classifier: Arc<UserAgentClassifier>,
    options: IngestOptions,
}

impl FileIngestor {
    pub fn new(parser: LineParser, classifier: Arc<UserAgentClassifier>, options: IngestOptions) -> Self {
        Self {
            parser,
            classifier,
            options,
        }
    }

    /// Read and parse every line of `path`
    ///
    /// The bytes are hashed as they are read. When they do not hash to
    /// `digest` the file changed after it was claimed and the whole read is
    /// rejected with [`IngestError::ContentChanged`].
    ///
    /// The result starts with `rows_written = 0` and no `ingested_at`; the
    /// pipeline fills both in after the sink merge.
    #[instrument(skip(self, path, digest), fields(path = %path.display()))]
    pub fn ingest(
        &self,
        path: &Path,
        namespace: &str,
        digest: FileDigest,
    ) -> Result<(Vec<RequestRecord>, FileIngestionResult)> {
        let file = std::fs::File::open(path).map_err(|e| IngestError::unreadable(path, e))?;
        let mut reader = BufReader::new(HashingReader::new(file, digest.algorithm()));
        let (records, result) = self.ingest_reader(&mut reader, path, namespace, digest)?;

        let read = FileDigest::from_hex(result.digest.algorithm(), reader.into_inner().finish());
        if read != result.digest {
            return Err(IngestError::ContentChanged {
                path: path.to_path_buf(),
                expected: result.digest.tagged(),
                actual: read.tagged(),
            });
        }
        Ok((records, result))
    }

    /// Same as [`FileIngestor::ingest`] over an already opened reader
    pub fn ingest_reader<R: BufRead>(
        &self,
        mut reader: R,
        path: &Path,
        namespace: &str,
        digest: FileDigest,
    ) -> Result<(Vec<RequestRecord>, FileIngestionResult)> {
        let mut result = FileIngestionResult::new(path, digest, namespace);
        let mut records = Vec::new();
        let mut agent_cache: HashMap<String, Classification> = HashMap::new();
        let mut buffer = Vec::with_capacity(1024);

        loop {
            buffer.clear();
            let read = reader
                .read_until(b'\n', &mut buffer)
                .map_err(|e| IngestError::unreadable(path, e))?;
            if read == 0 {
                break;
            }

            result.lines_total += 1;
            let line = decode_line_bytes(&buffer);

            match self.ingest_line(&line, &mut agent_cache) {
                LineOutcome::Accepted(record, too_short) => {
                    result.lines_imported += 1;
                    result.total_bytes += record.bytes_sent();
                    if let Some(class) = record.status().class() {
                        result.status_counts.increment(class);
                    }
                    if too_short {
                        result.agents_too_short += 1;
                    }
                    records.push(record);
                },
                LineOutcome::Skipped(SkipReason::Empty) => result.lines_blank += 1,
                LineOutcome::Skipped(reason) => {
                    result.lines_skipped += 1;
                    warn!(
                        path = %path.display(),
                        line_number = result.lines_total,
                        reason = %reason,
                        line = %line,
                        "Could not parse line"
                    );
                },
                LineOutcome::Filtered => result.lines_filtered += 1,
            }
        }

        debug!(
            lines_total = result.lines_total,
            lines_imported = result.lines_imported,
            lines_skipped = result.lines_skipped,
            lines_blank = result.lines_blank,
            lines_filtered = result.lines_filtered,
            distinct_agents = agent_cache.len(),
            "Parsed log file"
        );

        Ok((records, result))
    }

    fn ingest_line(&self, line: &str, agent_cache: &mut HashMap<String, Classification>) -> LineOutcome {
        let parsed = match self.parser.parse(line) {
            ParseOutcome::Parsed(parsed) => parsed,
            ParseOutcome::Skipped(reason) => return LineOutcome::Skipped(reason),
        };

        if self.options.legacy && is_static_resource(&parsed.request_path) {
            return LineOutcome::Filtered;
        }

        if parsed.timestamp < self.options.too_old {
            return LineOutcome::Skipped(SkipReason::TooOld);
        }

        let classification = match agent_cache.get(&parsed.user_agent) {
            Some(classification) => classification.clone(),
            None => {
                let classification = self.classifier.classify(&parsed.user_agent);
                agent_cache.insert(parsed.user_agent.clone(), classification.clone());
                classification
            },
        };

        let too_short = classification.too_short;
        LineOutcome::Accepted(RequestRecord::new(parsed, &classification), too_short)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::record::UserCategory;
    use logflow_common::types::ChecksumAlgorithm;
    use std::io::Cursor;

    const CHROME: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36";

    fn ingestor(legacy: bool) -> FileIngestor {
        FileIngestor::new(
            LineParser::new(),
            Arc::new(UserAgentClassifier::builtin().unwrap()),
            IngestOptions {
                legacy,
                ..IngestOptions::default()
            },
        )
    }

    fn line(path: &str, status: &str, bytes: &str, agent: &str) -> String {
        format!(r#"10.0.0.1 - - [10/Oct/2023:13:55:36 +0000] "GET {path} HTTP/1.1" {status} {bytes} "-" "{agent}" 0.010 -"#)
    }

    fn run(ingestor: &FileIngestor, content: &[u8]) -> (Vec<RequestRecord>, FileIngestionResult) {
        let digest = FileDigest::of_bytes(content, ChecksumAlgorithm::Sha256).unwrap();
        ingestor
            .ingest_reader(Cursor::new(content.to_vec()), Path::new("/logs/test.log"), "rest", digest)
            .unwrap()
    }

    #[test]
    fn test_counts_and_histogram() {
        let content = [
            line("/uniprot/P12345", "200", "100", CHROME),
            line("/uniprot/P12345", "404", "-", CHROME),
            "not a log line".to_string(),
            String::new(),
            line("/blast", "500", "7", "python-requests/2.31.0"),
        ]
        .join("\n");

        let (records, result) = run(&ingestor(false), content.as_bytes());

        assert_eq!(result.lines_total, 5);
        assert_eq!(result.lines_imported, 3);
        assert_eq!(result.lines_skipped, 1);
        assert_eq!(result.lines_blank, 1);
        assert_eq!(result.lines_filtered, 0);
        assert_eq!(result.total_bytes, 107);
        assert_eq!(result.status_counts.get(StatusClass::Success), 1);
        assert_eq!(result.status_counts.get(StatusClass::ClientError), 1);
        assert_eq!(result.status_counts.get(StatusClass::ServerError), 1);
        assert_eq!(result.agents_too_short, 1);
        assert_eq!(result.rows_written, 0);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].user_category(), UserCategory::Browser);
        assert_eq!(records[2].user_category(), UserCategory::Programmatic);
        assert_eq!(records[2].namespace(), Some("blast"));
    }

    #[test]
    fn test_skipped_line_leaves_imported_unchanged() {
        let good = line("/uniprot", "200", "1", CHROME);
        let (_, base) = run(&ingestor(false), good.as_bytes());

        let with_bad = format!("{good}\n10.0.0.1 - - [10/Oct/2023:13:55:36 +0000] \"GET /uniprot HTTP/1.1 200 1\n");
        let (_, result) = run(&ingestor(false), with_bad.as_bytes());

        assert_eq!(result.lines_imported, base.lines_imported);
        assert_eq!(result.lines_skipped, base.lines_skipped + 1);
    }

    #[test]
    fn test_legacy_filters_static_resources() {
        let content = [
            line("/images/logo.png", "200", "10", CHROME),
            line("/uniprot/style.css", "200", "10", CHROME),
            line("/opensearch.xml", "200", "10", CHROME),
            line("/uniprot/P12345", "200", "10", CHROME),
        ]
        .join("\n");

        let (records, result) = run(&ingestor(true), content.as_bytes());
        assert_eq!(result.lines_filtered, 3);
        assert_eq!(result.lines_imported, 1);
        assert_eq!(result.lines_skipped, 0);
        assert_eq!(result.total_bytes, 10);
        assert_eq!(records.len(), 1);

        let (_, modern) = run(&ingestor(false), content.as_bytes());
        assert_eq!(modern.lines_filtered, 0);
        assert_eq!(modern.lines_imported, 4);
    }

    #[test]
    fn test_too_old_is_skipped() {
        let old = r#"10.0.0.1 - - [31/Dec/2001:23:59:59 +0000] "GET / HTTP/1.0" 200 1 "-" "x" 0.1"#;
        let (records, result) = run(&ingestor(false), old.as_bytes());
        assert!(records.is_empty());
        assert_eq!(result.lines_skipped, 1);
    }

    #[test]
    fn test_latin1_line_is_ingested() {
        let mut content = line("/uniprot/caf", "200", "1", CHROME).into_bytes();
        let at = content.iter().position(|&b| b == b' ').unwrap();
        content.splice(at..at, [0xE9u8]);

        let (records, result) = run(&ingestor(false), &content);
        assert_eq!(result.lines_imported, 1);
        assert_eq!(records[0].client_ip(), "10.0.0.1\u{e9}");
    }

    #[test]
    fn test_unreadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let digest = FileDigest::of_bytes(b"", ChecksumAlgorithm::Sha256).unwrap();
        let err = ingestor(false)
            .ingest(&dir.path().join("missing.log"), "rest", digest)
            .unwrap_err();
        assert!(matches!(err, IngestError::Unreadable { .. }));
    }

    #[test]
    fn test_bytes_that_do_not_match_the_digest_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rest.2023-10-10.log");
        let first = line("/uniprot/P12345", "200", "1", CHROME);
        std::fs::write(&path, format!("{first}\n")).unwrap();
        let digest = FileDigest::compute(&path, ChecksumAlgorithm::Sha256).unwrap();

        let (records, result) = ingestor(false).ingest(&path, "rest", digest.clone()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(result.digest, digest);

        let second = line("/uniprot/Q99999", "200", "1", CHROME);
        std::fs::write(&path, format!("{first}\n{second}\n")).unwrap();
        let err = ingestor(false).ingest(&path, "rest", digest.clone()).unwrap_err();
        let IngestError::ContentChanged { expected, actual, .. } = err else {
            panic!("expected a content change, got {err:?}");
        };
        assert_eq!(expected, digest.tagged());
        assert_eq!(
            actual,
            FileDigest::compute(&path, ChecksumAlgorithm::Sha256).unwrap().tagged()
        );
    }

    #[test]
    fn test_is_static_resource() {
        assert!(is_static_resource("/scripts/app.js"));
        assert!(is_static_resource("/favicon.ico"));
        assert!(!is_static_resource("/uniprot/P12345.fasta"));
    }
}
