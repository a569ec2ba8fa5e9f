//! End-to-end ingestion of log files
//!
//! One file goes through digest, ledger check, claim, ingest, policy filter,
//! sink merge and commit. A file is never half recorded: a failure before the
//! merge finishes releases the claim, so the next run retries the file. A
//! merge that cannot roll back its partitions keeps the claim pending instead.
//!
//! [`BatchRunner`] drives many files with bounded concurrency. Every file runs
//! on a blocking worker with its own metadata connection.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::classifier::feed::resolve_signatures;
use crate::classifier::{
    family_detector, CrawlerFeed, HttpCrawlerFeed, JsonFileCrawlerFeed, SignatureSet, UserAgentClassifier,
};
use crate::config::{FeedSource, IngestConfig, RecordPolicy};
use crate::error::{IngestError, Result};
use crate::ingestor::{FileIngestionResult, FileIngestor, IngestOptions};
use crate::ledger::{Claim, ClaimOutcome, ClaimState, FileDigest, IdempotencyLedger};
use crate::meta::MetaStore;
use crate::parser::LineParser;
use crate::sink::PartitionedSink;

/// Build the crawler feed selected by the configuration
pub fn crawler_feed(config: &IngestConfig) -> Result<Option<Box<dyn CrawlerFeed>>> {
    let feed: Box<dyn CrawlerFeed> = match &config.feed {
        FeedSource::Disabled => return Ok(None),
        FeedSource::Url { url } => Box::new(
            HttpCrawlerFeed::new(url.clone(), config.feed_timeout())?
                .with_retries(config.feed_max_retries, std::time::Duration::from_secs(1)),
        ),
        FeedSource::File { path } => Box::new(JsonFileCrawlerFeed::new(path.clone())),
    };
    Ok(Some(feed))
}

/// Load the signature set, extend it with the crawler feed and compile the classifier
///
/// The feed is fetched once here; workers share the resulting classifier.
pub async fn prepare_classifier(config: &IngestConfig) -> Result<UserAgentClassifier> {
    let base = match &config.signatures_path {
        Some(path) => SignatureSet::load(path)?,
        None => SignatureSet::builtin(),
    };

    let feed = crawler_feed(config)?;
    let signatures = resolve_signatures(base, feed.as_deref()).await;
    let classifier = UserAgentClassifier::with_detector(
        family_detector(config.ua_regexes.as_deref())?,
        &signatures,
        config.min_agent_length,
    )?;

    info!(
        signatures = %classifier.signatures_version(),
        "Prepared user-agent classifier"
    );
    Ok(classifier)
}

/// What happened to one file
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    Ingested(FileIngestionResult),
    /// A completed ledger row exists for the digest
    AlreadyIngested { digest: FileDigest },
    /// Another worker holds a pending claim on the digest
    ClaimedElsewhere { digest: FileDigest },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    #[serde(flatten)]
    pub outcome: FileOutcome,
}

/// Per-file orchestration
pub struct Pipeline {
    ingestor: FileIngestor,
    sink: PartitionedSink,
    policy: RecordPolicy,
    namespace: String,
    db_path: PathBuf,
    config: IngestConfig,
}

impl Pipeline {
    pub fn new(config: &IngestConfig, classifier: Arc<UserAgentClassifier>) -> Self {
        let options = IngestOptions {
            legacy: config.legacy,
            too_old: config.too_old,
        };

        Self {
            ingestor: FileIngestor::new(LineParser::new(), classifier, options),
            sink: PartitionedSink::new(&config.out_dir),
            policy: config.policy.clone(),
            namespace: config.namespace.clone(),
            db_path: config.db_path(),
            config: config.clone(),
        }
    }

    pub fn sink(&self) -> &PartitionedSink {
        &self.sink
    }

    /// Ingest one file with a metadata connection opened for this file only
    pub fn process_file(&self, path: &Path) -> Result<FileReport> {
        let store = MetaStore::open(&self.db_path, self.config.busy_timeout())?;
        self.process_with_ledger(path, &store)
    }

    /// Ingest one file against an existing ledger
    #[instrument(skip(self, path, ledger), fields(path = %path.display()))]
    pub fn process_with_ledger<L: IdempotencyLedger>(&self, path: &Path, ledger: &L) -> Result<FileReport> {
        let path = std::fs::canonicalize(path).map_err(|e| IngestError::unreadable(path, e))?;
        let digest = FileDigest::compute(&path, self.config.digest_algorithm)?;

        if ledger.seen(&digest)? {
            info!(digest = %digest, "Log imported already");
            return Ok(FileReport {
                path,
                outcome: FileOutcome::AlreadyIngested { digest },
            });
        }

        let claim = Claim {
            digest: digest.clone(),
            namespace: self.namespace.clone(),
            log_path: path.clone(),
        };
        match ledger.claim(&claim)? {
            ClaimOutcome::Claimed => {},
            ClaimOutcome::Taken {
                state: ClaimState::Complete,
            } => {
                info!(digest = %digest, "Log imported already");
                return Ok(FileReport {
                    path,
                    outcome: FileOutcome::AlreadyIngested { digest },
                });
            },
            ClaimOutcome::Taken {
                state: ClaimState::Pending,
            } => {
                warn!(digest = %digest, "Log is being ingested by another worker");
                return Ok(FileReport {
                    path,
                    outcome: FileOutcome::ClaimedElsewhere { digest },
                });
            },
        }

        let result = match self.ingest_and_merge(&path, digest.clone()) {
            Ok(result) => result,
            Err(e @ IngestError::PartialMerge { .. }) => {
                error!(digest = %digest, error = %e, "Merge left new rows behind, claim kept pending");
                return Err(e);
            },
            Err(e) => {
                match ledger.release(&digest) {
                    Ok(_) => warn!(digest = %digest, error = %e, "Ingestion failed, claim released"),
                    Err(release_err) => error!(
                        digest = %digest,
                        error = %e,
                        release_error = %release_err,
                        "Ingestion failed and the claim could not be released"
                    ),
                }
                return Err(e);
            },
        };

        // Rows are already in the sink; a failed commit keeps the claim pending for `meta pending`.
        ledger.record(&result)?;

        info!(
            digest = %digest,
            lines_imported = result.lines_imported,
            lines_skipped = result.lines_skipped,
            rows_written = result.rows_written,
            "Ingested log"
        );

        Ok(FileReport {
            path,
            outcome: FileOutcome::Ingested(result),
        })
    }

    fn ingest_and_merge(&self, path: &Path, digest: FileDigest) -> Result<FileIngestionResult> {
        let (records, mut result) = self.ingestor.ingest(path, &self.namespace, digest)?;

        let admitted: Vec<_> = records
            .into_iter()
            .filter(|record| self.policy.admits(record))
            .collect();

        let reports = self.sink.merge(&self.namespace, &admitted, &result.digest)?;
        result.rows_written = reports.iter().map(|r| r.rows_batch).sum();
        result.ingested_at = Some(Utc::now());
        Ok(result)
    }
}

/// Totals over one batch run
#[derive(Debug, Default, Serialize)]
pub struct BatchSummary {
    pub reports: Vec<FileReport>,
    pub failures: Vec<(PathBuf, String)>,
    /// Files never started because the run was cancelled
    pub cancelled: usize,
}

impl BatchSummary {
    pub fn ingested(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Ingested(_)))
    }

    pub fn already_ingested(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::AlreadyIngested { .. }))
    }

    pub fn claimed_elsewhere(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::ClaimedElsewhere { .. }))
    }

    fn count(&self, pred: impl Fn(&FileOutcome) -> bool) -> usize {
        self.reports.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Process exit code: 1 when any file failed
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

/// Runs a [`Pipeline`] over many files
pub struct BatchRunner {
    pipeline: Arc<Pipeline>,
    jobs: usize,
    cancel: Arc<AtomicBool>,
}

impl BatchRunner {
    pub fn new(pipeline: Arc<Pipeline>, jobs: usize) -> Self {
        Self {
            pipeline,
            jobs: jobs.max(1),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting the flag stops new files from starting
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub async fn run(&self, paths: Vec<PathBuf>) -> BatchSummary {
        let total = paths.len();
        let started = Instant::now();
        info!(files = total, jobs = self.jobs, "Starting ingestion");

        let results: Vec<(PathBuf, Option<Result<FileReport>>)> = stream::iter(paths.into_iter().enumerate())
            .map(|(index, path)| {
                let pipeline = self.pipeline.clone();
                let cancel = self.cancel.clone();

                async move {
                    if cancel.load(Ordering::SeqCst) {
                        return (path, None);
                    }

                    info!(path = %path.display(), "Processing log {} / {}", index + 1, total);
                    let worker_path = path.clone();
                    let result = tokio::task::spawn_blocking(move || pipeline.process_file(&worker_path))
                        .await
                        .map_err(IngestError::from)
                        .and_then(|r| r);
                    (path, Some(result))
                }
            })
            .buffer_unordered(self.jobs)
            .collect()
            .await;

        let mut summary = BatchSummary::default();
        for (path, result) in results {
            match result {
                None => summary.cancelled += 1,
                Some(Ok(report)) => summary.reports.push(report),
                Some(Err(e)) => {
                    error!(path = %path.display(), error = %e, "Could not ingest log");
                    summary.failures.push((path, e.to_string()));
                },
            }
        }

        info!(
            ingested = summary.ingested(),
            already_ingested = summary.already_ingested(),
            claimed_elsewhere = summary.claimed_elsewhere(),
            failed = summary.failures.len(),
            cancelled = summary.cancelled,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Ingestion finished"
        );
        summary
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::CategoryPolicy;
    use crate::meta::MetaRecorder;

    const LINES: &str = concat!(
        r#"10.0.0.1 - - [10/Oct/2023:13:55:36 +0000] "GET /uniprot/P12345 HTTP/1.1" 200 512 "-" "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36""#,
        "\n",
        r#"10.0.0.2 - - [10/Oct/2023:13:56:00 +0000] "GET /uniprot/Q99999 HTTP/1.1" 200 256 "-" "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)""#,
        "\n",
        "this line is not a log record\n",
    );

    fn config(dir: &Path) -> IngestConfig {
        IngestConfig {
            namespace: "rest".to_string(),
            out_dir: dir.join("out"),
            feed: FeedSource::Disabled,
            ..IngestConfig::default()
        }
    }

    fn pipeline(config: &IngestConfig) -> Pipeline {
        Pipeline::new(config, Arc::new(UserAgentClassifier::builtin().unwrap()))
    }

    fn write_log(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, LINES).unwrap();
        path
    }

    #[test]
    fn test_process_file_then_skip_on_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let pipeline = pipeline(&config);
        let log = write_log(dir.path(), "rest.2023-10-10.log");
        let store = MetaStore::new_in_memory().unwrap();

        let report = pipeline.process_with_ledger(&log, &store).unwrap();
        let FileOutcome::Ingested(result) = &report.outcome else {
            panic!("expected ingestion, got {:?}", report.outcome);
        };
        assert_eq!(result.lines_imported, 2);
        assert_eq!(result.lines_skipped, 1);
        assert_eq!(result.rows_written, 2);
        assert!(result.ingested_at.is_some());
        assert_eq!(pipeline.sink().row_count("rest", "2023-10").unwrap(), 2);

        let rerun = pipeline.process_with_ledger(&log, &store).unwrap();
        assert!(matches!(rerun.outcome, FileOutcome::AlreadyIngested { .. }));
        assert_eq!(pipeline.sink().row_count("rest", "2023-10").unwrap(), 2);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_exclude_bots_keeps_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.policy.category = CategoryPolicy::ExcludeBots;
        let pipeline = pipeline(&config);
        let log = write_log(dir.path(), "rest.2023-10-10.log");
        let store = MetaStore::new_in_memory().unwrap();

        let report = pipeline.process_with_ledger(&log, &store).unwrap();
        let FileOutcome::Ingested(result) = report.outcome else {
            panic!("expected ingestion");
        };
        assert_eq!(result.lines_imported, 2);
        assert_eq!(result.rows_written, 1);
        assert_eq!(pipeline.sink().row_count("rest", "2023-10").unwrap(), 1);
    }

    #[test]
    fn test_pending_claim_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let pipeline = pipeline(&config);
        let log = write_log(dir.path(), "rest.2023-10-10.log");
        let store = MetaStore::new_in_memory().unwrap();

        let digest = FileDigest::compute(&log, config.digest_algorithm).unwrap();
        store
            .claim(&Claim {
                digest,
                namespace: "rest".to_string(),
                log_path: log.clone(),
            })
            .unwrap();

        let report = pipeline.process_with_ledger(&log, &store).unwrap();
        assert!(matches!(report.outcome, FileOutcome::ClaimedElsewhere { .. }));
        assert!(pipeline.sink().months("rest").unwrap().is_empty());
    }

    #[test]
    fn test_failed_merge_releases_claim() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let pipeline = pipeline(&config);
        let log = write_log(dir.path(), "rest.2023-10-10.log");
        let store = MetaStore::new_in_memory().unwrap();

        // A directory where the partition file should be makes the merge fail.
        std::fs::create_dir_all(config.out_dir.join("rest/2023-10.parquet")).unwrap();
        assert!(pipeline.process_with_ledger(&log, &store).is_err());

        let digest = FileDigest::compute(&log, config.digest_algorithm).unwrap();
        assert!(store.get(&digest).unwrap().is_none());
        assert!(!store.seen(&digest).unwrap());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let store = MetaStore::new_in_memory().unwrap();
        let err = pipeline(&config)
            .process_with_ledger(&dir.path().join("gone.log"), &store)
            .unwrap_err();
        assert!(matches!(err, IngestError::Unreadable { .. }));
    }

    #[test]
    fn test_commit_after_external_record_is_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let log = write_log(dir.path(), "rest.2023-10-10.log");
        let store = MetaStore::new_in_memory().unwrap();
        let digest = FileDigest::compute(&log, config.digest_algorithm).unwrap();

        store.commit(&FileIngestionResult::new(&log, digest.clone(), "rest")).unwrap();
        assert!(matches!(
            store.commit(&FileIngestionResult::new(&log, digest, "rest")),
            Err(IngestError::DuplicateDigest(_))
        ));
    }

    #[tokio::test]
    async fn test_batch_runner_counts_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let pipeline = Arc::new(pipeline(&config));
        let first = write_log(dir.path(), "rest.2023-10-10.log");
        let copy = write_log(dir.path(), "copy.2023-10-11.log");
        let missing = dir.path().join("missing.log");

        let runner = BatchRunner::new(pipeline.clone(), 1);
        let summary = runner.run(vec![first, copy, missing]).await;

        assert_eq!(summary.ingested(), 1);
        assert_eq!(summary.already_ingested(), 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(pipeline.sink().row_count("rest", "2023-10").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_runner_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let runner = BatchRunner::new(Arc::new(pipeline(&config)), 2);
        runner.cancel_flag().store(true, Ordering::SeqCst);

        let summary = runner.run(vec![write_log(dir.path(), "rest.2023-10-10.log")]).await;
        assert_eq!(summary.cancelled, 1);
        assert!(summary.reports.is_empty());
        assert!(summary.is_success());
    }
}
