//! Subcommand implementations
//!
//! Results go to stdout; diagnostics go through tracing on stderr.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

use crate::classifier::feed::resolve_signatures;
use crate::classifier::{family_detector, SignatureSet, UserAgentClassifier};
use crate::cli::{Commands, FeedArgs, IngestArgs, MetaCommand};
use crate::config::IngestConfig;
use crate::discover::{discover, DateRange};
use crate::error::{IngestError, Result};
use crate::ledger::{FileDigest, IdempotencyLedger};
use crate::meta::{MetaRow, MetaStore};
use crate::pipeline::{crawler_feed, prepare_classifier, BatchRunner, BatchSummary, FileOutcome, Pipeline};

/// Run one subcommand and return the process exit code
pub async fn execute(command: Commands) -> Result<i32> {
    match command {
        Commands::Ingest(args) => ingest(args).await,
        Commands::Classify {
            agent,
            signatures,
            ua_regexes,
            min_agent_length,
            json,
        } => classify(&agent, signatures, ua_regexes, min_agent_length, json),
        Commands::Signatures {
            signatures,
            feed,
            dump,
        } => show_signatures(signatures, feed, dump).await,
        Commands::Meta {
            db_path,
            out_dir,
            command,
        } => meta(db_path, out_dir, command),
    }
}

async fn ingest(args: IngestArgs) -> Result<i32> {
    let log_paths = args.log_path.clone();
    let log_glob = args.log_glob.clone();
    let json = args.json;
    let config = args.into_config(IngestConfig::from_env()?)?;

    let range = DateRange::new(config.start_date, config.end_date);
    let paths = discover(&log_paths, log_glob.as_deref(), &range)?;
    if paths.is_empty() {
        warn!("No log files matched");
    }

    let classifier = Arc::new(prepare_classifier(&config).await?);
    let pipeline = Arc::new(Pipeline::new(&config, classifier));
    let runner = BatchRunner::new(pipeline, config.jobs);

    let cancel = runner.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, no new files will be started");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let summary = runner.run(paths).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(summary.exit_code())
}

fn print_summary(summary: &BatchSummary) {
    for report in &summary.reports {
        match &report.outcome {
            FileOutcome::Ingested(result) => println!(
                "ingested\t{}\timported={} skipped={} filtered={} rows={}",
                report.path.display(),
                result.lines_imported,
                result.lines_skipped,
                result.lines_filtered,
                result.rows_written
            ),
            FileOutcome::AlreadyIngested { digest } => {
                println!("skipped\t{}\talready ingested ({digest})", report.path.display())
            },
            FileOutcome::ClaimedElsewhere { digest } => {
                println!("skipped\t{}\tclaimed by another worker ({digest})", report.path.display())
            },
        }
    }
    for (path, error) in &summary.failures {
        println!("failed\t{}\t{error}", path.display());
    }
    println!(
        "{} ingested, {} already ingested, {} claimed elsewhere, {} failed, {} not started",
        summary.ingested(),
        summary.already_ingested(),
        summary.claimed_elsewhere(),
        summary.failures.len(),
        summary.cancelled
    );
}

fn classify(
    agent: &str,
    signatures: Option<PathBuf>,
    ua_regexes: Option<PathBuf>,
    min_agent_length: Option<usize>,
    json: bool,
) -> Result<i32> {
    let defaults = IngestConfig::default();
    let set = match signatures {
        Some(path) => SignatureSet::load(path)?,
        None => SignatureSet::builtin(),
    };
    let classifier = UserAgentClassifier::with_detector(
        family_detector(ua_regexes.as_deref())?,
        &set,
        min_agent_length.unwrap_or(defaults.min_agent_length),
    )?;
    let classification = classifier.classify(agent);

    if json {
        println!("{}", serde_json::to_string(&classification)?);
    } else {
        println!("{}\t{}", classification.family, classification.category);
    }
    Ok(0)
}

async fn show_signatures(signatures: Option<PathBuf>, feed_args: FeedArgs, dump: bool) -> Result<i32> {
    let mut config = IngestConfig::from_env()?;
    config.signatures_path = signatures.or(config.signatures_path);
    feed_args.apply(&mut config);

    let base = match &config.signatures_path {
        Some(path) => SignatureSet::load(path)?,
        None => SignatureSet::builtin(),
    };
    let feed = crawler_feed(&config)?;
    let set = resolve_signatures(base, feed.as_deref()).await;

    if dump {
        println!("{}", serde_json::to_string_pretty(&set)?);
    } else {
        println!("version\t{}", set.version);
        println!("bot\t{}", set.bot.len());
        println!("programmatic\t{}", set.programmatic.len());
        println!("unknown\t{}", set.unknown.len());
        println!("programmatic_families\t{}", set.programmatic_families.len());
        println!("browser_families\t{}", set.browser_families.len());
    }
    Ok(0)
}

fn meta(db_path: Option<PathBuf>, out_dir: Option<PathBuf>, command: MetaCommand) -> Result<i32> {
    let mut config = IngestConfig::from_env()?;
    if let Some(out_dir) = out_dir {
        config.out_dir = out_dir;
    }
    config.db_path = db_path.or(config.db_path);
    let store = MetaStore::open(config.db_path(), config.busy_timeout())?;

    match command {
        MetaCommand::List { json } => {
            let rows = store.list_completed()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                rows.iter().for_each(print_row);
            }
        },
        MetaCommand::Pending => {
            store.list_pending()?.iter().for_each(print_row);
        },
        MetaCommand::Release { digest } => {
            let digest = FileDigest::parse(&digest)?;
            if !store.release(&digest)? {
                return Err(IngestError::config(format!("No pending claim for {digest}")));
            }
            info!(digest = %digest, "Released claim");
            println!("released\t{digest}");
        },
        MetaCommand::Export { csv } => {
            let file = std::fs::File::create(&csv)?;
            let count = store.export_csv(file)?;
            println!("exported\t{count}\t{}", csv.display());
        },
    }
    Ok(0)
}

fn print_row(row: &MetaRow) {
    let at = row.ingested_at.or(row.claimed_at).map(|t| t.to_rfc3339()).unwrap_or_default();
    println!(
        "{}\t{}\t{}\t{}\timported={} skipped={} rows={}\t{at}",
        row.digest, row.state, row.namespace, row.log_path, row.lines_imported, row.lines_skipped, row.rows_written
    );
}
