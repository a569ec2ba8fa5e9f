//! Command line definitions

use chrono::NaiveDate;
use clap::{ArgGroup, Args, Parser, Subcommand};
use logflow_common::types::ChecksumAlgorithm;
use std::path::PathBuf;

use crate::config::{CategoryPolicy, FeedSource, IngestConfig};
use crate::error::Result;

/// logflow - access log ingestion into monthly Parquet partitions
#[derive(Parser, Debug)]
#[command(name = "logflow-ingest")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Parse log files and merge them into the partitions
    Ingest(IngestArgs),

    /// Classify one user agent
    Classify {
        /// Raw user-agent string
        agent: String,

        /// Signature set file (TOML or JSON) replacing the built-in tables
        #[arg(long)]
        signatures: Option<PathBuf>,

        /// uap-core regexes.yaml replacing the bundled family rules
        #[arg(long, env = "LOGFLOW_UA_REGEXES")]
        ua_regexes: Option<PathBuf>,

        /// Agents shorter than this are flagged as too short
        #[arg(long)]
        min_agent_length: Option<usize>,

        /// Print the classification as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the signature set used for classification
    Signatures {
        /// Signature set file (TOML or JSON) replacing the built-in tables
        #[arg(long)]
        signatures: Option<PathBuf>,

        #[command(flatten)]
        feed: FeedArgs,

        /// Print every pattern as JSON
        #[arg(long)]
        dump: bool,
    },

    /// Inspect and maintain the metadata store
    Meta {
        /// Metadata database (defaults to <out-dir>/meta.sqlite)
        #[arg(long, global = true)]
        db_path: Option<PathBuf>,

        /// Output directory holding the default database
        #[arg(long, global = true)]
        out_dir: Option<PathBuf>,

        #[command(subcommand)]
        command: MetaCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum MetaCommand {
    /// List ingested logs
    List {
        #[arg(long)]
        json: bool,
    },

    /// List claims that never completed
    Pending,

    /// Drop a pending claim so the file is ingested again
    Release {
        /// Tagged digest, e.g. sha256:<hex>
        digest: String,
    },

    /// Export ingested logs in the meta.csv layout
    Export {
        /// Destination CSV file
        #[arg(long)]
        csv: PathBuf,
    },
}

#[derive(Args, Debug, Default, Clone)]
pub struct FeedArgs {
    /// Crawler signature feed URL
    #[arg(long, conflicts_with_all = ["crawler_feed_path", "no_crawler_feed"])]
    pub crawler_feed_url: Option<String>,

    /// Crawler signature feed read from a local JSON file
    #[arg(long, conflicts_with = "no_crawler_feed")]
    pub crawler_feed_path: Option<PathBuf>,

    /// Use only the configured signatures
    #[arg(long)]
    pub no_crawler_feed: bool,
}

impl FeedArgs {
    pub fn apply(&self, config: &mut IngestConfig) {
        if let Some(url) = &self.crawler_feed_url {
            config.feed = FeedSource::Url { url: url.clone() };
        }
        if let Some(path) = &self.crawler_feed_path {
            config.feed = FeedSource::File { path: path.clone() };
        }
        if self.no_crawler_feed {
            config.feed = FeedSource::Disabled;
        }
    }
}

#[derive(Args, Debug, Default, Clone)]
#[command(group(ArgGroup::new("input").required(true).multiple(true).args(["log_path", "log_glob"])))]
pub struct IngestArgs {
    /// Log file to ingest (repeatable)
    #[arg(long, num_args = 1..)]
    pub log_path: Vec<PathBuf>,

    /// Glob pattern selecting log files
    #[arg(long)]
    pub log_glob: Option<String>,

    /// Partition directory name, e.g. rest
    #[arg(long)]
    pub namespace: Option<String>,

    /// Root directory of the partitions
    #[arg(long)]
    pub out_dir: Option<PathBuf>,

    /// Metadata database (defaults to <out-dir>/meta.sqlite)
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Drop static resource requests
    #[arg(long)]
    pub legacy: bool,

    /// Only files dated on or after this day (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    pub start_date: Option<NaiveDate>,

    /// Only files dated before this day (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    pub end_date: Option<NaiveDate>,

    /// Files processed concurrently
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Do not store records classified as bots
    #[arg(long, conflicts_with = "policy")]
    pub exclude_bots: bool,

    /// Bot handling policy
    #[arg(long, value_enum)]
    pub policy: Option<CategoryPolicy>,

    /// Only store records whose path starts with this segment (repeatable)
    #[arg(long = "allow-namespace")]
    pub allow_namespaces: Vec<String>,

    /// Signature set file (TOML or JSON) replacing the built-in tables
    #[arg(long)]
    pub signatures: Option<PathBuf>,

    /// uap-core regexes.yaml replacing the bundled family rules
    #[arg(long)]
    pub ua_regexes: Option<PathBuf>,

    #[command(flatten)]
    pub feed: FeedArgs,

    /// Content digest used to identify files
    #[arg(long)]
    pub digest: Option<ChecksumAlgorithm>,

    /// Agents shorter than this are flagged as too short
    #[arg(long)]
    pub min_agent_length: Option<usize>,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

fn parse_date(value: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

impl IngestArgs {
    /// Apply the flags on top of `base` and validate the result
    pub fn into_config(self, mut base: IngestConfig) -> Result<IngestConfig> {
        if let Some(namespace) = self.namespace {
            base.namespace = namespace;
        }
        if let Some(out_dir) = self.out_dir {
            base.out_dir = out_dir;
        }
        if self.db_path.is_some() {
            base.db_path = self.db_path;
        }
        if self.legacy {
            base.legacy = true;
        }
        if let Some(jobs) = self.jobs {
            base.jobs = jobs;
        }
        if let Some(policy) = self.policy {
            base.policy.category = policy;
        }
        if self.exclude_bots {
            base.policy.category = CategoryPolicy::ExcludeBots;
        }
        if !self.allow_namespaces.is_empty() {
            base.policy.allowed_namespaces = self.allow_namespaces;
        }
        if self.signatures.is_some() {
            base.signatures_path = self.signatures;
        }
        if self.ua_regexes.is_some() {
            base.ua_regexes = self.ua_regexes;
        }
        if let Some(digest) = self.digest {
            base.digest_algorithm = digest;
        }
        if let Some(length) = self.min_agent_length {
            base.min_agent_length = length;
        }
        base.start_date = self.start_date.or(base.start_date);
        base.end_date = self.end_date.or(base.end_date);
        self.feed.apply(&mut base);

        base.validate()?;
        Ok(base)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_ingest_flags_override_config() {
        let cli = Cli::try_parse_from([
            "logflow-ingest",
            "ingest",
            "--log-path",
            "a.log",
            "b.log",
            "--namespace",
            "rest",
            "--out-dir",
            "/tmp/out",
            "--exclude-bots",
            "--no-crawler-feed",
            "--digest",
            "sha512",
            "--start-date",
            "2023-01-01",
            "--end-date",
            "2023-02-01",
        ])
        .unwrap();
        let Commands::Ingest(args) = cli.command else {
            panic!("expected ingest");
        };
        assert_eq!(args.log_path.len(), 2);

        let config = args.into_config(IngestConfig::default()).unwrap();
        assert_eq!(config.namespace, "rest");
        assert_eq!(config.db_path(), PathBuf::from("/tmp/out/meta.sqlite"));
        assert_eq!(config.policy.category, CategoryPolicy::ExcludeBots);
        assert_eq!(config.feed, FeedSource::Disabled);
        assert_eq!(config.digest_algorithm, ChecksumAlgorithm::Sha512);
        assert_eq!(config.start_date, NaiveDate::from_ymd_opt(2023, 1, 1));
    }

    #[test]
    fn test_ingest_requires_input() {
        assert!(Cli::try_parse_from(["logflow-ingest", "ingest", "--namespace", "rest"]).is_err());
    }

    #[test]
    fn test_feed_flags_conflict() {
        assert!(Cli::try_parse_from([
            "logflow-ingest",
            "ingest",
            "--log-glob",
            "*.log",
            "--no-crawler-feed",
            "--crawler-feed-url",
            "http://localhost/feed.json",
        ])
        .is_err());
    }

    #[test]
    fn test_bad_date_is_rejected() {
        assert!(Cli::try_parse_from([
            "logflow-ingest",
            "ingest",
            "--log-glob",
            "*.log",
            "--start-date",
            "01/02/2023",
        ])
        .is_err());
    }
}
