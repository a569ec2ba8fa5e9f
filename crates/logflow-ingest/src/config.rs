//! Ingestion configuration
//!
//! Defaults are overridden by `LOGFLOW_*` environment variables, which are in
//! turn overridden by command line flags.

use chrono::{DateTime, NaiveDate, Utc};
use clap::ValueEnum;
use logflow_common::types::ChecksumAlgorithm;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::classifier::feed::{DEFAULT_CRAWLER_FEED_URL, DEFAULT_FEED_MAX_RETRIES, DEFAULT_FEED_TIMEOUT_SECS};
use crate::classifier::DEFAULT_MIN_AGENT_LENGTH;
use crate::error::{IngestError, Result};
use crate::ingestor::default_too_old;
use crate::meta::DEFAULT_BUSY_TIMEOUT_SECS;
use crate::record::{RequestRecord, UserCategory};

/// How bot traffic is treated before records reach the sink
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum CategoryPolicy {
    /// Store every accepted record
    #[default]
    IncludeAll,
    /// Drop records classified as bots
    ExcludeBots,
}

impl CategoryPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            CategoryPolicy::IncludeAll => "include-all",
            CategoryPolicy::ExcludeBots => "exclude-bots",
        }
    }
}

impl std::str::FromStr for CategoryPolicy {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "include-all" | "include_all" => Ok(CategoryPolicy::IncludeAll),
            "exclude-bots" | "exclude_bots" => Ok(CategoryPolicy::ExcludeBots),
            other => Err(IngestError::config(format!(
                "Invalid category policy '{other}'. Must be 'include-all' or 'exclude-bots'"
            ))),
        }
    }
}

/// Filter applied between the ingestor and the sink
///
/// Statistics are always computed before the policy runs; only the rows
/// written to partitions are affected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPolicy {
    pub category: CategoryPolicy,
    /// When non-empty, only records whose path namespace is listed are stored
    #[serde(default)]
    pub allowed_namespaces: Vec<String>,
}

impl RecordPolicy {
    pub fn admits(&self, record: &RequestRecord) -> bool {
        if self.category == CategoryPolicy::ExcludeBots && record.user_category() == UserCategory::Bot {
            return false;
        }
        if self.allowed_namespaces.is_empty() {
            return true;
        }
        record
            .namespace()
            .is_some_and(|ns| self.allowed_namespaces.iter().any(|allowed| allowed == ns))
    }
}

/// Where extra crawler signatures come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedSource {
    Disabled,
    Url { url: String },
    File { path: PathBuf },
}

impl Default for FeedSource {
    fn default() -> Self {
        FeedSource::Url {
            url: DEFAULT_CRAWLER_FEED_URL.to_string(),
        }
    }
}

/// Everything one ingestion run needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Partition directory name under `out_dir`
    pub namespace: String,
    pub out_dir: PathBuf,
    /// Metadata database, `<out_dir>/meta.sqlite` when unset
    pub db_path: Option<PathBuf>,
    /// Drop static resource requests
    pub legacy: bool,
    /// Files processed concurrently
    pub jobs: usize,
    pub digest_algorithm: ChecksumAlgorithm,
    pub policy: RecordPolicy,
    pub min_agent_length: usize,
    /// Records older than this are skipped
    pub too_old: DateTime<Utc>,
    /// Inclusive lower bound on the date embedded in the file name
    pub start_date: Option<NaiveDate>,
    /// Exclusive upper bound on the date embedded in the file name
    pub end_date: Option<NaiveDate>,
    pub feed: FeedSource,
    pub feed_timeout_secs: u64,
    pub feed_max_retries: u32,
    /// TOML or JSON signature set replacing the built-in tables
    pub signatures_path: Option<PathBuf>,
    /// uap-core `regexes.yaml` replacing the bundled family rules
    pub ua_regexes: Option<PathBuf>,
    pub busy_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            out_dir: PathBuf::from("data"),
            db_path: None,
            legacy: false,
            jobs: default_jobs(),
            digest_algorithm: ChecksumAlgorithm::Sha256,
            policy: RecordPolicy::default(),
            min_agent_length: DEFAULT_MIN_AGENT_LENGTH,
            too_old: default_too_old(),
            start_date: None,
            end_date: None,
            feed: FeedSource::default(),
            feed_timeout_secs: DEFAULT_FEED_TIMEOUT_SECS,
            feed_max_retries: DEFAULT_FEED_MAX_RETRIES,
            signatures_path: None,
            ua_regexes: None,
            busy_timeout_secs: DEFAULT_BUSY_TIMEOUT_SECS,
        }
    }
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| IngestError::config(format!("Invalid value '{value}' for {name}"))),
        Err(_) => Ok(None),
    }
}

impl IngestConfig {
    /// Load configuration from environment variables
    ///
    /// - `LOGFLOW_NAMESPACE`, `LOGFLOW_OUT_DIR`, `LOGFLOW_DB_PATH`
    /// - `LOGFLOW_JOBS`, `LOGFLOW_LEGACY`, `LOGFLOW_DIGEST`, `LOGFLOW_POLICY`
    /// - `LOGFLOW_MIN_AGENT_LENGTH`, `LOGFLOW_SIGNATURES`, `LOGFLOW_UA_REGEXES`
    /// - `LOGFLOW_BUSY_TIMEOUT_SECS`
    /// - `LOGFLOW_CRAWLER_FEED_URL`, `LOGFLOW_CRAWLER_FEED_PATH`, `LOGFLOW_NO_CRAWLER_FEED`
    /// - `LOGFLOW_FEED_TIMEOUT_SECS`, `LOGFLOW_FEED_MAX_RETRIES`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(namespace) = std::env::var("LOGFLOW_NAMESPACE") {
            config.namespace = namespace;
        }
        if let Ok(dir) = std::env::var("LOGFLOW_OUT_DIR") {
            config.out_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("LOGFLOW_DB_PATH") {
            config.db_path = Some(PathBuf::from(path));
        }
        if let Some(jobs) = env_parse("LOGFLOW_JOBS")? {
            config.jobs = jobs;
        }
        if let Some(legacy) = env_parse("LOGFLOW_LEGACY")? {
            config.legacy = legacy;
        }
        if let Ok(digest) = std::env::var("LOGFLOW_DIGEST") {
            config.digest_algorithm = digest.parse()?;
        }
        if let Ok(policy) = std::env::var("LOGFLOW_POLICY") {
            config.policy.category = policy.parse()?;
        }
        if let Some(length) = env_parse("LOGFLOW_MIN_AGENT_LENGTH")? {
            config.min_agent_length = length;
        }
        if let Ok(path) = std::env::var("LOGFLOW_SIGNATURES") {
            config.signatures_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("LOGFLOW_UA_REGEXES") {
            config.ua_regexes = Some(PathBuf::from(path));
        }
        if let Some(secs) = env_parse("LOGFLOW_BUSY_TIMEOUT_SECS")? {
            config.busy_timeout_secs = secs;
        }
        if let Some(secs) = env_parse("LOGFLOW_FEED_TIMEOUT_SECS")? {
            config.feed_timeout_secs = secs;
        }
        if let Some(retries) = env_parse("LOGFLOW_FEED_MAX_RETRIES")? {
            config.feed_max_retries = retries;
        }

        if let Ok(url) = std::env::var("LOGFLOW_CRAWLER_FEED_URL") {
            config.feed = FeedSource::Url { url };
        }
        if let Ok(path) = std::env::var("LOGFLOW_CRAWLER_FEED_PATH") {
            config.feed = FeedSource::File {
                path: PathBuf::from(path),
            };
        }
        if env_parse::<bool>("LOGFLOW_NO_CRAWLER_FEED")?.unwrap_or(false) {
            config.feed = FeedSource::Disabled;
        }

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.namespace.contains(['/', '\\']) || self.namespace == ".." {
            return Err(IngestError::config(format!(
                "Namespace '{}' must be a single path segment",
                self.namespace
            )));
        }
        if self.jobs == 0 {
            return Err(IngestError::config("LOGFLOW_JOBS must be greater than 0"));
        }
        if self.busy_timeout_secs == 0 {
            return Err(IngestError::config(
                "LOGFLOW_BUSY_TIMEOUT_SECS must be greater than 0",
            ));
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start >= end {
                return Err(IngestError::config(format!(
                    "Start date {start} must be before end date {end}"
                )));
            }
        }
        if let FeedSource::Url { url } = &self.feed {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(IngestError::config(format!(
                    "Crawler feed URL '{url}' must use http or https"
                )));
            }
        }
        Ok(())
    }

    /// Metadata database location
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.out_dir.join("meta.sqlite"))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }

    pub fn feed_timeout(&self) -> Duration {
        Duration::from_secs(self.feed_timeout_secs)
    }
}
