//! Crawler signature feeds
//!
//! A feed supplies extra bot patterns in the crawler-user-agents JSON shape:
//!
//! ```json
//! [{ "pattern": "Googlebot\\/", "url": "http://www.google.com/bot.html" }]
//! ```
//!
//! Only `pattern` is read. Feeds are fetched once per process by
//! [`resolve_signatures`]; a failing feed never stops ingestion.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use super::signatures::SignatureSet;
use crate::error::{IngestError, Result};

/// Public crawler list used when no feed URL is configured
pub const DEFAULT_CRAWLER_FEED_URL: &str =
    "https://raw.githubusercontent.com/monperrus/crawler-user-agents/master/crawler-user-agents.json";

pub const DEFAULT_FEED_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_FEED_MAX_RETRIES: u32 = 3;

#[derive(Debug, Deserialize)]
struct FeedEntry {
    pattern: String,
}

/// Parse a crawler-user-agents document into its patterns
pub fn parse_feed(content: &str) -> Result<Vec<String>> {
    let entries: Vec<FeedEntry> = serde_json::from_str(content)?;
    Ok(entries.into_iter().map(|entry| entry.pattern).collect())
}

/// Source of external crawler patterns
#[async_trait]
pub trait CrawlerFeed: Send + Sync {
    /// Human readable origin, used in logs
    fn source(&self) -> String;

    async fn fetch(&self) -> Result<Vec<String>>;
}

/// Feed downloaded over HTTP with bounded retries
pub struct HttpCrawlerFeed {
    client: Client,
    url: String,
    max_retries: u32,
    retry_backoff: Duration,
}

impl HttpCrawlerFeed {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("logflow-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            max_retries: DEFAULT_FEED_MAX_RETRIES,
            retry_backoff: Duration::from_secs(1),
        })
    }

    /// Attempts (at least one) and the base delay, doubled after every failure
    pub fn with_retries(mut self, max_retries: u32, retry_backoff: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_backoff = retry_backoff;
        self
    }

    async fn fetch_once(&self) -> Result<Vec<String>> {
        let response = self.client.get(&self.url).send().await?.error_for_status()?;
        let body = response.text().await?;
        parse_feed(&body)
    }
}

#[async_trait]
impl CrawlerFeed for HttpCrawlerFeed {
    fn source(&self) -> String {
        self.url.clone()
    }

    async fn fetch(&self) -> Result<Vec<String>> {
        let mut last_error = None;

        for attempt in 1..=self.max_retries {
            match self.fetch_once().await {
                Ok(patterns) => return Ok(patterns),
                Err(e) => {
                    warn!(
                        url = %self.url,
                        attempt,
                        max_retries = self.max_retries,
                        error = %e,
                        "Crawler feed request failed"
                    );
                    last_error = Some(e);

                    if attempt < self.max_retries {
                        let delay = self.retry_backoff * 2u32.saturating_pow(attempt - 1);
                        tokio::time::sleep(delay).await;
                    }
                },
            }
        }

        Err(last_error.unwrap_or_else(|| IngestError::feed("no fetch attempt was made")))
    }
}

/// Feed read from a local JSON document
pub struct JsonFileCrawlerFeed {
    path: PathBuf,
}

impl JsonFileCrawlerFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CrawlerFeed for JsonFileCrawlerFeed {
    fn source(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch(&self) -> Result<Vec<String>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| IngestError::unreadable(&self.path, e))?;
        parse_feed(&content)
    }
}

/// Fixed in-memory pattern list
#[derive(Debug, Clone, Default)]
pub struct StaticCrawlerFeed {
    patterns: Vec<String>,
}

impl StaticCrawlerFeed {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }
}

#[async_trait]
impl CrawlerFeed for StaticCrawlerFeed {
    fn source(&self) -> String {
        "static".to_string()
    }

    async fn fetch(&self) -> Result<Vec<String>> {
        Ok(self.patterns.clone())
    }
}

/// Extend `base` with the feed's patterns
///
/// Any feed failure is logged and `base` is returned unchanged.
pub async fn resolve_signatures(base: SignatureSet, feed: Option<&dyn CrawlerFeed>) -> SignatureSet {
    let Some(feed) = feed else {
        return base;
    };

    let patterns = match feed.fetch().await {
        Ok(patterns) => patterns,
        Err(e) => {
            warn!(
                source = %feed.source(),
                error = %e,
                "Crawler feed unavailable, continuing with built-in signatures"
            );
            return base;
        },
    };

    let fallback = base.clone();
    match base.with_feed_patterns(&patterns) {
        Ok(merged) => {
            info!(
                source = %feed.source(),
                fetched = patterns.len(),
                version = %merged.version,
                "Merged crawler feed"
            );
            merged
        },
        Err(e) => {
            warn!(source = %feed.source(), error = %e, "Could not merge crawler feed");
            fallback
        },
    }
}
