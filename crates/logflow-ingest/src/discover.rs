//! Log file discovery
//!
//! Rotated access logs are named `<prefix>.<YYYY-MM-DD>.log`. The embedded
//! date drives the optional `[start, end)` filter.

use chrono::NaiveDate;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::error::{IngestError, Result};

#[allow(clippy::expect_used)]
static LOG_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.([0-9\-]+)\.log$").expect("log date pattern is valid"));

/// Date embedded in a rotated log file name
pub fn log_file_date(path: &Path) -> Option<NaiveDate> {
    let name = path.file_name()?.to_str()?;
    let caps = LOG_DATE_RE.captures(name)?;
    NaiveDate::parse_from_str(caps.get(1)?.as_str(), "%Y-%m-%d").ok()
}

/// Half-open range of file dates; an unset bound is unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        Self { start, end }
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.is_none_or(|start| start <= date) && self.end.is_none_or(|end| date < end)
    }

    /// Whether `path` belongs to the range
    ///
    /// With any bound set, a file whose name carries no date is excluded.
    pub fn admits(&self, path: &Path) -> bool {
        if self.is_unbounded() {
            return true;
        }
        match log_file_date(path) {
            Some(date) => self.contains(date),
            None => {
                warn!(path = %path.display(), "Log file name has no date, excluded by date range");
                false
            },
        }
    }
}

/// Collect explicit paths and glob matches, filtered by `range`
///
/// The result is sorted and free of duplicates.
pub fn discover(paths: &[PathBuf], pattern: Option<&str>, range: &DateRange) -> Result<Vec<PathBuf>> {
    let mut found: BTreeSet<PathBuf> = paths.iter().cloned().collect();

    if let Some(pattern) = pattern {
        let entries = glob::glob(pattern)
            .map_err(|e| IngestError::config(format!("Invalid log glob '{pattern}': {e}")))?;
        for entry in entries {
            match entry {
                Ok(path) if path.is_file() => {
                    found.insert(path);
                },
                Ok(_) => {},
                Err(e) => warn!(error = %e, "Could not read glob match"),
            }
        }
    }

    let selected: Vec<PathBuf> = found.into_iter().filter(|path| range.admits(path)).collect();
    debug!(count = selected.len(), "Discovered log files");
    Ok(selected)
}
