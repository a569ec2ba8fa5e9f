//! Access log line parser
//!
//! Parses one line of the extended common log format written by the service
//! front ends:
//!
//! ```text
//! ip ident user [10/Oct/2023:13:55:36 +0000] "GET /uniprot/P12345 HTTP/1.1" 200 2326 "referrer" "agent" 0.012 <trailing fields>
//! ```
//!
//! The plain combined format (no response time, no trailing fields) written by
//! newer servers is accepted as a fallback.
//!
//! Parsing is total. Every input produces a [`ParseOutcome`], and lines that do
//! not fit are reported as [`SkipReason`] values for the caller to count.

use chrono::{DateTime, FixedOffset};
use regex::{Captures, Regex};
use std::sync::LazyLock;

use crate::decode::percent_decode_twice;
use crate::record::{Method, Status};

/// Timestamp layout inside the brackets
pub const LOG_DATE_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

#[allow(clippy::expect_used)]
static EXTENDED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?s)^(?P<ip>\S+) (?P<ident>\S+) (?P<user>\S+) ",
        r"\[(?P<datetime>[^\]]*)\] ",
        r#""(?P<request>.*?)" "#,
        r"(?P<status>\S+) ",
        r"(?P<bytes>-|\d+(?:\.\d+)?) ",
        r#""(?P<referrer>.*?)" "#,
        r#""(?P<user_agent>.*?)" "#,
        r"(?P<response_time>\d+(?:\.\d+)?)",
        r"(?: (?P<trailing>.*))?$",
    ))
    .expect("extended log pattern is valid")
});

#[allow(clippy::expect_used)]
static COMBINED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?s)^(?P<ip>\S+) (?P<ident>\S+) (?P<user>\S+) ",
        r"\[(?P<datetime>[^\]]*)\] ",
        r#""(?P<request>.*?)" "#,
        r"(?P<status>\S+) ",
        r"(?P<bytes>-|\d+(?:\.\d+)?) ",
        r#""(?P<referrer>.*?)" "#,
        r#""(?P<user_agent>.*)"\s*$"#,
    ))
    .expect("combined log pattern is valid")
});

/// Fields extracted from one matching line, before classification
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub timestamp: DateTime<FixedOffset>,
    pub client_ip: String,
    pub method: Method,
    pub request_path: String,
    pub protocol: Option<String>,
    pub status: Status,
    pub bytes_sent: u64,
    pub referrer: Option<String>,
    pub user_agent: String,
    pub response_time: Option<f64>,
}

/// Why a line did not produce a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// Blank or whitespace-only line
    Empty,
    /// The line does not have the log format shape
    Unmatched,
    /// The bracketed timestamp could not be parsed
    BadDate,
    /// The timestamp lies before the configured sanity floor
    TooOld,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::Empty => "empty",
            SkipReason::Unmatched => "unmatched",
            SkipReason::BadDate => "bad_date",
            SkipReason::TooOld => "too_old",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of parsing one line
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Parsed(ParsedLine),
    Skipped(SkipReason),
}

/// Parser for extended and combined access log lines
#[derive(Debug, Clone)]
pub struct LineParser {
    accept_combined: bool,
}

impl Default for LineParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LineParser {
    /// Parser accepting both the extended and the combined format
    pub fn new() -> Self {
        Self {
            accept_combined: true,
        }
    }

    /// Parser accepting only lines that carry a response time
    pub fn extended_only() -> Self {
        Self {
            accept_combined: false,
        }
    }

    /// Parse one decoded line (without its line terminator)
    pub fn parse(&self, line: &str) -> ParseOutcome {
        if line.trim().is_empty() {
            return ParseOutcome::Skipped(SkipReason::Empty);
        }

        let line = percent_decode_twice(line);

        let caps = match EXTENDED_RE.captures(&line) {
            Some(caps) => caps,
            None if self.accept_combined => match COMBINED_RE.captures(&line) {
                Some(caps) => caps,
                None => return ParseOutcome::Skipped(SkipReason::Unmatched),
            },
            None => return ParseOutcome::Skipped(SkipReason::Unmatched),
        };

        match Self::extract(&caps) {
            Ok(parsed) => ParseOutcome::Parsed(parsed),
            Err(reason) => ParseOutcome::Skipped(reason),
        }
    }

    fn extract(caps: &Captures<'_>) -> Result<ParsedLine, SkipReason> {
        let field = |name: &str| caps.name(name).map_or("", |m| m.as_str());

        let timestamp = DateTime::parse_from_str(field("datetime"), LOG_DATE_FORMAT)
            .map_err(|_| SkipReason::BadDate)?;
        let (method, request_path, protocol) = split_request(field("request"));
        let bytes_sent = parse_bytes(field("bytes")).ok_or(SkipReason::Unmatched)?;
        let referrer = match field("referrer") {
            "-" => None,
            other => Some(other.to_string()),
        };
        let response_time = caps
            .name("response_time")
            .and_then(|m| m.as_str().parse::<f64>().ok());

        Ok(ParsedLine {
            timestamp,
            client_ip: field("ip").to_string(),
            method,
            request_path,
            protocol,
            status: Status::parse(field("status")),
            bytes_sent,
            referrer,
            user_agent: field("user_agent").to_string(),
            response_time,
        })
    }
}

/// Split a request line into method, target and protocol
///
/// Tolerates a missing protocol, a literal `null` in its place, a missing
/// method and an entirely empty request.
fn split_request(request: &str) -> (Method, String, Option<String>) {
    let request = request.trim();

    let (rest, protocol) = match request.rsplit_once(' ') {
        Some((head, last)) if is_protocol_token(last) => (head.trim_end(), protocol_of(last)),
        None if is_protocol_token(request) => ("", protocol_of(request)),
        _ => (request, None),
    };

    let (method, path) = match rest.split_once(' ') {
        Some((token, path)) if is_method_token(token) => (Method::parse(token), path.trim()),
        None if is_method_token(rest) => (Method::parse(rest), ""),
        _ => (Method::Unknown, rest),
    };

    (method, path.to_string(), protocol)
}

fn is_protocol_token(token: &str) -> bool {
    token == "null" || token.starts_with("HTTP/")
}

fn protocol_of(token: &str) -> Option<String> {
    (token != "null").then(|| token.to_string())
}

fn is_method_token(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_uppercase())
}

/// `-` is zero and a decimal byte count keeps its integer part
fn parse_bytes(token: &str) -> Option<u64> {
    if token == "-" {
        return Some(0);
    }
    let integer = token.split_once('.').map_or(token, |(int, _)| int);
    integer.parse::<u64>().ok()
}
