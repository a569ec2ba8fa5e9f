//! The normalized request record produced for every accepted log line
//!
//! Records are immutable once built.

use chrono::{DateTime, FixedOffset, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::classifier::Classification;
use crate::parser::ParsedLine;

#[allow(clippy::expect_used)]
static NAMESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/([^./\s?#]+?)(?:[/?#]|$)").expect("namespace pattern is valid"));

/// HTTP request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    /// Empty or unrecognised method token
    Unknown,
}

impl Method {
    pub fn parse(token: &str) -> Self {
        match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "CONNECT" => Method::Connect,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            "PATCH" => Method::Patch,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
            Method::Unknown => "",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP status as logged
///
/// A non-numeric status keeps the raw token. Callers that need the numeric
/// code must go through [`Status::code`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Valid(u16),
    Invalid(String),
}

impl Status {
    pub fn parse(token: &str) -> Self {
        match token.parse::<u16>() {
            Ok(code) => Status::Valid(code),
            Err(_) => Status::Invalid(token.to_string()),
        }
    }

    pub fn code(&self) -> Option<u16> {
        match self {
            Status::Valid(code) => Some(*code),
            Status::Invalid(_) => None,
        }
    }

    /// Status class 1..=5 for codes in 100..=599
    pub fn class(&self) -> Option<StatusClass> {
        self.code().and_then(StatusClass::from_code)
    }
}

/// First digit of a status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusClass {
    Informational,
    Success,
    Redirection,
    ClientError,
    ServerError,
}

impl StatusClass {
    pub const ALL: [StatusClass; 5] = [
        StatusClass::Informational,
        StatusClass::Success,
        StatusClass::Redirection,
        StatusClass::ClientError,
        StatusClass::ServerError,
    ];

    pub fn from_code(code: u16) -> Option<Self> {
        match code / 100 {
            1 => Some(StatusClass::Informational),
            2 => Some(StatusClass::Success),
            3 => Some(StatusClass::Redirection),
            4 => Some(StatusClass::ClientError),
            5 => Some(StatusClass::ServerError),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        match self {
            StatusClass::Informational => 0,
            StatusClass::Success => 1,
            StatusClass::Redirection => 2,
            StatusClass::ClientError => 3,
            StatusClass::ServerError => 4,
        }
    }

    /// Column name used by the metadata store, e.g. `status_2xx`
    pub fn column(self) -> &'static str {
        match self {
            StatusClass::Informational => "status_1xx",
            StatusClass::Success => "status_2xx",
            StatusClass::Redirection => "status_3xx",
            StatusClass::ClientError => "status_4xx",
            StatusClass::ServerError => "status_5xx",
        }
    }
}

/// Coarse client classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserCategory {
    Browser,
    Programmatic,
    Bot,
    #[default]
    Unknown,
}

impl UserCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            UserCategory::Browser => "browser",
            UserCategory::Programmatic => "programmatic",
            UserCategory::Bot => "bot",
            UserCategory::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for UserCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One successfully parsed and classified log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    timestamp: DateTime<FixedOffset>,
    client_ip: String,
    method: Method,
    request_path: String,
    protocol: Option<String>,
    status: Status,
    bytes_sent: u64,
    referrer: Option<String>,
    user_agent_raw: String,
    user_agent_family: String,
    user_category: UserCategory,
    response_time: Option<f64>,
    namespace: Option<String>,
}

impl RequestRecord {
    pub fn new(line: ParsedLine, classification: &Classification) -> Self {
        let namespace = namespace_of(&line.request_path);
        Self {
            timestamp: line.timestamp,
            client_ip: line.client_ip,
            method: line.method,
            request_path: line.request_path,
            protocol: line.protocol,
            status: line.status,
            bytes_sent: line.bytes_sent,
            referrer: line.referrer,
            user_agent_raw: line.user_agent,
            user_agent_family: classification.family.clone(),
            user_category: classification.category,
            response_time: line.response_time,
            namespace,
        }
    }

    pub fn timestamp(&self) -> DateTime<FixedOffset> {
        self.timestamp
    }

    pub fn timestamp_utc(&self) -> DateTime<Utc> {
        self.timestamp.with_timezone(&Utc)
    }

    /// Calendar month in UTC, e.g. `2023-07`
    pub fn month_key(&self) -> String {
        self.timestamp_utc().format("%Y-%m").to_string()
    }

    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn request_path(&self) -> &str {
        &self.request_path
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn referrer(&self) -> Option<&str> {
        self.referrer.as_deref()
    }

    pub fn user_agent_raw(&self) -> &str {
        &self.user_agent_raw
    }

    pub fn user_agent_family(&self) -> &str {
        &self.user_agent_family
    }

    pub fn user_category(&self) -> UserCategory {
        self.user_category
    }

    pub fn response_time(&self) -> Option<f64> {
        self.response_time
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

/// Top-level path segment of a request target, e.g. `uniprot` for `/uniprot/P12345`
pub fn namespace_of(request_path: &str) -> Option<String> {
    NAMESPACE_RE
        .captures(request_path)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse() {
        assert_eq!(Method::parse("GET"), Method::Get);
        assert_eq!(Method::parse("PATCH"), Method::Patch);
        assert_eq!(Method::parse("get"), Method::Unknown);
        assert_eq!(Method::parse(""), Method::Unknown);
        assert_eq!(Method::Unknown.as_str(), "");
    }

    #[test]
    fn test_status_validity() {
        assert_eq!(Status::parse("404").code(), Some(404));
        assert_eq!(Status::parse("404").class(), Some(StatusClass::ClientError));

        let invalid = Status::parse("-");
        assert_eq!(invalid, Status::Invalid("-".to_string()));
        assert_eq!(invalid.code(), None);
        assert_eq!(invalid.class(), None);

        assert_eq!(Status::parse("000").class(), None);
        assert_eq!(Status::parse("999").class(), None);
    }

    #[test]
    fn test_namespace_of() {
        assert_eq!(namespace_of("/uniprot/P12345"), Some("uniprot".to_string()));
        assert_eq!(namespace_of("/blast"), Some("blast".to_string()));
        assert_eq!(namespace_of("/uniprotkb?query=insulin"), Some("uniprotkb".to_string()));
        assert_eq!(namespace_of("/favicon.ico"), None);
        assert_eq!(namespace_of("/"), None);
        assert_eq!(namespace_of(""), None);
    }
}
