//! User-agent family detection
//!
//! A family is the product name of the client software ("Chrome",
//! "Python Requests", "Googlebot"). Families come from a uap-core style rule
//! file evaluated by `uaparser`: the first matching rule wins, so more
//! specific products (Edge, Opera, headless Chrome) precede the engines they
//! embed. The bundled rules live in `data/user_agents.yaml`.

use std::path::Path;
use uaparser::{Parser, UserAgentParser};

use crate::error::{IngestError, Result};

/// Family reported when no rule recognises the agent
pub const OTHER_FAMILY: &str = "Other";

static BUILTIN_RULES: &[u8] = include_bytes!("../../data/user_agents.yaml");

/// Maps a raw user-agent string to a family name
pub trait FamilyDetector: Send + Sync {
    fn family(&self, agent: &str) -> String;
}

/// Detector backed by a uap-core `regexes.yaml` rule set
pub struct UaParserFamilyDetector {
    parser: UserAgentParser,
    source: String,
}

impl std::fmt::Debug for UaParserFamilyDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UaParserFamilyDetector")
            .field("source", &self.source)
            .finish()
    }
}

impl UaParserFamilyDetector {
    /// The bundled rule set
    pub fn builtin() -> Result<Self> {
        Self::from_bytes(BUILTIN_RULES, "builtin")
    }

    /// Load rules from a uap-core `regexes.yaml` file
    pub fn from_yaml(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| IngestError::unreadable(path, e))?;
        Self::from_bytes(&bytes, &path.display().to_string())
    }

    fn from_bytes(bytes: &[u8], source: &str) -> Result<Self> {
        let parser = UserAgentParser::from_bytes(bytes).map_err(|e| IngestError::UserAgentRules {
            source_name: source.to_string(),
            reason: format!("{e:?}"),
        })?;
        Ok(Self {
            parser,
            source: source.to_string(),
        })
    }
}

impl FamilyDetector for UaParserFamilyDetector {
    fn family(&self, agent: &str) -> String {
        let family = self.parser.parse_user_agent(agent).family.to_string();
        if family.is_empty() {
            OTHER_FAMILY.to_string()
        } else {
            family
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::LazyLock;

    static DETECTOR: LazyLock<UaParserFamilyDetector> =
        LazyLock::new(|| UaParserFamilyDetector::builtin().unwrap());

    fn family(agent: &str) -> String {
        DETECTOR.family(agent)
    }

    #[test]
    fn test_browsers() {
        assert_eq!(
            family("Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36"),
            "Chrome"
        );
        assert_eq!(
            family("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36 Edg/118.0.2088.46"),
            "Edge"
        );
        assert_eq!(
            family("Mozilla/5.0 (Linux; Android 10; K) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Mobile Safari/537.36"),
            "Chrome Mobile"
        );
        assert_eq!(
            family("Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/118.0"),
            "Firefox"
        );
        assert_eq!(
            family("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15"),
            "Safari"
        );
        assert_eq!(
            family("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1"),
            "Mobile Safari"
        );
        assert_eq!(
            family("Mozilla/5.0 (compatible; MSIE 9.0; Windows NT 6.1; Trident/5.0)"),
            "IE"
        );
    }

    #[test]
    fn test_programmatic_tools() {
        assert_eq!(family("python-requests/2.28.1"), "Python Requests");
        assert_eq!(family("Python-urllib/3.11"), "Python-urllib");
        assert_eq!(family("curl/8.4.0"), "curl");
        assert_eq!(family("Wget/1.21.4"), "Wget");
        assert_eq!(family("Java/17.0.2"), "Java");
        assert_eq!(family("okhttp/4.12.0"), "okhttp");
    }

    #[test]
    fn test_crawlers() {
        assert_eq!(
            family("Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)"),
            "Googlebot"
        );
        assert_eq!(family("Googlebot/2.1 (+http://www.google.com/bot.html)"), "Googlebot");
        assert_eq!(family("Mozilla/5.0 (compatible; ExampleBot/1.0)"), "ExampleBot");
    }

    #[test]
    fn test_generic_product_and_other() {
        assert_eq!(family("R/4.3.1 (x86_64-pc-linux-gnu)"), "R");
        assert_eq!(family("Mozilla/5.0"), OTHER_FAMILY);
        assert_eq!(family("-"), OTHER_FAMILY);
        assert_eq!(family(""), OTHER_FAMILY);
    }

    #[test]
    fn test_rules_from_regexes_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regexes.yaml");
        std::fs::write(
            &path,
            "user_agent_parsers:\n  - regex: '(Lynx)/(\\d+)\\.(\\d+)'\nos_parsers: []\ndevice_parsers: []\n",
        )
        .unwrap();

        let detector = UaParserFamilyDetector::from_yaml(&path).unwrap();
        assert_eq!(detector.family("Lynx/2.9.0dev.12 libwww-FM/2.14"), "Lynx");
        assert_eq!(detector.family("curl/8.4.0"), OTHER_FAMILY);
    }

    #[test]
    fn test_unreadable_rule_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = UaParserFamilyDetector::from_yaml(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, IngestError::Unreadable { .. }));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "user_agent_parsers: [").unwrap();
        let err = UaParserFamilyDetector::from_yaml(&bad).unwrap_err();
        assert!(matches!(err, IngestError::UserAgentRules { .. }));
    }
}
