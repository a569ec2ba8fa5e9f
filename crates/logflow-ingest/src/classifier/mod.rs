//! User-agent classification
//!
//! Assigns every agent a family and one of four categories. The decision is
//! layered and deterministic:
//!
//! 1. the [`FamilyDetector`] names the client family
//! 2. family `Other` or an `unknown` signature match means the agent is `unknown`
//! 3. a bot signature match means `bot`
//! 4. a programmatic family or programmatic signature match means `programmatic`
//! 5. a browser family means `browser`
//! 6. anything left is `unknown`
//!
//! Agents shorter than the configured minimum are flagged `too_short` for
//! auditing. The flag never changes the category.

pub mod family;
pub mod feed;
pub mod signatures;

pub use family::{FamilyDetector, UaParserFamilyDetector, OTHER_FAMILY};
pub use feed::{CrawlerFeed, HttpCrawlerFeed, JsonFileCrawlerFeed, StaticCrawlerFeed};
pub use signatures::{sanitize_feed_pattern, CompiledSignatures, SignatureSet};

use serde::Serialize;
use std::path::Path;

use crate::error::Result;
use crate::record::UserCategory;

/// Agents shorter than this are reported as suspiciously short
pub const DEFAULT_MIN_AGENT_LENGTH: usize = 40;

/// Detector for a uap-core rule file, or for the bundled rules when `rules` is unset
pub fn family_detector(rules: Option<&Path>) -> Result<Box<dyn FamilyDetector>> {
    let detector = match rules {
        Some(path) => UaParserFamilyDetector::from_yaml(path)?,
        None => UaParserFamilyDetector::builtin()?,
    };
    Ok(Box::new(detector))
}

/// Outcome of classifying one user-agent string
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub family: String,
    pub category: UserCategory,
    pub too_short: bool,
}

impl Default for Classification {
    fn default() -> Self {
        Self {
            family: OTHER_FAMILY.to_string(),
            category: UserCategory::Unknown,
            too_short: false,
        }
    }
}

/// Classifies raw user-agent strings against one compiled [`SignatureSet`]
pub struct UserAgentClassifier {
    detector: Box<dyn FamilyDetector>,
    signatures: CompiledSignatures,
    min_agent_length: usize,
}

impl std::fmt::Debug for UserAgentClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserAgentClassifier")
            .field("signatures", &self.signatures.version())
            .field("min_agent_length", &self.min_agent_length)
            .finish()
    }
}

impl UserAgentClassifier {
    /// Classifier using the bundled family rules
    pub fn new(signatures: &SignatureSet, min_agent_length: usize) -> Result<Self> {
        Self::with_detector(family_detector(None)?, signatures, min_agent_length)
    }

    pub fn with_detector(
        detector: Box<dyn FamilyDetector>,
        signatures: &SignatureSet,
        min_agent_length: usize,
    ) -> Result<Self> {
        Ok(Self {
            detector,
            signatures: signatures.compile()?,
            min_agent_length,
        })
    }

    /// Built-in signatures and default minimum agent length
    pub fn builtin() -> Result<Self> {
        Self::new(&SignatureSet::builtin(), DEFAULT_MIN_AGENT_LENGTH)
    }

    pub fn signatures_version(&self) -> &str {
        self.signatures.version()
    }

    pub fn classify(&self, agent: &str) -> Classification {
        let family = self.detector.family(agent);
        let category = self.categorise(agent, &family);

        Classification {
            family,
            category,
            too_short: agent.chars().count() < self.min_agent_length,
        }
    }

    fn categorise(&self, agent: &str, family: &str) -> UserCategory {
        if family == OTHER_FAMILY || self.signatures.is_unknown_agent(agent) {
            return UserCategory::Unknown;
        }
        if self.signatures.is_bot(agent) {
            return UserCategory::Bot;
        }
        if self.signatures.is_programmatic_family(family)
            || self.signatures.is_programmatic_agent(agent)
        {
            return UserCategory::Programmatic;
        }
        if self.signatures.is_browser_family(family) {
            return UserCategory::Browser;
        }
        UserCategory::Unknown
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const CHROME: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36";

    struct FixedFamily(&'static str);

    impl FamilyDetector for FixedFamily {
        fn family(&self, _agent: &str) -> String {
            self.0.to_string()
        }
    }

    #[test]
    fn test_classification_table() {
        let classifier = UserAgentClassifier::builtin().unwrap();

        let chrome = classifier.classify(CHROME);
        assert_eq!(chrome.family, "Chrome");
        assert_eq!(chrome.category, UserCategory::Browser);
        assert!(!chrome.too_short);

        let requests = classifier.classify("python-requests/2.28.1");
        assert_eq!(requests.family, "Python Requests");
        assert_eq!(requests.category, UserCategory::Programmatic);
        assert!(requests.too_short);

        let googlebot = classifier.classify("Googlebot/2.1 (+http://www.google.com/bot.html)");
        assert_eq!(googlebot.category, UserCategory::Bot);

        let dash = classifier.classify("-");
        assert_eq!(dash, Classification { too_short: true, ..Classification::default() });
    }

    #[test]
    fn test_programmatic_by_agent_pattern() {
        let classifier = UserAgentClassifier::builtin().unwrap();
        let aiohttp = classifier.classify("Python/3.11 aiohttp/3.9.1");
        assert_eq!(aiohttp.family, "Python");
        assert_eq!(aiohttp.category, UserCategory::Programmatic);
    }

    #[test]
    fn test_bot_signature_beats_browser_family() {
        let classifier = UserAgentClassifier::builtin().unwrap();
        let agent = "Mozilla/5.0 (Linux; Android 6.0.1) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Mobile Safari/537.36 (compatible; Googlebot/2.1)";
        assert_eq!(classifier.classify(agent).category, UserCategory::Bot);
    }

    #[test]
    fn test_recognised_family_outside_allow_lists_is_unknown() {
        let classifier = UserAgentClassifier::builtin().unwrap();
        let r = classifier.classify("R/4.3.1 (x86_64-pc-linux-gnu) R (4.3.1 x86_64-pc-linux-gnu)");
        assert_eq!(r.family, "R");
        assert_eq!(r.category, UserCategory::Unknown);
    }

    #[test]
    fn test_injected_detector_and_signatures() {
        let signatures = SignatureSet {
            version: "custom".to_string(),
            bot: vec!["evil".to_string()],
            programmatic: vec![],
            unknown: vec![],
            programmatic_families: vec![],
            browser_families: vec!["Lynx".to_string()],
        };
        let classifier =
            UserAgentClassifier::with_detector(Box::new(FixedFamily("Lynx")), &signatures, 5)
                .unwrap();

        assert_eq!(classifier.signatures_version(), "custom");
        assert_eq!(classifier.classify("Lynx/2.9").category, UserCategory::Browser);
        assert_eq!(classifier.classify("Lynx/2.9 evil").category, UserCategory::Bot);
        assert!(classifier.classify("Lynx").too_short);
    }

    #[test]
    fn test_unknown_signature_overrides_later_layers() {
        let signatures = SignatureSet {
            version: "custom".to_string(),
            bot: vec!["lynx".to_string()],
            programmatic: vec![],
            unknown: vec!["^Lynx/0\\.".to_string()],
            programmatic_families: vec![],
            browser_families: vec!["Lynx".to_string()],
        };
        let classifier =
            UserAgentClassifier::with_detector(Box::new(FixedFamily("Lynx")), &signatures, 5)
                .unwrap();

        assert_eq!(classifier.classify("Lynx/0.9").category, UserCategory::Unknown);
        assert_eq!(classifier.classify("Lynx/2.9").category, UserCategory::Bot);

        let without_unknown = SignatureSet {
            unknown: vec![],
            bot: vec![],
            ..signatures
        };
        let classifier =
            UserAgentClassifier::with_detector(Box::new(FixedFamily("Lynx")), &without_unknown, 5)
                .unwrap();
        assert_eq!(classifier.classify("Lynx/0.9").category, UserCategory::Browser);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = UserAgentClassifier::builtin().unwrap();
        assert_eq!(classifier.classify(CHROME), classifier.classify(CHROME));
    }
}
