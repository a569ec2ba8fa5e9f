//! Versioned user-agent signature tables
//!
//! A [`SignatureSet`] is the single value that decides how agents are
//! categorised: regex groups for bots, programmatic clients and unknown agents,
//! plus family allow-lists for programmatic tools and browsers. It is built
//! once (built-in defaults, optionally replaced from a TOML or JSON file and
//! extended with a crawler feed), compiled, and shared by every worker.
//!
//! # File format
//!
//! ```toml
//! version = "2024-02"
//! bot = ["bot", "crawler", "spider"]
//! programmatic = ["python", "^curl"]
//! unknown = ['^\-$']
//! programmatic_families = ["Python Requests", "curl"]
//! browser_families = ["Chrome", "Firefox"]
//! ```

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{IngestError, Result};

/// Compiled size limit for the combined pattern groups; the bot group grows to
/// several hundred alternatives once the crawler feed is merged in
const PATTERN_SIZE_LIMIT: usize = 64 * 1024 * 1024;

const BUILTIN_VERSION: &str = "builtin-1";

const BUILTIN_BOT: &[&str] = &[
    r"bot", r"crawler", r"monitor", r"the\sknowledge\sai", r"searchhelper", r"winhttp",
    r"scraper", r"skyline", r"nucpred", r"arachni", r"siteuptime", r"microsoft\soffice",
    r"riddler", r"validator", r"feedfetcher\-google", r"mediapartners\-google",
    r"apis\-google", r"slurp", r"httpunit", r"nutch", r"phpcrawl", r"biglotron", r"teoma",
    r"convera", r"gigablast", r"ia_archiver", r"webmon\s", r"httrack", r"grub\.org",
    r"netresearchserver", r"speedy", r"fluffy", r"findlink", r"panscient", r"ips\-agent",
    r"yanga", r"yandeximages", r"yandexmetrika", r"yandexturbo", r"yandeximageresizer",
    r"yandexvideo", r"yandexadnet", r"yandexblogs", r"yandexcalendar", r"yandexdirect",
    r"yandexfavicons", r"yadirectfetcher", r"yandexfordomain", r"yandexmarket", r"yandexmedia",
    r"yandexnews", r"yandexontodb", r"yandexpagechecker", r"yandexpartner", r"yandexrca",
    r"yandexsearchshop", r"yandexsitelinks", r"yandextracker", r"yandexvertis",
    r"yandexverticals", r"yandexwebmaster", r"cyberpatrol", r"baiduspider", r"postrank",
    r"page2rss", r"linkdex", r"ezooms", r"heritrix", r"findthatfile", r"europarchive\.org",
    r"mappydata", r"eright", r"apercite", r"aboundex", r"summify", r"ec2linkfinder",
    r"facebookexternalhit", r"yeti", r"retrevopageanalyzer", r"lb\-spider", r"sogou",
    r"wotbox", r"ichiro", r"drupact", r"openindexspider", r"gnam\sgnam\sspider", r"coccoc",
    r"integromedb", r"siteexplorer\.info", r"proximic", r"changedetection", r"wesee:search",
    r"360spider", r"cc\smetadata\sscaper", r"g00g1e\.net", r"binlar", r"a6\-indexer",
    r"admantx", r"megaindex", r"ltx71", r"bubing", r"qwantify", r"lipperhey", r"y\!j",
    r"addthis", r"screaming\sfrog\sseo\sspider", r"metauri", r"scrapy", r"livelap[bb]ot",
    r"capsulechecker", r"collection@infegy", r"deusu", r"sonic", r"sysomos", r"trove",
    r"deadlinkchecker", r"slack\-imgproxy", r"embedly", r"iskanie", r"skypeuripreview",
    r"google\-adwords\-instant", r"whatsapp", r"electricmonk", r"bingpreview",
    r"yahoo\slink\spreview", r"daum", r"xenu\slink\ssleuth", r"pcore\-http", r"pingdom",
    r"appinsights", r"phantomjs", r"jetslide", r"newsharecounts", r"bark[rr]owler", r"tineye",
    r"linkarchiver", r"yak", r"digg\sdeeper", r"dcrawl", r"snacktory", r"ning", r"nuzzel",
    r"omgili", r"pocketparser", r"yisouspider", r"um\-ln", r"toutiaospider", r"muckrack",
    r"jamie's\sspider", r"ahc", r"netcraftsurveyagent", r"appengine\-google", r"jetty",
    r"upflow", r"thinklab", r"traackr", r"twurly", r"mastodon", r"http_get", r"brandverity",
    r"check_http", r"ezid", r"lcc\s", r"buck", r"genieo", r"meltwaternews", r"moreover",
    r"newspaper", r"scoutjet", r"sentry", r"seoscanners", r"hatena", r"google\sweb\spreview",
    r"adscanner", r"netvibes", r"baidu\-yunguance", r"btwebclient", r"disqus", r"feedly",
    r"fetch", r"fever", r"flamingo_searchengine", r"flipboardproxy", r"g2\sweb\sservices",
    r"landau\-media\-spider", r"vkshare", r"siteimprove", r"dareboost", r"miniflux",
    r"feedspot", r"seokicks", r"tracemyfile", r"zgrab", r"pr\-cy\.ru", r"datafeedwatch",
    r"zabbix", r"google\-xrawler", r"axios", r"amazon\scloudfront", r"pulsepoint",
    r"cloudflare\-alwaysonline", r"google\-structured\-data\-testing\-tool",
    r"wordupinfosearch", r"webdatastats", r"httpurlconnection", r"outbrain", r"w3c\-checklink",
    r"w3c\-mobileok", r"w3c_i18n\-checker", r"w3c_unicorn", r"google\-physicalweb",
    r"blackboard", r"bazqux", r"twingly", r"rivva", r"dataprovider", r"grouphigh",
    r"theoldreader", r"anyevent", r"nmap\sscripting\sengine", r"2ip\.ru", r"clickagy",
    r"google\sfavicon", r"hubspot", r"chrome\-lighthouse", r"headlesschrome",
    r"checkmarknetwork", r"uptime", r"mixnodecache", r"fedoraplanet", r"friendica",
    r"nextcloud", r"tiny\stiny\srss", r"bytespider", r"datanyze",
    r"google\-site\-verification", r"trendsmapresolver", r"tweetedtimes", r"gwene",
    r"simplepie", r"searchatlas", r"superfeedr", r"domains\sproject", r"pandalytics",
    r"pagepeeker", r"vigil", r"seewithkids", r"blogtraffic\d\.\d+\sfeed\-fetcher", r"cincraw",
    r"freshrss", r"php\-curl\-class",
];

const BUILTIN_PROGRAMMATIC: &[&str] = &[
    r"wget",
    r"python",
    r"perl",
    r"go\-http\-client",
    r"apache\-httpclient",
    r"^curl",
];

const BUILTIN_UNKNOWN: &[&str] = &[r"^\-$"];

const BUILTIN_PROGRAMMATIC_FAMILIES: &[&str] = &[
    "Python Requests",
    "Python-urllib",
    "Wget",
    "Apache-HttpClient",
    "libwww-perl",
    "curl",
    "Java",
    "Go-http-client",
    "okhttp",
];

const BUILTIN_BROWSER_FAMILIES: &[&str] = &[
    "Chrome",
    "IE",
    "Firefox",
    "Opera",
    "Safari",
    "QQ Browser",
    "Edge",
    "Netscape",
    "Mobile Safari",
    "Sogou Explorer",
    "Chrome Mobile",
    "UC Browser",
    "Chromium",
    "Samsung Internet",
    "Chrome Mobile iOS",
    "Chrome Mobile WebView",
    "Yandex Browser",
    "Thunderbird",
    "Camino",
    "Firefox Mobile",
    "Firefox iOS",
    "Vivaldi",
    "Opera Mobile",
    "Opera Mini",
];

fn owned(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|p| p.to_string()).collect()
}

/// Named, versioned groups of agent signatures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureSet {
    pub version: String,
    #[serde(default)]
    pub bot: Vec<String>,
    #[serde(default)]
    pub programmatic: Vec<String>,
    #[serde(default)]
    pub unknown: Vec<String>,
    #[serde(default)]
    pub programmatic_families: Vec<String>,
    #[serde(default)]
    pub browser_families: Vec<String>,
}

impl Default for SignatureSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SignatureSet {
    /// The signature tables shipped with the binary
    pub fn builtin() -> Self {
        Self {
            version: BUILTIN_VERSION.to_string(),
            bot: owned(BUILTIN_BOT),
            programmatic: owned(BUILTIN_PROGRAMMATIC),
            unknown: owned(BUILTIN_UNKNOWN),
            programmatic_families: owned(BUILTIN_PROGRAMMATIC_FAMILIES),
            browser_families: owned(BUILTIN_BROWSER_FAMILIES),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Load a signature file, choosing the format from the extension
    ///
    /// `.json` files are read as JSON, everything else as TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| IngestError::unreadable(path, e))?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let set = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_toml_str(&content)?
        };
        set.compile()?;
        Ok(set)
    }

    /// Merge crawler feed patterns into the bot group
    ///
    /// Each pattern is passed through [`sanitize_feed_pattern`]. Patterns that
    /// the current tables already cover are dropped. The version is tagged
    /// with the number of patterns added.
    pub fn with_feed_patterns(mut self, patterns: &[String]) -> Result<Self> {
        let compiled = self.compile()?;
        let mut seen: HashSet<String> = self.bot.iter().cloned().collect();
        let mut added = 0usize;

        for pattern in patterns {
            if let Some(clean) = sanitize_feed_pattern(pattern, &compiled) {
                if seen.insert(clean.clone()) {
                    self.bot.push(clean);
                    added += 1;
                }
            }
        }

        if added > 0 {
            self.version = format!("{}+feed.{}", self.version, added);
        }
        Ok(self)
    }

    /// The combined bot alternation, e.g. `(bot|crawler|...)`
    pub fn bot_pattern(&self) -> String {
        combine_patterns(&self.bot)
    }

    pub fn compile(&self) -> Result<CompiledSignatures> {
        Ok(CompiledSignatures {
            version: self.version.clone(),
            bot: compile_group(&self.bot)?,
            programmatic: compile_group(&self.programmatic)?,
            unknown: compile_group(&self.unknown)?,
            programmatic_families: self.programmatic_families.iter().cloned().collect(),
            browser_families: self.browser_families.iter().cloned().collect(),
        })
    }
}

/// A [`SignatureSet`] ready for matching
#[derive(Debug, Clone)]
pub struct CompiledSignatures {
    version: String,
    bot: Option<Regex>,
    programmatic: Option<Regex>,
    unknown: Option<Regex>,
    programmatic_families: HashSet<String>,
    browser_families: HashSet<String>,
}

impl CompiledSignatures {
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_bot(&self, agent: &str) -> bool {
        matches_group(self.bot.as_ref(), agent)
    }

    pub fn is_programmatic_agent(&self, agent: &str) -> bool {
        matches_group(self.programmatic.as_ref(), agent)
    }

    pub fn is_unknown_agent(&self, agent: &str) -> bool {
        matches_group(self.unknown.as_ref(), agent)
    }

    pub fn is_programmatic_family(&self, family: &str) -> bool {
        self.programmatic_families.contains(family)
    }

    pub fn is_browser_family(&self, family: &str) -> bool {
        self.browser_families.contains(family)
    }
}

fn matches_group(group: Option<&Regex>, text: &str) -> bool {
    group.is_some_and(|re| re.is_match(text))
}

fn combine_patterns(patterns: &[String]) -> String {
    format!("({})", patterns.join("|"))
}

/// An empty group matches nothing
fn compile_group(patterns: &[String]) -> Result<Option<Regex>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let re = RegexBuilder::new(&combine_patterns(patterns))
        .case_insensitive(true)
        .size_limit(PATTERN_SIZE_LIMIT)
        .dfa_size_limit(PATTERN_SIZE_LIMIT)
        .build()?;
    Ok(Some(re))
}

/// Normalise one crawler feed pattern for the bot group
///
/// Returns `None` when the pattern is already covered by `known` or nothing
/// is left after cleaning. Feed patterns are written for other regex
/// dialects, so anchors, host prefixes and domain suffixes are stripped to
/// keep the substring that identifies the crawler. A pattern that still does
/// not compile is matched literally.
pub fn sanitize_feed_pattern(pattern: &str, known: &CompiledSignatures) -> Option<String> {
    let pattern = pattern.trim().to_lowercase();
    if pattern.is_empty()
        || known.is_bot(&pattern)
        || known.is_programmatic_agent(&pattern)
        || known.is_unknown_agent(&pattern)
    {
        return None;
    }

    let mut clean = pattern
        .replace(r"\/", "")
        .replace("(^| )", "")
        .replace('^', "")
        .replace(r"www\.", "")
        .replace("www.", "");

    for suffix in [r"\.com", ".com"] {
        if let Some(idx) = clean.find(suffix) {
            clean.truncate(idx);
        }
    }

    let escaped = escape_bare(&clean);
    let clean = escaped.trim_end_matches('\\');

    if clean.is_empty() {
        return None;
    }

    if Regex::new(clean).is_ok() {
        Some(clean.to_string())
    } else {
        Some(regex::escape(&pattern))
    }
}

/// Escape unescaped `-`, `.` and `!`, and turn spaces into `\s`
fn escape_bare(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut escaped = false;

    for c in pattern.chars() {
        if escaped {
            out.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => {
                out.push(c);
                escaped = true;
            },
            '-' | '.' | '!' => {
                out.push('\\');
                out.push(c);
            },
            ' ' => out.push_str(r"\s"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_compiles() {
        let compiled = SignatureSet::builtin().compile().unwrap();
        assert_eq!(compiled.version(), BUILTIN_VERSION);
        assert!(compiled.is_bot("Googlebot/2.1 (+http://www.google.com/bot.html)"));
        assert!(compiled.is_bot("Mozilla/5.0 (compatible; YandexImages/3.0)"));
        assert!(compiled.is_programmatic_agent("python-requests/2.28.1"));
        assert!(compiled.is_programmatic_agent("curl/8.4.0"));
        assert!(compiled.is_unknown_agent("-"));
        assert!(compiled.is_browser_family("Chrome"));
        assert!(compiled.is_programmatic_family("Python Requests"));
    }

    #[test]
    fn test_builtin_bot_group_spares_common_browsers() {
        let compiled = SignatureSet::builtin().compile().unwrap();
        for agent in [
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/118.0",
            "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1",
        ] {
            assert!(!compiled.is_bot(agent), "{agent}");
        }
    }

    #[test]
    fn test_wget_and_okhttp_are_not_bots() {
        let compiled = SignatureSet::builtin().compile().unwrap();
        assert!(!compiled.is_bot("Wget/1.21.4"));
        assert!(!compiled.is_bot("okhttp/4.12.0"));
    }

    #[test]
    fn test_load_toml_and_json() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("signatures.toml");
        std::fs::write(
            &toml_path,
            r#"
version = "test-1"
bot = ["spider"]
unknown = ['^\-$']
browser_families = ["Chrome"]
"#,
        )
        .unwrap();
        let set = SignatureSet::load(&toml_path).unwrap();
        assert_eq!(set.version, "test-1");
        assert_eq!(set.bot, vec!["spider".to_string()]);
        assert!(set.programmatic.is_empty());

        let json_path = dir.path().join("signatures.json");
        std::fs::write(
            &json_path,
            r#"{"version": "test-2", "bot": ["crawler"], "programmatic_families": ["curl"]}"#,
        )
        .unwrap();
        let set = SignatureSet::load(&json_path).unwrap();
        assert_eq!(set.version, "test-2");
        assert!(set.compile().unwrap().is_programmatic_family("curl"));
    }

    #[test]
    fn test_load_rejects_invalid_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "version = \"x\"\nbot = [\"(unclosed\"]\n").unwrap();
        assert!(matches!(SignatureSet::load(&path), Err(IngestError::Pattern(_))));
    }

    #[test]
    fn test_empty_group_matches_nothing() {
        let set = SignatureSet {
            version: "empty".to_string(),
            bot: vec![],
            programmatic: vec![],
            unknown: vec![],
            programmatic_families: vec![],
            browser_families: vec![],
        };
        let compiled = set.compile().unwrap();
        assert!(!compiled.is_bot(""));
        assert!(!compiled.is_unknown_agent("-"));
    }

    #[test]
    fn test_sanitize_drops_covered_patterns() {
        let known = SignatureSet::builtin().compile().unwrap();
        assert_eq!(sanitize_feed_pattern("Googlebot\\/", &known), None);
        assert_eq!(sanitize_feed_pattern("python-urllib", &known), None);
        assert_eq!(sanitize_feed_pattern("", &known), None);
    }

    #[test]
    fn test_sanitize_cleans_feed_dialect() {
        let known = SignatureSet::builtin().compile().unwrap();
        assert_eq!(sanitize_feed_pattern("^Zeus", &known).as_deref(), Some("zeus"));
        assert_eq!(
            sanitize_feed_pattern("Screaming Frog", &known).as_deref(),
            Some(r"screaming\sfrog")
        );
        assert_eq!(
            sanitize_feed_pattern("www.example.com/info", &known).as_deref(),
            Some("example")
        );
        assert_eq!(
            sanitize_feed_pattern("acme-agent2", &known).as_deref(),
            Some(r"acme\-agent2")
        );
        assert_eq!(sanitize_feed_pattern(r"Y\.J", &known).as_deref(), Some(r"y\.j"));
    }

    #[test]
    fn test_sanitize_falls_back_to_literal() {
        let known = SignatureSet::builtin().compile().unwrap();
        let clean = sanitize_feed_pattern("weird(agent", &known).unwrap();
        assert_eq!(clean, r"weird\(agent");
        assert!(Regex::new(&clean).unwrap().is_match("weird(agent"));
    }

    #[test]
    fn test_with_feed_patterns_extends_bot_group() {
        let feed = vec![
            "Zeus".to_string(),
            "zeus".to_string(),
            "Googlebot".to_string(),
        ];
        let set = SignatureSet::builtin().with_feed_patterns(&feed).unwrap();
        assert_eq!(set.version, format!("{BUILTIN_VERSION}+feed.1"));
        assert_eq!(set.bot.last().map(String::as_str), Some("zeus"));
        assert!(set.compile().unwrap().is_bot("Zeus 32297 Webster Pro V2.9 Win32"));
        assert!(set.bot_pattern().starts_with("(bot|crawler|"));
    }
}
