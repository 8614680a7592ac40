//! Generic URL extraction and classification.
//!
//! Networks obfuscate the URLs in their responses differently, so text is
//! scanned in three views (raw, HTML-unescaped, backslash-unescaped) plus
//! any VAST markup it carries.  The merged URL set is then classified into
//! advertiser store ids, attribution-partner (MMP) URLs and ad-network
//! URLs.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use percent_encoding::percent_decode_str;
use regex::Regex;
use url::Url;

use adscan_common::domain::top_level_domain;
use adscan_common::error::ScanError;

use crate::lookups::DomainTables;
use crate::markup;

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:https?|intent|market|fybernativebrowser)://[^\s'"<>\])}][^\s'"<>\])}\\;{,]*"#,
    )
    .expect("static regex")
});
static INTENT_DETAILS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"intent://details\?id=([a-zA-Z0-9._]+)").expect("static regex"));
static INTENT_PACKAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"intent://.*package=([a-zA-Z0-9._]+)").expect("static regex"));
static MARKET_DETAILS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"market://details\?id=([a-zA-Z0-9._]+)").expect("static regex"));
static APPSFLYER_APP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"http.*\.appsflyer\.com/([a-zA-Z0-9_.]+)[\?\-]").expect("static regex")
});
static STORE_ID_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._-]+").expect("static regex"));

/// Percent-encoded `]`, `>`, `[`, `<`: everything after them is markup.
const ENCODED_DELIMITERS: &[&str] = &["%5D", "%3E", "%5B", "%3C"];

/// Path fragments of privacy / legal pages, never ad-network evidence.
pub const IGNORE_PRIVACY_URLS: &[&str] = &[
    "/policy.html",
    "/legal",
    "/policy",
    "/privacy",
    "privacy_policy",
    "/your-personal-data",
    "private-policy.html",
    "/privacypolicy",
    "privacy-policy",
    "data-protection",
    "/data-privacy",
];

/// MMP pages that are documentation rather than attribution links.
const IGNORE_MMP_URLS: &[&str] = &["/privacy-policy", "support.appsflyer.com", "/terms-of-use"];

pub(crate) const FYBER_NAVIGATE: &str = "fybernativebrowser://navigate?url=";
const YOUAPPI_CLICK: &str = "youappi.com/v1/e/click";

// ── extraction ───────────────────────────────────────────────────────────

/// Every URL recoverable from `text`, deduplicated.
pub fn extract_urls(text: &str) -> BTreeSet<String> {
    let mut vast: Vec<String> = Vec::new();
    if text.starts_with("<?xml version") {
        if let Some(urls) = markup::vast_urls_lenient(text) {
            vast.extend(urls);
        }
    }
    let lower = text.to_ascii_lowercase();
    if text.trim_start().starts_with('<')
        && (lower.contains("<meta name=\"video_fields\"") || lower.contains("<vast"))
    {
        if let Some(content) = markup::meta_content(text, "video_fields") {
            vast.extend(markup::cdata_sections(&html_escape::decode_html_entities(&content)));
        }
        if lower.contains("<vast") {
            vast.extend(markup::cdata_sections(text));
        }
    }

    let unescaped_html = html_escape::decode_html_entities(text);
    let unescaped_backslash = unescape_backslashes(text);
    let mut found: BTreeSet<&str> = BTreeSet::new();
    found.extend(URL_PATTERN.find_iter(text).map(|m| m.as_str()));
    found.extend(URL_PATTERN.find_iter(&unescaped_html).map(|m| m.as_str()));
    if let Some(view) = &unescaped_backslash {
        found.extend(URL_PATTERN.find_iter(view).map(|m| m.as_str()));
    }

    let mut urls: BTreeSet<String> = found.into_iter().map(clean_url).collect();
    urls.extend(vast.into_iter().map(|u| u.trim().to_string()).filter(|u| !u.is_empty()));
    urls
}

/// Trim at the first encoded bracket delimiter, then percent-decode.
fn clean_url(raw: &str) -> String {
    let upper = raw.to_ascii_uppercase();
    let cut = ENCODED_DELIMITERS
        .iter()
        .filter_map(|d| upper.find(d))
        .min()
        .unwrap_or(raw.len());
    percent_decode_str(&raw[..cut]).decode_utf8_lossy().into_owned()
}

/// Resolve backslash escapes (`\uXXXX`, `\xXX`, `\/`, `\n`, ...).  Returns
/// `None` for a malformed escape, in which case the view is skipped.
fn unescape_backslashes(text: &str) -> Option<String> {
    if !text.contains('\\') {
        return Some(text.to_string());
    }
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'u' => {
                let code = hex_digits(&mut chars, 4)?;
                // Surrogate pairs as produced by JSON encoders.
                if (0xD800..0xDC00).contains(&code) && chars.peek() == Some(&'\\') {
                    let mut look = chars.clone();
                    look.next();
                    if look.next() == Some('u') {
                        if let Some(low) = hex_digits(&mut look, 4).filter(|l| (0xDC00..0xE000).contains(l)) {
                            chars = look;
                            let combined = 0x10000 + ((code - 0xD800) << 10) + (low - 0xDC00);
                            out.push(char::from_u32(combined)?);
                            continue;
                        }
                    }
                }
                out.push(char::from_u32(code).unwrap_or('\u{fffd}'));
            }
            'x' => {
                let code = hex_digits(&mut chars, 2)?;
                out.push(char::from_u32(code)?);
            }
            other => {
                // `\/`, `\"`, `\\` and friends stand for themselves.
                out.push(other);
            }
        }
    }
    Some(out)
}

fn hex_digits(chars: &mut impl Iterator<Item = char>, n: usize) -> Option<u32> {
    let mut value = 0u32;
    for _ in 0..n {
        value = value * 16 + chars.next()?.to_digit(16)?;
    }
    Some(value)
}

/// Click-tracking URLs worth following to their final target: YouAppi
/// click endpoints and Fyber (`tpbid.com`) click URLs, the latter often
/// wrapped in a `fybernativebrowser://` navigation link.
pub fn click_urls(urls: &BTreeSet<String>) -> Vec<String> {
    urls.iter()
        .filter_map(|u| {
            if u.contains(YOUAPPI_CLICK) {
                Some(u.clone())
            } else if u.contains("tpbid.com") && u.contains("/click") {
                Some(u.replace(FYBER_NAVIGATE, ""))
            } else {
                None
            }
        })
        .collect()
}

// ── classification ───────────────────────────────────────────────────────

/// Advertiser evidence found in a URL set, before the ambiguity check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlFindings {
    pub advertiser_ids: BTreeSet<String>,
    pub mmp_urls: BTreeSet<String>,
    pub ad_network_urls: BTreeSet<String>,
}

impl UrlFindings {
    pub fn ad_network_tlds(&self) -> BTreeSet<String> {
        self.ad_network_urls
            .iter()
            .filter_map(|u| top_level_domain(u))
            .collect()
    }

    /// Collapse to a single advertiser id.
    ///
    /// The publisher's own id is dropped when other ids are present (apps
    /// advertise themselves in their own UI); when it is the only id it is
    /// kept so the caller can flag self-attribution.
    pub fn advertiser(&self, publisher_store_id: &str) -> Result<Option<String>, ScanError> {
        let others: Vec<&String> = self
            .advertiser_ids
            .iter()
            .filter(|id| id.as_str() != publisher_store_id)
            .collect();
        match others.as_slice() {
            [] => Ok(self.advertiser_ids.iter().next().cloned()),
            [only] => Ok(Some((*only).clone())),
            many => Err(ScanError::AmbiguousAttribution {
                ids: many.iter().map(|s| s.to_string()).collect(),
            }),
        }
    }
}

/// Classify every URL against the known-domain tables.
pub fn classify_urls<'u>(urls: impl IntoIterator<Item = &'u String>, domains: &DomainTables) -> UrlFindings {
    let mut findings = UrlFindings::default();
    for url in urls {
        classify_one(url, domains, &mut findings);
    }
    findings
}

fn classify_one(url: &str, domains: &DomainTables, findings: &mut UrlFindings) {
    let tld = top_level_domain(url).unwrap_or_default();
    let lower = url.to_ascii_lowercase();
    let is_mmp = !tld.is_empty() && domains.is_mmp(&tld);

    if is_mmp {
        if IGNORE_MMP_URLS.iter().any(|x| lower.contains(x)) {
            return;
        }
        findings.mmp_urls.insert(url.to_string());
        if url.contains("websdk.appsflyer.com") {
            return;
        }
        if tld.contains("appsflyer.com") {
            if let Some(c) = APPSFLYER_APP.captures(url) {
                findings.advertiser_ids.insert(c[1].to_string());
            }
        }
    } else if let Some(c) = INTENT_DETAILS.captures(url) {
        findings.advertiser_ids.insert(c[1].to_string());
    } else if let Some(c) = INTENT_PACKAGE.captures(url) {
        findings.advertiser_ids.insert(c[1].to_string());
    } else if let Some(c) = MARKET_DETAILS.captures(url) {
        findings.advertiser_ids.insert(c[1].to_string());
    } else if url.contains("play.google.com") && tld.contains("google.com") {
        if url.contains("apps/developer?") {
            return;
        }
        if let Some(id) = store_id_from_play_url(url) {
            findings.advertiser_ids.insert(id);
        }
    } else if url.contains("fybernativebrowser://") {
        findings.ad_network_urls.insert(url.replace(FYBER_NAVIGATE, ""));
    }

    if !tld.is_empty()
        && domains.is_ad_domain(&tld)
        && !is_mmp
        && !IGNORE_PRIVACY_URLS.iter().any(|x| lower.contains(x))
    {
        findings.ad_network_urls.insert(url.to_string());
    }
}

/// Store id from a Play Store web URL's `id` query parameter.
pub fn store_id_from_play_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let (_, raw) = parsed.query_pairs().find(|(k, _)| k == "id")?;
    let id = STORE_ID_PREFIX.find(&raw)?.as_str();
    let id = id.trim_end_matches(|c: char| "!@#$%^&*()+=[]{}|\\:;\"'<>?,/".contains(c));
    (!id.is_empty()).then(|| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> DomainTables {
        DomainTables::new(
            ["vungle.com", "tpbid.com", "doubleclick.net", "adjust.com"],
            ["adjust.com", "appsflyer.com", "kochava.com"],
        )
    }

    #[test]
    fn test_extract_market_url_anywhere() {
        let urls = extract_urls(r#"{"link":"market://details?id=com.foo.bar&referrer=xyz"}"#);
        let found = classify_urls(&urls, &tables());
        assert_eq!(found.advertiser("com.pub").unwrap().as_deref(), Some("com.foo.bar"));
    }

    #[test]
    fn test_extract_three_views() {
        let text = r#"a https://one.example.com/a?b=1&amp;c=2 "https:\/\/two.example.com\/x&y=1" <https://three.example.com/p%5Bjunk>"#;
        let urls = extract_urls(text);
        assert!(urls.contains("https://one.example.com/a?b=1&c=2"));
        assert!(urls.contains("https://two.example.com/x&y=1"));
        assert!(urls.contains("https://three.example.com/p"));
    }

    #[test]
    fn test_extract_vast_document() {
        let xml = r#"<?xml version="1.0"?><VAST><Ad><InLine><Impression><![CDATA[https://imp.example.com/i]]></Impression></InLine></Ad></VAST>"#;
        let urls = extract_urls(xml);
        assert!(urls.contains("https://imp.example.com/i"));
    }

    #[test]
    fn test_percent_decoding() {
        let urls = extract_urls("see https://app.adjust.com/abc%3Fx%3D1 now");
        assert!(urls.contains("https://app.adjust.com/abc?x=1"));
    }

    #[test]
    fn test_malformed_backslash_escape_skips_view() {
        assert_eq!(unescape_backslashes(r"bad \u12"), None);
        assert_eq!(unescape_backslashes(r"a\/b").as_deref(), Some("a/b"));
        assert_eq!(unescape_backslashes(r"\ud83d\ude00").as_deref(), Some("\u{1F600}"));
        // The other views still yield URLs.
        let urls = extract_urls(r"https://x.example.com/a \u12");
        assert!(urls.contains("https://x.example.com/a"));
    }

    #[test]
    fn test_classify_rules() {
        let urls: BTreeSet<String> = [
            "https://app.adjust.com/abc?campaign=1",
            "https://www.adjust.com/privacy-policy",
            "https://app.appsflyer.com/com.adv.game?pid=x",
            "https://play.google.com/store/apps/details?id=com.adv.game&hl=en",
            "https://play.google.com/store/apps/developer?id=Some+Dev",
            "https://ads.vungle.com/impression",
            "https://ads.vungle.com/privacy",
            "fybernativebrowser://navigate?url=https://gotu.tpbid.com/click?x=1",
            "https://unrelated.example.com/",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        let found = classify_urls(&urls, &tables());
        assert_eq!(found.mmp_urls.len(), 2);
        assert!(found.mmp_urls.contains("https://app.adjust.com/abc?campaign=1"));
        assert_eq!(
            found.advertiser_ids.iter().collect::<Vec<_>>(),
            vec!["com.adv.game"]
        );
        assert!(found.ad_network_urls.contains("https://ads.vungle.com/impression"));
        assert!(!found.ad_network_urls.contains("https://ads.vungle.com/privacy"));
        assert!(found.ad_network_urls.contains("https://gotu.tpbid.com/click?x=1"));
        assert_eq!(
            found.ad_network_tlds(),
            ["tpbid.com", "vungle.com"].into_iter().map(String::from).collect()
        );
    }

    #[test]
    fn test_intent_urls() {
        let urls: BTreeSet<String> = [
            "intent://details?id=com.a.b#Intent;scheme=market;end",
            "intent://open#Intent;package=com.a.b;end",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        let found = classify_urls(&urls, &tables());
        assert_eq!(found.advertiser_ids.len(), 1);
    }

    #[test]
    fn test_advertiser_ambiguity_and_publisher_filtering() {
        let mut f = UrlFindings::default();
        f.advertiser_ids.insert("com.pub".into());
        assert_eq!(f.advertiser("com.pub").unwrap().as_deref(), Some("com.pub"));

        f.advertiser_ids.insert("com.adv".into());
        assert_eq!(f.advertiser("com.pub").unwrap().as_deref(), Some("com.adv"));

        f.advertiser_ids.insert("com.other".into());
        assert!(matches!(
            f.advertiser("com.pub"),
            Err(ScanError::AmbiguousAttribution { .. })
        ));
    }

    #[test]
    fn test_click_urls() {
        let urls: BTreeSet<String> = [
            "fybernativebrowser://navigate?url=https://gotu.tpbid.com/click?a=1",
            "https://api.youappi.com/v1/e/click?c=1",
            "https://t.example.com/click/123",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        let clicks = click_urls(&urls);
        assert_eq!(clicks.len(), 2);
        assert!(clicks.contains(&"https://gotu.tpbid.com/click?a=1".to_string()));
    }

    #[test]
    fn test_play_url_id_cleanup() {
        assert_eq!(
            store_id_from_play_url("https://play.google.com/store/apps/details?id=com.x.y)&hl=en").as_deref(),
            Some("com.x.y")
        );
        assert_eq!(store_id_from_play_url("https://play.google.com/store/apps"), None);
    }
}
