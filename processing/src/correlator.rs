//! Correlator – finds the exchange that ordered a creative.
//!
//! The creative's URL yields a network-specific content id via a rule
//! table; the source is a prior exchange whose response text mentions that
//! id.  The rule table is configuration data and may be replaced by a TOML
//! file:
//!
//! ```toml
//! [[rule]]
//! tld = "2mdn"
//! url_contains = "/id/"
//! extract = { kind = "path_after", marker = "/id/" }
//!
//! [[rule]]
//! tld = "adcolony.com"
//! exact = true
//! extract = { kind = "url_segment", from_end = 2, min_len = 10 }
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use adscan_common::exchange::ExchangeRecord;

/// Ids that name page furniture rather than ad creatives.
pub const IGNORED_CONTENT_IDS: &[&str] = &["privacy", "google_play_icon_grey_2022", "favicon"];

/// Shorter ids match too many unrelated responses to be searched.
pub const MIN_CONTENT_ID_LEN: usize = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct ContentIdRules {
    #[serde(rename = "rule", default)]
    pub rules: Vec<ContentIdRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentIdRule {
    /// Matched against the creative host's registrable domain.
    pub tld: String,
    /// Require equality instead of substring match.
    #[serde(default)]
    pub exact: bool,
    #[serde(default)]
    pub url_contains: Option<String>,
    pub extract: Extract,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Extract {
    /// First path segment after `marker`.
    PathAfter { marker: String },
    /// Named query parameter.
    QueryParam { name: String },
    /// `from_end`-th segment of the whole URL split on `/` (1 = last).
    /// Falls back to the last segment when shorter than `min_len`.
    UrlSegment {
        from_end: usize,
        #[serde(default)]
        min_len: Option<usize>,
    },
    /// Last URL segment up to its first `.`.
    SegmentStem,
    /// Last segment of the URL path.
    LastPathSegment,
}

impl ContentIdRule {
    fn new(tld: &str, exact: bool, url_contains: Option<&str>, extract: Extract) -> Self {
        Self {
            tld: tld.to_string(),
            exact,
            url_contains: url_contains.map(str::to_string),
            extract,
        }
    }

    fn matches(&self, tld: &str, url: &str) -> bool {
        let tld_ok = if self.exact {
            tld == self.tld
        } else {
            tld.contains(&self.tld)
        };
        tld_ok && self.url_contains.as_deref().is_none_or(|s| url.contains(s))
    }
}

impl Default for ContentIdRules {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ContentIdRules {
    /// Rules observed across the supported networks.  Order matters: the
    /// first matching rule wins, unmatched hosts use the last path segment.
    pub fn builtin() -> Self {
        let rules = vec![
            ContentIdRule::new("2mdn", false, Some("/id/"), Extract::PathAfter { marker: "/id/".into() }),
            ContentIdRule::new("2mdn", false, Some("simgad"), Extract::UrlSegment { from_end: 1, min_len: None }),
            ContentIdRule::new("2mdn", false, None, Extract::LastPathSegment),
            ContentIdRule::new("googlevideo", false, None, Extract::QueryParam { name: "ei".into() }),
            // The file name is the quality level; the directory is the id.
            ContentIdRule::new(
                "unity3dusercontent.com",
                true,
                None,
                Extract::UrlSegment { from_end: 2, min_len: None },
            ),
            ContentIdRule::new(
                "adcolony.com",
                true,
                None,
                Extract::UrlSegment { from_end: 2, min_len: Some(10) },
            ),
            ContentIdRule::new("bigabidserv.com", false, None, Extract::SegmentStem),
            // /id123/orig
            ContentIdRule::new("yandex.net", false, None, Extract::UrlSegment { from_end: 2, min_len: None }),
        ];
        Self { rules }
    }

    /// Load a rule table from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read content-id rules: {}", path.display()))?;
        let rules: ContentIdRules = toml::from_str(&text)
            .with_context(|| format!("Invalid content-id rules: {}", path.display()))?;
        info!("Loaded {} content-id rules from {}", rules.rules.len(), path.display());
        Ok(rules)
    }

    /// Content id of a creative, if its URL has the expected shape.
    pub fn content_id(&self, record: &ExchangeRecord) -> Option<String> {
        let tld = record.tld_str();
        let extract = self
            .rules
            .iter()
            .find(|r| r.matches(tld, &record.url))
            .map(|r| &r.extract)
            .unwrap_or(&Extract::LastPathSegment);
        apply(extract, &record.url).filter(|id| !id.is_empty())
    }
}

fn apply(extract: &Extract, url: &str) -> Option<String> {
    match extract {
        Extract::PathAfter { marker } => {
            let path = url_path(url)?;
            let (_, after) = path.split_once(marker.as_str())?;
            after.split('/').next().map(str::to_string)
        }
        Extract::QueryParam { name } => Url::parse(url)
            .ok()?
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned()),
        Extract::UrlSegment { from_end, min_len } => {
            let id = url_segment(url, *from_end)?;
            match min_len {
                Some(min) if id.len() < *min => url_segment(url, 1),
                _ => Some(id),
            }
        }
        Extract::SegmentStem => {
            let last = url_segment(url, 1)?;
            Some(last.split('.').next().unwrap_or_default().to_string())
        }
        Extract::LastPathSegment => url_path(url)?.rsplit('/').next().map(str::to_string),
    }
}

fn url_path(url: &str) -> Option<String> {
    Url::parse(url).ok().map(|u| u.path().to_string())
}

fn url_segment(url: &str, from_end: usize) -> Option<String> {
    let parts: Vec<&str> = url.split('/').collect();
    let idx = parts.len().checked_sub(from_end)?;
    parts.get(idx).map(|s| s.to_string())
}

// ── source search ────────────────────────────────────────────────────────

/// A correlated source exchange together with its decoded response text.
#[derive(Debug, Clone, Copy)]
pub struct Source<'a> {
    pub record: &'a ExchangeRecord,
    pub text: &'a str,
}

/// Searches a run's exchanges for the one that referenced a creative.
///
/// `texts[i]` is the response text of `records[i]` (cipher payloads already
/// decoded).
pub struct Correlator<'a> {
    records: &'a [ExchangeRecord],
    texts: &'a [String],
}

impl<'a> Correlator<'a> {
    pub fn new(records: &'a [ExchangeRecord], texts: &'a [String]) -> Self {
        debug_assert_eq!(records.len(), texts.len());
        Self { records, texts }
    }

    /// Most recent exchange at or before the creative whose response
    /// mentions `content_id`; any mentioning exchange otherwise.
    pub fn correlate(&self, creative: &ExchangeRecord, content_id: &str) -> Option<Source<'a>> {
        let matches: Vec<usize> = self
            .records
            .iter()
            .zip(self.texts)
            .enumerate()
            .filter(|(_, (r, t))| r.id != creative.id && t.contains(content_id))
            .map(|(i, _)| i)
            .collect();
        if matches.len() > 1 {
            debug!("Multiple responses mention content_id={content_id} ({})", matches.len());
        }
        let chosen = matches
            .iter()
            .copied()
            .filter(|&i| self.records[i].start_time <= creative.start_time)
            .max_by_key(|&i| self.records[i].start_time)
            .or_else(|| matches.first().copied())?;
        Some(Source {
            record: &self.records[chosen],
            text: &self.texts[chosen],
        })
    }
}
