//! Creative classifier – decides which response bodies are ad creatives.

use std::sync::LazyLock;

use regex::Regex;

use adscan_common::config::Config;
use adscan_common::exchange::ExchangeRecord;

static CREATIVE_MIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:image|video)/(?:jpeg|jpg|png|gif|webp|webm|mp4|mpeg|avi|quicktime)\b")
        .expect("static regex")
});

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Content-Length mismatch tolerated before a body counts as truncated.
const SIZE_ABS_TOLERANCE: u64 = 1024;
const SIZE_PCT_TOLERANCE: f64 = 0.03;

/// An exchange flagged as a creative, enriched as it moves through a run.
#[derive(Debug, Clone)]
pub struct CreativeCandidate<'a> {
    pub record: &'a ExchangeRecord,
    pub file_extension: String,
    /// Network-specific content identifier, set by the correlator.
    pub content_id: Option<String>,
    pub md5_hash: Option<String>,
    pub phash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Classifier {
    min_bytes: u64,
    icon_cdn_domains: Vec<String>,
}

impl Classifier {
    pub fn new(min_bytes: u64, icon_cdn_domains: Vec<String>) -> Self {
        Self {
            min_bytes,
            icon_cdn_domains,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.min_creative_bytes, config.icon_cdn_domains.clone())
    }

    pub fn is_creative(&self, record: &ExchangeRecord) -> bool {
        if record.status != Some(200) {
            return false;
        }
        let Some(body) = record.response_body.as_deref() else {
            return false;
        };
        let mime_ok = record
            .response_mime
            .as_deref()
            .is_some_and(|m| CREATIVE_MIME.is_match(m));
        if !mime_ok || record.response_size <= self.min_bytes {
            return false;
        }
        if let Some(announced) = record.content_length() {
            if is_truncated(announced, record.response_size) {
                return false;
            }
        }
        !(self.is_icon_cdn(record) && is_square_png(body))
    }

    fn is_icon_cdn(&self, record: &ExchangeRecord) -> bool {
        record
            .tld
            .as_deref()
            .is_some_and(|t| self.icon_cdn_domains.iter().any(|d| d == t))
    }

    /// Flag every creative in the run, in capture order.
    pub fn find_creatives<'a>(&self, records: &'a [ExchangeRecord]) -> Vec<CreativeCandidate<'a>> {
        records
            .iter()
            .filter(|r| self.is_creative(r))
            .map(|record| CreativeCandidate {
                record,
                file_extension: file_extension(record),
                content_id: None,
                md5_hash: None,
                phash: None,
            })
            .collect()
    }
}

fn is_truncated(announced: u64, actual: u64) -> bool {
    let diff = announced.abs_diff(actual);
    if diff <= SIZE_ABS_TOLERANCE {
        return false;
    }
    announced == 0 || diff as f64 / announced as f64 > SIZE_PCT_TOLERANCE
}

fn is_square_png(body: &[u8]) -> bool {
    if !body.starts_with(PNG_MAGIC) || body.len() < 24 {
        return false;
    }
    body[16..20] == body[20..24]
}

/// Extension from the URL's last path segment, or the mime subtype when the
/// suffix is missing or longer than four characters.
pub fn file_extension(record: &ExchangeRecord) -> String {
    let path = record
        .url
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let last = path.rsplit('/').next().unwrap_or_default();
    if let Some((_, ext)) = last.rsplit_once('.') {
        if !ext.is_empty() && ext.len() <= 4 {
            return ext.to_ascii_lowercase();
        }
    }
    record
        .response_mime
        .as_deref()
        .and_then(|m| m.split(';').next())
        .and_then(|m| m.split_once('/'))
        .map(|(_, sub)| sub.trim().to_ascii_lowercase())
        .unwrap_or_else(|| "bin".to_string())
}
