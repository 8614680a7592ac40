//! Configuration parsing – reads a KEY=VALUE file (`adscan.conf`).
//!
//! The same file is shared by every worker; each ignores fields it does
//! not need.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{info, warn};

/// Android Chrome user agent sent while following click-tracking redirects.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 13; Pixel 7 Pro) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36";

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ── storage ──────────────────────────────────────────────────────
    pub db_path: PathBuf,
    /// Directory holding `<publisher_store_id>_<run_id>.log` captures.
    pub capture_dir: PathBuf,
    /// Blob store root for raw creative bytes.
    pub creatives_dir: PathBuf,

    // ── workers ──────────────────────────────────────────────────────
    pub workers: usize,
    /// How long the domain / SDK-key tables may be served from cache.
    pub lookup_ttl: Duration,

    // ── redirect resolution ──────────────────────────────────────────
    pub redirect_timeout: Duration,
    pub redirect_max_hops: usize,
    pub user_agent: String,

    // ── creative classification ──────────────────────────────────────
    pub min_creative_bytes: u64,
    /// CDNs that serve app icons; square PNGs from these are not ads.
    pub icon_cdn_domains: Vec<String>,
    /// Optional TOML file replacing the built-in content-id rules.
    pub content_id_rules: Option<PathBuf>,

    // ── AppLovin payload cipher ──────────────────────────────────────
    pub cipher: Option<CipherConstants>,
}

/// Secret constants of the AppLovin payload cipher.
///
/// Version 1 and 2 blobs use separate key-derivation constants and may
/// use separate mixing multipliers (`v2_mix` falls back to `v1_mix`).
#[derive(Clone)]
pub struct CipherConstants {
    pub v1_mix: MixConstants,
    pub v2_mix: MixConstants,
    pub const_a: Vec<u8>,
    pub const_b: Vec<u8>,
}

/// Multipliers of the 64-bit mixing function, as signed Java longs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixConstants {
    pub c1: i64,
    pub c2: i64,
}

impl std::fmt::Debug for CipherConstants {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherConstants")
            .field("v1_mix", &self.v1_mix)
            .field("v2_mix", &self.v2_mix)
            .field("const_a", &format_args!("<{} bytes>", self.const_a.len()))
            .field("const_b", &format_args!("<{} bytes>", self.const_b.len()))
            .finish()
    }
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/adscan/adscan.conf"
    }
}

impl Default for Config {
    fn default() -> Self {
        from_map(&HashMap::new())
    }
}

/// Parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let map = parse_conf(&text);
    info!("Loaded config from {}", path.display());
    Ok(from_map(&map))
}

fn from_map(map: &HashMap<String, String>) -> Config {
    let get = |key: &str| -> Option<String> { map.get(key).cloned().filter(|s| !s.is_empty()) };
    let get_u64 = |key: &str, default: u64| -> u64 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };

    let icon_cdn_domains: Vec<String> = get("ICON_CDN_DOMAINS")
        .map(|s| {
            s.split(',')
                .map(|d| d.trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect()
        })
        .unwrap_or_else(|| vec!["googleusercontent.com".to_string()]);

    Config {
        db_path: PathBuf::from(get("DB_PATH").unwrap_or_else(|| "/data/adscan.db".into())),
        capture_dir: PathBuf::from(get("CAPTURE_DIR").unwrap_or_else(|| "/data/captures".into())),
        creatives_dir: PathBuf::from(
            get("CREATIVES_DIR").unwrap_or_else(|| "/data/creatives".into()),
        ),
        workers: (get_u64("WORKERS", 1) as usize).max(1),
        lookup_ttl: Duration::from_secs(get_u64("LOOKUP_TTL_SECS", 300)),
        redirect_timeout: Duration::from_secs(get_u64("REDIRECT_TIMEOUT_SECS", 5)),
        redirect_max_hops: (get_u64("REDIRECT_MAX_HOPS", 5) as usize).max(1),
        user_agent: get("USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.into()),
        min_creative_bytes: get_u64("MIN_CREATIVE_BYTES", 50_000),
        icon_cdn_domains,
        content_id_rules: get("CONTENT_ID_RULES").map(PathBuf::from),
        cipher: cipher_constants(&get),
    }
}

/// All four secrets must be present; a partial set disables the cipher.
fn cipher_constants(get: &dyn Fn(&str) -> Option<String>) -> Option<CipherConstants> {
    let c1 = get("APPLOVIN_C1");
    let c2 = get("APPLOVIN_C2");
    let const_a = get("APPLOVIN_CONST_A");
    let const_b = get("APPLOVIN_CONST_B");

    let (Some(c1), Some(c2), Some(const_a), Some(const_b)) = (c1, c2, const_a, const_b) else {
        warn!("No AppLovin cipher constants configured – encrypted payloads stay opaque");
        return None;
    };

    let parsed = (|| -> Result<CipherConstants> {
        let v1_mix = MixConstants {
            c1: c1.parse().context("APPLOVIN_C1")?,
            c2: c2.parse().context("APPLOVIN_C2")?,
        };
        let v2_mix = MixConstants {
            c1: match get("APPLOVIN_V2_C1") {
                Some(v) => v.parse().context("APPLOVIN_V2_C1")?,
                None => v1_mix.c1,
            },
            c2: match get("APPLOVIN_V2_C2") {
                Some(v) => v.parse().context("APPLOVIN_V2_C2")?,
                None => v1_mix.c2,
            },
        };
        Ok(CipherConstants {
            v1_mix,
            v2_mix,
            const_a: BASE64.decode(const_a.as_bytes()).context("APPLOVIN_CONST_A")?,
            const_b: BASE64.decode(const_b.as_bytes()).context("APPLOVIN_CONST_B")?,
        })
    })();

    match parsed {
        Ok(c) => Some(c),
        Err(e) => {
            warn!("Invalid AppLovin cipher constants, cipher disabled: {e:#}");
            None
        }
    }
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
