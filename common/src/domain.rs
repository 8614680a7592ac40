//! Registrable-domain ("top-level-domain" in ad-tech parlance) extraction.
//!
//! `https://app.adjust.com/abc` → `adjust.com`,
//! `https://r1---sn.googlevideo.com/...` → `googlevideo.com`,
//! `https://ads.example.co.uk/` → `example.co.uk`.

use std::net::IpAddr;

use url::Url;

/// Registrable domain of a URL or bare host name.
///
/// Returns `None` for IP addresses, single-label hosts and schemes without a
/// host (e.g. `market://details?id=…` resolves to host `details`, which has
/// no registrable part).
pub fn top_level_domain(input: &str) -> Option<String> {
    let host = host_of(input)?;
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() || host.parse::<IpAddr>().is_ok() {
        return None;
    }
    if !host.contains('.') {
        return None;
    }
    psl::domain_str(&host).map(str::to_string)
}

/// Host part of a URL; inputs without a scheme are treated as `host[:port][/path]`.
pub fn host_of(input: &str) -> Option<String> {
    let input = input.trim();
    if input.contains("://") {
        let parsed = Url::parse(input).ok()?;
        return parsed.host_str().map(|h| h.trim_matches(['[', ']']).to_string());
    }
    let host = input
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .rsplit('@')
        .next()
        .unwrap_or_default();
    let host = match host.rsplit_once(':') {
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    };
    (!host.is_empty()).then(|| host.to_string())
}
