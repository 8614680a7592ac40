//! Fallback decoder: every URL in the response, classified.

use std::collections::BTreeSet;

use adscan_common::error::ScanError;
use adscan_common::exchange::ExchangeRecord;
use adscan_common::record::AdInfo;

use super::{AdNetworkDecoder, DecodeContext};
use crate::urls::{classify_urls, click_urls, extract_urls};

pub struct GenericDecoder;

impl AdNetworkDecoder for GenericDecoder {
    fn network(&self) -> &'static str {
        "generic"
    }

    fn decode(
        &self,
        _source: &ExchangeRecord,
        text: &str,
        ctx: &DecodeContext<'_>,
    ) -> Result<AdInfo, ScanError> {
        scan_text(text, ctx)
    }
}

/// Extract, expand click redirects and classify the URLs of `text`.
pub fn scan_text(text: &str, ctx: &DecodeContext<'_>) -> Result<AdInfo, ScanError> {
    scan_urls(extract_urls(text), ctx)
}

/// Classify an already-collected URL set after following its click URLs.
pub fn scan_urls(mut urls: BTreeSet<String>, ctx: &DecodeContext<'_>) -> Result<AdInfo, ScanError> {
    for click in click_urls(&urls) {
        urls.extend(ctx.redirects.resolve(&click, ctx.run_id));
    }
    let findings = classify_urls(&urls, ctx.domains);
    Ok(AdInfo {
        advertiser_store_id: findings.advertiser(ctx.publisher_store_id)?,
        ad_network_tlds: findings.ad_network_tlds(),
        mmp_urls: findings.mmp_urls,
        ..AdInfo::default()
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::testutil::*;
    use super::*;
    use crate::redirect::{MemoryRedirectCache, RedirectResolver, StaticHopFetcher};

    #[test]
    fn test_click_urls_are_followed() {
        let fetcher = Arc::new(
            StaticHopFetcher::default()
                .with_hop("https://api.youappi.com/v1/e/click?c=9", "https://app.appsflyer.com/com.adv.z?pid=n")
                .with_hop(
                    "https://app.appsflyer.com/com.adv.z?pid=n",
                    "https://play.google.com/store/apps/details?id=com.adv.z",
                ),
        );
        let redirects = RedirectResolver::new(fetcher, Arc::new(MemoryRedirectCache::default()), 5);
        let domains = domains();
        let ctx = DecodeContext {
            publisher_store_id: "com.pub",
            run_id: 3,
            content_id: "abcdef",
            domains: &domains,
            redirects: &redirects,
        };
        let info = scan_text(r#"{"c":"https://api.youappi.com/v1/e/click?c=9"}"#, &ctx).unwrap();
        assert_eq!(info.advertiser_store_id.as_deref(), Some("com.adv.z"));
        assert!(info.mmp_urls.contains("https://app.appsflyer.com/com.adv.z?pid=n"));
    }

    #[test]
    fn test_click_redirect_ending_in_market_url() {
        let fetcher = Arc::new(
            StaticHopFetcher::default()
                .with_hop("https://api.youappi.com/v1/e/click?c=4", "https://app.adjust.com/abc?campaign=m")
                .with_hop("https://app.adjust.com/abc?campaign=m", "market://details?id=com.adv.m"),
        );
        let redirects = RedirectResolver::new(fetcher, Arc::new(MemoryRedirectCache::default()), 5);
        let domains = domains();
        let ctx = DecodeContext {
            publisher_store_id: "com.pub",
            run_id: 3,
            content_id: "abcdef",
            domains: &domains,
            redirects: &redirects,
        };
        let info = scan_text(r#"{"c":"https://api.youappi.com/v1/e/click?c=4"}"#, &ctx).unwrap();
        assert_eq!(info.advertiser_store_id.as_deref(), Some("com.adv.m"));
        assert!(info.mmp_urls.contains("https://app.adjust.com/abc?campaign=m"));
    }

    #[test]
    fn test_ambiguous_advertisers() {
        let domains = domains();
        let redirects = offline_resolver();
        let ctx = DecodeContext {
            publisher_store_id: "com.pub",
            run_id: 3,
            content_id: "abcdef",
            domains: &domains,
            redirects: &redirects,
        };
        let text = "market://details?id=com.a.one market://details?id=com.b.two";
        assert!(matches!(
            scan_text(text, &ctx),
            Err(ScanError::AmbiguousAttribution { .. })
        ));
    }
}
