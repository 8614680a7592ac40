//! Fyber / DT Exchange (`fyber.com`, `tpbid.com`, `inner-active.mobi`).
//!
//! Responses are an inner-active M2M envelope whose `<tns:Ad>` element
//! holds an escaped VAST document, or HTML when the ad is a playable.

use adscan_common::domain::top_level_domain;
use adscan_common::error::ScanError;
use adscan_common::exchange::ExchangeRecord;
use adscan_common::record::AdInfo;

use super::generic::scan_urls;
use super::{AdNetworkDecoder, DecodeContext};
use crate::lookups::DomainTables;
use crate::markup;
use crate::urls::{extract_urls, FYBER_NAVIGATE};

const NETWORK: &str = "fyber.com";
const BUNDLE_HEADER: &str = "x-ia-app-bundle";
const GOTU_CLICK: &str = "https://gotu.tpbid.com/click";

pub struct FyberDecoder;

impl AdNetworkDecoder for FyberDecoder {
    fn network(&self) -> &'static str {
        NETWORK
    }

    fn decode(
        &self,
        source: &ExchangeRecord,
        text: &str,
        ctx: &DecodeContext<'_>,
    ) -> Result<AdInfo, ScanError> {
        if source.tld_str() == "inner-active.mobi" {
            if let Some(bundle) = source.response_headers.get(BUNDLE_HEADER).filter(|b| !b.is_empty()) {
                return Ok(AdInfo::with_advertiser(bundle));
            }
        }
        let mut urls = extract_urls(text);
        urls.extend(envelope_urls(text, ctx.domains));
        scan_urls(urls, ctx)
    }
}

/// URLs of the ad inside the envelope: VAST element text when the inner
/// document parses (as-is or entity-unescaped), click targets of the HTML
/// otherwise.
fn envelope_urls(text: &str, domains: &DomainTables) -> Vec<String> {
    let Some(inner) = markup::element_text(text, "Ad").filter(|t| !t.is_empty()) else {
        return Vec::new();
    };
    markup::vast_urls_lenient(&inner).unwrap_or_else(|| html_click_targets(&inner, domains))
}

fn html_click_targets(html: &str, domains: &DomainTables) -> Vec<String> {
    extract_urls(html)
        .into_iter()
        .filter_map(|url| {
            if url.starts_with(FYBER_NAVIGATE) {
                url.find("http").map(|i| url[i..].to_string())
            } else if url.contains(GOTU_CLICK) {
                Some(url)
            } else if top_level_domain(&url).is_some_and(|tld| domains.is_mmp(&tld)) {
                Some(url)
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;

    use adscan_common::exchange::Headers;

    const ENVELOPE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<tns:Response xmlns:tns="http://www.inner-active.com/SimpleM2M/M2MResponse">
<tns:Ad>&lt;VAST version="2.0"&gt;&lt;Ad&gt;&lt;InLine&gt;&lt;Creatives&gt;&lt;Creative&gt;&lt;Linear&gt;&lt;VideoClicks&gt;&lt;ClickThrough&gt;https://app.appsflyer.com/com.fyber.adv?pid=fyber_int&lt;/ClickThrough&gt;&lt;/VideoClicks&gt;&lt;/Linear&gt;&lt;/Creative&gt;&lt;/Creatives&gt;&lt;/InLine&gt;&lt;/Ad&gt;&lt;/VAST&gt;</tns:Ad>
</tns:Response>"#;

    #[test]
    fn test_vast_inside_envelope() {
        let src = response("https://wv.inner-active.mobi/simpleM2M/request", ENVELOPE);
        let info = with_ctx("abcdef", |ctx| FyberDecoder.decode(&src, ENVELOPE, ctx)).unwrap();
        assert_eq!(info.advertiser_store_id.as_deref(), Some("com.fyber.adv"));
        assert!(info.mmp_urls.iter().any(|u| u.contains("appsflyer.com")));
    }

    #[test]
    fn test_bundle_header_wins() {
        let headers: Headers = [("X-IA-App-Bundle", "com.header.adv")].into_iter().collect();
        let src = response_with_headers("https://wv.inner-active.mobi/simpleM2M/request", ENVELOPE.as_bytes(), headers);
        let info = with_ctx("abcdef", |ctx| FyberDecoder.decode(&src, ENVELOPE, ctx)).unwrap();
        assert_eq!(info.advertiser_store_id.as_deref(), Some("com.header.adv"));
    }

    #[test]
    fn test_html_click_targets() {
        let html = r#"<div onclick="go('fybernativebrowser://navigate?url=https://gotu.tpbid.com/click?x=1')">
            <a href="https://app.adjust.com/zz1">install</a><img src="https://cdn.example.com/a.png"></div>"#;
        let urls = html_click_targets(html, &domains());
        assert!(urls.contains(&"https://gotu.tpbid.com/click?x=1".to_string()));
        assert!(urls.contains(&"https://app.adjust.com/zz1".to_string()));
        assert!(!urls.iter().any(|u| u.contains("cdn.example.com")));
    }
}
