//! Unity Ads auction responses.
//!
//! Only `auction-load.unityads.unity3d.com` answers carry the ad itself,
//! as `media.<id>.bundleId`.  The media `content` blob may name an
//! `adjust_external` referrer, which is Adjust attributing the install.

use std::collections::BTreeSet;

use adscan_common::error::ScanError;
use adscan_common::exchange::ExchangeRecord;
use adscan_common::record::AdInfo;

use super::generic::scan_text;
use super::{parse_json, AdNetworkDecoder, DecodeContext};

const NETWORK: &str = "unity3d.com";
const AUCTION_HOST: &str = "auction-load.unityads.unity3d.com";

pub struct UnityDecoder;

impl AdNetworkDecoder for UnityDecoder {
    fn network(&self) -> &'static str {
        NETWORK
    }

    fn decode(
        &self,
        source: &ExchangeRecord,
        text: &str,
        ctx: &DecodeContext<'_>,
    ) -> Result<AdInfo, ScanError> {
        let mut bundle_ids: BTreeSet<String> = BTreeSet::new();
        let mut referrer_mmp = false;
        if source.url.contains(AUCTION_HOST) {
            let json = parse_json(NETWORK, text)?;
            let media = json
                .get("media")
                .and_then(|m| m.as_object())
                .ok_or_else(|| ScanError::decode(NETWORK, "auction response without media"))?;
            for entry in media.values() {
                if let Some(id) = entry.get("bundleId").and_then(|v| v.as_str()) {
                    bundle_ids.insert(id.to_string());
                }
                if let Some(content) = entry.get("content") {
                    let content = match content.as_str() {
                        Some(s) => s.to_string(),
                        None => content.to_string(),
                    };
                    referrer_mmp |= referrer_is_adjust(&content);
                }
            }
        }
        if bundle_ids.len() > 1 {
            return Err(ScanError::AmbiguousAttribution {
                ids: bundle_ids.into_iter().collect(),
            });
        }

        // URLs in the response win over the media map's bundle id.
        let mut info = scan_text(text, ctx)?;
        if info.advertiser_store_id.is_none() {
            info.advertiser_store_id = bundle_ids.into_iter().next();
        }
        if info.mmp_urls.is_empty() && referrer_mmp {
            info.mmp_urls.insert("adjust.com".to_string());
        }
        Ok(info)
    }
}

fn referrer_is_adjust(content: &str) -> bool {
    content
        .split_once("referrer=")
        .map(|(_, rest)| rest.split(',').next().unwrap_or_default())
        .is_some_and(|referrer| referrer.contains("adjust_external"))
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;

    const AUCTION: &str = "https://auction-load.unityads.unity3d.com/v6/games/1/requests";

    #[test]
    fn test_media_bundle_id_and_referrer() {
        let body = r#"{"media":{"m1":{"bundleId":"com.unity.adv","content":"{\"params\":\"referrer=adjust_external_click_id%3Dabc,other=1\"}"}}}"#;
        let src = response(AUCTION, body);
        let info = with_ctx("abcdef", |ctx| UnityDecoder.decode(&src, body, ctx)).unwrap();
        assert_eq!(info.advertiser_store_id.as_deref(), Some("com.unity.adv"));
        assert!(info.mmp_urls.contains("adjust.com"));
    }

    #[test]
    fn test_distinct_bundle_ids_are_ambiguous() {
        let body = r#"{"media":{"a":{"bundleId":"com.one"},"b":{"bundleId":"com.two"}}}"#;
        let src = response(AUCTION, body);
        let err = with_ctx("abcdef", |ctx| UnityDecoder.decode(&src, body, ctx)).unwrap_err();
        assert!(matches!(err, ScanError::AmbiguousAttribution { .. }));
    }

    #[test]
    fn test_other_hosts_scan_urls_only() {
        let body = r#"{"link":"market://details?id=com.unity.other"}"#;
        let src = response("https://config.unityads.unity3d.com/webview/x", body);
        let info = with_ctx("abcdef", |ctx| UnityDecoder.decode(&src, body, ctx)).unwrap();
        assert_eq!(info.advertiser_store_id.as_deref(), Some("com.unity.other"));
    }
}
