//! Vungle (Liftoff) bid responses: `ads[0].ad_markup` carries the store id
//! and a `tpat` map of tracking-URL lists.

use adscan_common::domain::top_level_domain;
use adscan_common::error::ScanError;
use adscan_common::exchange::ExchangeRecord;
use adscan_common::record::AdInfo;

use super::{parse_json, string_list, AdNetworkDecoder, DecodeContext};

const NETWORK: &str = "vungle.com";

/// `tpat` keys whose URLs may point at an attribution partner.
const TRACKING_KEYS: &[&str] = &["clickUrl", "checkpoint.0", "checkpoint.100"];

pub struct VungleDecoder;

impl AdNetworkDecoder for VungleDecoder {
    fn network(&self) -> &'static str {
        NETWORK
    }

    fn decode(
        &self,
        _source: &ExchangeRecord,
        text: &str,
        ctx: &DecodeContext<'_>,
    ) -> Result<AdInfo, ScanError> {
        let json = parse_json(NETWORK, text)?;
        let markup = json
            .pointer("/ads/0/ad_markup")
            .ok_or_else(|| ScanError::decode(NETWORK, "no ads[0].ad_markup"))?;

        let mut info = AdInfo {
            advertiser_store_id: markup
                .get("ad_market_id")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            ..AdInfo::default()
        };
        if let Some(tpat) = markup.get("tpat") {
            for key in TRACKING_KEYS {
                for url in string_list(tpat.get(*key)) {
                    let is_mmp = top_level_domain(&url).is_some_and(|tld| ctx.domains.is_mmp(&tld));
                    if is_mmp {
                        info.mmp_urls.insert(url);
                    }
                }
            }
        }
        Ok(info)
    }
}
