//! Mintegral: `data.ads[0].package_name`.

use adscan_common::error::ScanError;
use adscan_common::exchange::ExchangeRecord;
use adscan_common::record::AdInfo;

use super::{parse_json, AdNetworkDecoder, DecodeContext};

const NETWORK: &str = "mtgglobals.com";

pub struct MtgDecoder;

impl AdNetworkDecoder for MtgDecoder {
    fn network(&self) -> &'static str {
        NETWORK
    }

    fn decode(
        &self,
        _source: &ExchangeRecord,
        text: &str,
        _ctx: &DecodeContext<'_>,
    ) -> Result<AdInfo, ScanError> {
        let json = parse_json(NETWORK, text)?;
        let package = json
            .pointer("/data/ads/0/package_name")
            .ok_or_else(|| ScanError::decode(NETWORK, "no data.ads[0].package_name"))?;
        Ok(AdInfo {
            advertiser_store_id: package
                .as_str()
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            ..AdInfo::default()
        })
    }
}
