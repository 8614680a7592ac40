//! Yandex Mobile Ads.  A `native.ads` response lists several ads; only
//! the entries mentioning the creative's content id are scanned.

use serde_json::Value;

use adscan_common::error::ScanError;
use adscan_common::exchange::ExchangeRecord;
use adscan_common::record::AdInfo;

use super::generic::scan_text;
use super::{parse_json, AdNetworkDecoder, DecodeContext};

const NETWORK: &str = "yandex.ru";

pub struct YandexDecoder;

impl AdNetworkDecoder for YandexDecoder {
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
        let Some(native) = json.get("native") else {
            return scan_text(text, ctx);
        };
        let ads = native
            .get("ads")
            .and_then(Value::as_array)
            .ok_or_else(|| ScanError::decode(NETWORK, "native response without ads"))?;
        let matched: Vec<Value> = ads
            .iter()
            .filter(|ad| ad.to_string().contains(ctx.content_id))
            .cloned()
            .collect();
        if matched.is_empty() {
            // The other ads belong to other creatives; scanning them would
            // misattribute.
            return Err(ScanError::Unattributed(format!(
                "No {NETWORK} native ad holds content_id={}",
                ctx.content_id
            )));
        }
        scan_text(&Value::Array(matched).to_string(), ctx)
    }
}
