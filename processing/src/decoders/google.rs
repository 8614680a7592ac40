//! Google Ad Manager / AdMob (`doubleclick.net`).
//!
//! Two JSON shapes are in use: `ad_networks[].ad.{ad_html|ad_json}` and
//! `slots[].ads[]`.  For the latter only the slot holding the creative's
//! content id is scanned, since one response carries several ads.  Web ads
//! served as XML, HTML or inline script go through the generic scan.

use serde_json::Value;

use adscan_common::error::ScanError;
use adscan_common::exchange::ExchangeRecord;
use adscan_common::record::AdInfo;

use super::generic::scan_text;
use super::{AdNetworkDecoder, DecodeContext};

const NETWORK: &str = "doubleclick.net";

/// Non-JSON bodies that are plain web ads.
const WEB_AD_PREFIXES: &[&str] = &["<?xml version=", "<!DOCTYPE html>", "document.write(", "if "];

pub struct GoogleDecoder;

impl AdNetworkDecoder for GoogleDecoder {
    fn network(&self) -> &'static str {
        NETWORK
    }

    fn decode(
        &self,
        _source: &ExchangeRecord,
        text: &str,
        ctx: &DecodeContext<'_>,
    ) -> Result<AdInfo, ScanError> {
        if text.trim().is_empty() {
            return Err(ScanError::decode(NETWORK, "no response text"));
        }
        let json: Value = match serde_json::from_str(text.trim()) {
            Ok(json) => json,
            Err(_) if WEB_AD_PREFIXES.iter().any(|p| text.starts_with(p)) => {
                return scan_text(text, ctx);
            }
            Err(_) => return Err(ScanError::decode(NETWORK, "new/unrecognized format")),
        };

        if let Some(networks) = json.get("ad_networks").and_then(Value::as_array) {
            let mut html = String::new();
            for ad in networks.iter().filter_map(|n| n.get("ad")) {
                if let Some(ad_html) = ad.get("ad_html").and_then(Value::as_str) {
                    html.push_str(ad_html);
                } else if let Some(ad_json) = ad.get("ad_json") {
                    html.push_str(&ad_json.to_string());
                }
                html.push(' ');
            }
            return scan_text(&html, ctx);
        }

        if let Some(slots) = json.get("slots").and_then(Value::as_array) {
            for slot in slots {
                let slot_text = slot.to_string();
                if !slot_text.contains(ctx.content_id) {
                    continue;
                }
                let ads = slot.get("ads").and_then(Value::as_array).map_or(&[][..], Vec::as_slice);
                if ads.iter().any(|ad| ad.to_string().contains(ctx.content_id)) {
                    let info = scan_text(&slot_text, ctx)?;
                    if info.advertiser_store_id.is_some() {
                        return Ok(info);
                    }
                }
            }
            return Err(ScanError::decode(NETWORK, "failing to parse for slots response"));
        }

        Err(ScanError::decode(NETWORK, "new/unrecognized format"))
    }
}
