//! BidMachine and Everestop answer with a schema-less binary message.
//!
//! The ad sits at a fixed field path: the advertiser's store id at
//! `5.6.3.13.2.3`, the serving network's domain at `...2.2` and the ad
//! markup at `...2.17`.  When the path is absent the whole rendered tree is
//! scanned for URLs instead.

use adscan_common::domain::top_level_domain;
use adscan_common::error::ScanError;
use adscan_common::exchange::ExchangeRecord;
use adscan_common::record::AdInfo;

use super::generic::scan_text;
use super::{AdNetworkDecoder, DecodeContext};
use crate::bintree::{self, Node};

const ADVERTISER_PATH: &[u64] = &[5, 6, 3, 13, 2, 3];
const AD_DOMAIN_PATH: &[u64] = &[5, 6, 3, 13, 2, 2];
const MARKUP_PATH: &[u64] = &[5, 6, 3, 13, 2, 17];

pub struct BinaryTreeDecoder {
    network: &'static str,
}

impl BinaryTreeDecoder {
    pub fn bidmachine() -> Self {
        Self {
            network: "bidmachine.io",
        }
    }

    pub fn everestop() -> Self {
        Self {
            network: "everestop.io",
        }
    }
}

impl AdNetworkDecoder for BinaryTreeDecoder {
    fn network(&self) -> &'static str {
        self.network
    }

    fn decode(
        &self,
        source: &ExchangeRecord,
        _text: &str,
        ctx: &DecodeContext<'_>,
    ) -> Result<AdInfo, ScanError> {
        let body = source.response_body.as_deref().unwrap_or_default();
        let tree = bintree::parse(body)
            .ok_or_else(|| ScanError::decode(self.network, "response is not a binary message"))?;

        let path_text = |path: &[u64]| {
            tree.path(path)
                .and_then(Node::as_text)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let advertiser = path_text(ADVERTISER_PATH);
        let ad_domain = path_text(AD_DOMAIN_PATH);

        let mut info = match tree.path(MARKUP_PATH) {
            Some(Node::Utf8(markup)) => scan_text(markup, ctx)?,
            Some(node) => scan_text(&node.to_json().to_string(), ctx)?,
            None => AdInfo::default(),
        };
        if info.advertiser_store_id.is_none() {
            info.advertiser_store_id = advertiser;
        }
        if info.advertiser_store_id.is_none() {
            info = scan_text(&tree.to_json().to_string(), ctx)?;
        }
        if let Some(domain) = ad_domain {
            if info.ad_network_tlds.is_empty() {
                info.ad_network_tlds
                    .insert(top_level_domain(&domain).unwrap_or(domain));
            }
        }
        Ok(info)
    }
}
