//! Per-network ad-response decoders and the dispatch registry.
//!
//! Each network serves its ad payload in an undocumented shape.  A decoder
//! knows one of those shapes; the [`DecoderRegistry`] picks it by the
//! source exchange's registrable domain and falls back to the
//! [`GenericDecoder`] (URL extraction over the whole response) when there
//! is no decoder for the domain or the specific one came up empty.

pub mod bidmachine;
pub mod fyber;
pub mod generic;
pub mod google;
pub mod mtg;
pub mod unity;
pub mod vungle;
pub mod yandex;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use adscan_common::error::ScanError;
use adscan_common::exchange::ExchangeRecord;
use adscan_common::record::AdInfo;

use crate::lookups::DomainTables;
use crate::redirect::RedirectResolver;

pub use generic::GenericDecoder;

/// Everything a decoder may consult besides the response itself.
pub struct DecodeContext<'a> {
    pub publisher_store_id: &'a str,
    pub run_id: i64,
    /// Identifier of the creative being attributed (see `correlator`).
    pub content_id: &'a str,
    pub domains: &'a DomainTables,
    pub redirects: &'a RedirectResolver,
}

pub trait AdNetworkDecoder: Send + Sync {
    /// Canonical registrable domain of the network.
    fn network(&self) -> &'static str;

    /// Decode `text` (the response body of `source`, already deciphered
    /// where needed).  `Ok` with no advertiser is a soft miss; a schema the
    /// decoder does not recognise is a [`ScanError::DecodeFailure`].
    fn decode(
        &self,
        source: &ExchangeRecord,
        text: &str,
        ctx: &DecodeContext<'_>,
    ) -> Result<AdInfo, ScanError>;
}

/// Registrable domain → decoder.
pub struct DecoderRegistry {
    decoders: HashMap<String, Arc<dyn AdNetworkDecoder>>,
    generic: GenericDecoder,
}

impl Default for DecoderRegistry {
    /// Registry with every built-in network decoder.
    fn default() -> Self {
        let mut registry = Self::generic_only();
        registry.register(&["vungle.com"], Arc::new(vungle::VungleDecoder));
        registry.register(&["unity3d.com"], Arc::new(unity::UnityDecoder));
        registry.register(&["mtgglobals.com"], Arc::new(mtg::MtgDecoder));
        registry.register(&["fyber.com", "tpbid.com", "inner-active.mobi"], Arc::new(fyber::FyberDecoder));
        registry.register(&["doubleclick.net"], Arc::new(google::GoogleDecoder));
        registry.register(&["yandex.ru"], Arc::new(yandex::YandexDecoder));
        registry.register(&["bidmachine.io"], Arc::new(bidmachine::BinaryTreeDecoder::bidmachine()));
        registry.register(&["everestop.io"], Arc::new(bidmachine::BinaryTreeDecoder::everestop()));
        registry
    }
}

impl DecoderRegistry {
    pub fn generic_only() -> Self {
        Self {
            decoders: HashMap::new(),
            generic: GenericDecoder,
        }
    }

    pub fn register(&mut self, tlds: &[&str], decoder: Arc<dyn AdNetworkDecoder>) {
        for tld in tlds {
            self.decoders.insert(tld.to_string(), Arc::clone(&decoder));
        }
    }

    pub fn decoder_for(&self, tld: &str) -> Option<&Arc<dyn AdNetworkDecoder>> {
        self.decoders.get(tld)
    }

    /// Decode one source exchange into an [`AdInfo`].
    ///
    /// `init_tld` is always the source's own domain; `ad_network_tld` is the
    /// decoder's canonical network, or the source domain for the generic
    /// fallback.
    pub fn decode_source(
        &self,
        source: &ExchangeRecord,
        text: &str,
        ctx: &DecodeContext<'_>,
    ) -> Result<AdInfo, ScanError> {
        let tld = source.tld_str();
        let Some(decoder) = self.decoder_for(tld) else {
            info!("Not a recognized ad network: {tld}, using generic URL scan");
            let mut info = self.generic.decode(source, text, ctx)?;
            info.ad_network_tld = Some(tld.to_string());
            info.init_tld = Some(tld.to_string());
            return Ok(info);
        };

        let network = decoder.network();
        let mut info = match decoder.decode(source, text, ctx) {
            Ok(info) if info.advertiser_store_id.is_some() => info,
            Ok(mut info) => {
                debug!("{network} decoder found no advertiser, trying generic scan");
                info.merge_evidence(self.generic.decode(source, text, ctx)?);
                info
            }
            Err(failure @ ScanError::DecodeFailure { .. }) => {
                warn!("{failure} (content_id={})", ctx.content_id);
                match self.generic.decode(source, text, ctx)? {
                    found if found.advertiser_store_id.is_some() => found,
                    _ => return Err(failure),
                }
            }
            Err(e) => return Err(e),
        };
        info.ad_network_tld = Some(network.to_string());
        info.init_tld = Some(tld.to_string());
        Ok(info)
    }
}

// ── helpers shared by the JSON decoders ──────────────────────────────────

/// Parse a response as JSON, naming the network in the failure.
pub(crate) fn parse_json(network: &str, text: &str) -> Result<serde_json::Value, ScanError> {
    serde_json::from_str(text.trim()).map_err(|e| ScanError::decode(network, format!("response is not JSON: {e}")))
}

/// Strings under `value`: a single string or an array of strings.
pub(crate) fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    match value {
        Some(serde_json::Value::String(s)) => vec![s.clone()],
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Arc;

    use chrono::Utc;

    use adscan_common::exchange::{ExchangeRecord, Headers};

    use super::DecodeContext;
    use crate::lookups::DomainTables;
    use crate::redirect::{MemoryRedirectCache, RedirectResolver, StaticHopFetcher};

    pub fn response(url: &str, body: &str) -> ExchangeRecord {
        response_with_headers(url, body.as_bytes(), Headers::default())
    }

    pub fn response_with_headers(url: &str, body: &[u8], headers: Headers) -> ExchangeRecord {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        ExchangeRecord::http(
            "src",
            Utc::now(),
            "POST",
            url,
            host,
            Headers::default(),
            Vec::new(),
            Some(200),
            headers,
            Some(body.to_vec()),
        )
    }

    pub fn domains() -> DomainTables {
        DomainTables::new(
            ["vungle.com", "unity3d.com", "tpbid.com", "doubleclick.net", "bidmachine.io", "applovin.com"],
            ["adjust.com", "appsflyer.com", "kochava.com"],
        )
    }

    pub fn offline_resolver() -> RedirectResolver {
        RedirectResolver::new(
            Arc::new(StaticHopFetcher::default()),
            Arc::new(MemoryRedirectCache::default()),
            5,
        )
    }

    /// Run `f` with an offline context for publisher `com.pub`.
    pub fn with_ctx<R>(content_id: &str, f: impl FnOnce(&DecodeContext<'_>) -> R) -> R {
        let domains = domains();
        let redirects = offline_resolver();
        let ctx = DecodeContext {
            publisher_store_id: "com.pub",
            run_id: 1,
            content_id,
            domains: &domains,
            redirects: &redirects,
        };
        f(&ctx)
    }
}
