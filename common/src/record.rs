//! Attribution results and the rows handed to external persistence.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::top_level_domain;

/// Decoded attribution result for one creative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdInfo {
    pub advertiser_store_id: Option<String>,
    /// Network whose decoder produced this result.
    pub ad_network_tld: Option<String>,
    /// Registrable domain of the exchange that ordered the creative.
    pub init_tld: Option<String>,
    pub mmp_urls: BTreeSet<String>,
    pub ad_network_tlds: BTreeSet<String>,
    /// Filled in by the aggregator after a store-id lookup.
    pub advertiser_app_id: Option<i64>,
}

impl AdInfo {
    pub fn with_advertiser(advertiser_store_id: impl Into<String>) -> Self {
        AdInfo {
            advertiser_store_id: Some(advertiser_store_id.into()),
            ..AdInfo::default()
        }
    }

    /// Registrable domain of the first attribution-partner URL.
    pub fn mmp_tld(&self) -> Option<String> {
        self.mmp_urls.iter().find_map(|u| top_level_domain(u))
    }

    /// Distinct registrable domains across all attribution-partner URLs.
    pub fn mmp_tlds(&self) -> BTreeSet<String> {
        self.mmp_urls
            .iter()
            .filter_map(|u| top_level_domain(u))
            .collect()
    }

    /// Fold another result's URL evidence into this one, keeping our
    /// advertiser id unless we have none.
    pub fn merge_evidence(&mut self, other: AdInfo) {
        if self.advertiser_store_id.is_none() {
            self.advertiser_store_id = other.advertiser_store_id;
        }
        self.mmp_urls.extend(other.mmp_urls);
        self.ad_network_tlds.extend(other.ad_network_tlds);
    }
}

/// Deduplicated creative asset row, keyed by (advertiser_app_id, md5_hash).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreativeAsset {
    pub advertiser_app_id: i64,
    pub md5_hash: String,
    pub file_extension: String,
    pub phash: Option<String>,
}

/// Final persisted fact: one creative attributed to one advertiser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreativeAttributionRecord {
    pub publisher_app_id: i64,
    pub advertiser_app_id: i64,
    pub creative_asset_id: i64,
    pub run_id: i64,
    pub initiating_domain_id: i64,
    pub host_domain_id: i64,
    pub mmp_domain_id: Option<i64>,
    pub mmp_urls: Vec<String>,
    pub additional_ad_domain_ids: Vec<i64>,
    pub updated_at: DateTime<Utc>,
}

/// Row of the append-only `creative_scan_results` diagnostics log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDiagnostic {
    pub run_id: i64,
    pub publisher_store_id: String,
    pub error_message: String,
    pub url: Option<String>,
    pub tld: Option<String>,
    pub file_extension: Option<String>,
    pub creative_size: Option<u64>,
}

impl ErrorDiagnostic {
    /// Diagnostic that concerns the whole run rather than one creative.
    pub fn for_run(run_id: i64, publisher_store_id: &str, message: impl Into<String>) -> Self {
        ErrorDiagnostic {
            run_id,
            publisher_store_id: publisher_store_id.to_string(),
            error_message: message.into(),
            url: None,
            tld: None,
            file_extension: None,
            creative_size: None,
        }
    }
}
