//! Where attribution results go: domain dictionary, creative assets,
//! attribution records and the diagnostics log.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};

use adscan_common::record::{CreativeAsset, CreativeAttributionRecord, ErrorDiagnostic};

pub trait AttributionSink: Send + Sync {
    /// Id of `domain` in the domain dictionary, inserting it if new.
    fn upsert_domain(&self, domain: &str) -> Result<i64>;
    /// Id of the asset keyed by (advertiser app, md5), inserting it if new.
    fn upsert_creative_asset(&self, asset: &CreativeAsset) -> Result<i64>;
    fn upsert_creative_record(&self, record: &CreativeAttributionRecord) -> Result<()>;
    /// Append one diagnostic row.
    fn log_scan_result(&self, diagnostic: &ErrorDiagnostic) -> Result<()>;
    fn has_records_for_run(&self, run_id: i64) -> Result<bool>;
}

/// Natural key of a creative record.
type RecordKey = (i64, i64, i64, i64, i64);

fn record_key(r: &CreativeAttributionRecord) -> RecordKey {
    (
        r.publisher_app_id,
        r.creative_asset_id,
        r.run_id,
        r.initiating_domain_id,
        r.host_domain_id,
    )
}

#[derive(Default)]
struct Tables {
    domains: HashMap<String, i64>,
    assets: HashMap<(i64, String), (i64, CreativeAsset)>,
    records: Vec<CreativeAttributionRecord>,
    diagnostics: Vec<ErrorDiagnostic>,
}

/// In-memory sink for tests and dry runs.
#[derive(Default)]
pub struct MemorySink {
    tables: Mutex<Tables>,
}

impl MemorySink {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|_| anyhow!("memory sink poisoned"))
    }

    pub fn records(&self) -> Vec<CreativeAttributionRecord> {
        self.lock().map(|t| t.records.clone()).unwrap_or_default()
    }

    pub fn diagnostics(&self) -> Vec<ErrorDiagnostic> {
        self.lock().map(|t| t.diagnostics.clone()).unwrap_or_default()
    }

    pub fn assets(&self) -> Vec<CreativeAsset> {
        self.lock()
            .map(|t| t.assets.values().map(|(_, a)| a.clone()).collect())
            .unwrap_or_default()
    }

    /// Domain name for a dictionary id.
    pub fn domain_name(&self, id: i64) -> Option<String> {
        let tables = self.lock().ok()?;
        tables
            .domains
            .iter()
            .find(|(_, v)| **v == id)
            .map(|(k, _)| k.clone())
    }
}

impl AttributionSink for MemorySink {
    fn upsert_domain(&self, domain: &str) -> Result<i64> {
        let mut t = self.lock()?;
        let next = t.domains.len() as i64 + 1;
        Ok(*t.domains.entry(domain.to_string()).or_insert(next))
    }

    fn upsert_creative_asset(&self, asset: &CreativeAsset) -> Result<i64> {
        let mut t = self.lock()?;
        let next = t.assets.len() as i64 + 1;
        let (id, _) = t
            .assets
            .entry((asset.advertiser_app_id, asset.md5_hash.clone()))
            .or_insert_with(|| (next, asset.clone()));
        Ok(*id)
    }

    fn upsert_creative_record(&self, record: &CreativeAttributionRecord) -> Result<()> {
        let mut t = self.lock()?;
        let key = record_key(record);
        match t.records.iter_mut().find(|r| record_key(r) == key) {
            Some(existing) => *existing = record.clone(),
            None => t.records.push(record.clone()),
        }
        Ok(())
    }

    fn log_scan_result(&self, diagnostic: &ErrorDiagnostic) -> Result<()> {
        self.lock()?.diagnostics.push(diagnostic.clone());
        Ok(())
    }

    fn has_records_for_run(&self, run_id: i64) -> Result<bool> {
        Ok(self.lock()?.records.iter().any(|r| r.run_id == run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(asset: i64, mmp_urls: Vec<String>) -> CreativeAttributionRecord {
        CreativeAttributionRecord {
            publisher_app_id: 1,
            advertiser_app_id: 2,
            creative_asset_id: asset,
            run_id: 9,
            initiating_domain_id: 3,
            host_domain_id: 4,
            mmp_domain_id: None,
            mmp_urls,
            additional_ad_domain_ids: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_upserts_are_keyed() {
        let sink = MemorySink::default();
        let a = sink.upsert_domain("vungle.com").unwrap();
        assert_eq!(sink.upsert_domain("adjust.com").unwrap(), a + 1);
        assert_eq!(sink.upsert_domain("vungle.com").unwrap(), a);

        let asset = CreativeAsset {
            advertiser_app_id: 2,
            md5_hash: "abc".into(),
            file_extension: "mp4".into(),
            phash: None,
        };
        let id = sink.upsert_creative_asset(&asset).unwrap();
        assert_eq!(sink.upsert_creative_asset(&asset).unwrap(), id);

        sink.upsert_creative_record(&record(id, vec![])).unwrap();
        sink.upsert_creative_record(&record(id, vec!["https://app.adjust.com/x".into()])).unwrap();
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mmp_urls.len(), 1);
        assert!(sink.has_records_for_run(9).unwrap());
        assert!(!sink.has_records_for_run(10).unwrap());
    }
}
