//! Attribution of one run: capture in, records and diagnostics out.
//!
//! Each creative goes through
//! `found → correlated → decoded → classified → attributed | unattributed`.
//! Every unattributed creative produces exactly one [`ErrorDiagnostic`];
//! only infrastructure failures (lookup tables unreachable) are returned
//! to the caller.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use adscan_common::config::{CipherConstants, Config};
use adscan_common::error::ScanError;
use adscan_common::exchange::ExchangeRecord;
use adscan_common::record::{AdInfo, CreativeAsset, CreativeAttributionRecord, ErrorDiagnostic};

use crate::blobs::{BlobStore, FsBlobStore};
use crate::capture;
use crate::cipher;
use crate::classifier::{Classifier, CreativeCandidate};
use crate::correlator::{ContentIdRules, Correlator, IGNORED_CONTENT_IDS, MIN_CONTENT_ID_LEN};
use crate::db::SqliteStore;
use crate::decoders::{DecodeContext, DecoderRegistry};
use crate::lookups::{CachedLookups, DomainTables};
use crate::phash;
use crate::redirect::{HttpHopFetcher, RedirectResolver};
use crate::store::AttributionSink;

const APPLOVIN_TLD: &str = "applovin.com";

/// Counters reported at the end of a run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub exchanges: usize,
    pub creatives: usize,
    pub attributed: usize,
    pub ignored: usize,
    pub diagnostics: usize,
}

enum Outcome {
    Attributed,
    Ignored,
    Duplicate,
}

/// Everything a run needs, shared across worker threads.
pub struct Engine {
    lookups: Arc<CachedLookups>,
    sink: Arc<dyn AttributionSink>,
    blobs: Arc<dyn BlobStore>,
    redirects: Arc<RedirectResolver>,
    registry: DecoderRegistry,
    classifier: Classifier,
    content_ids: ContentIdRules,
    cipher: Option<CipherConstants>,
}

impl Engine {
    pub fn new(
        lookups: Arc<CachedLookups>,
        sink: Arc<dyn AttributionSink>,
        blobs: Arc<dyn BlobStore>,
        redirects: Arc<RedirectResolver>,
    ) -> Self {
        Self {
            lookups,
            sink,
            blobs,
            redirects,
            registry: DecoderRegistry::default(),
            classifier: Classifier::new(50_000, Vec::new()),
            content_ids: ContentIdRules::builtin(),
            cipher: None,
        }
    }

    /// Production wiring: SQLite for lookups, sinks and the redirect cache,
    /// the filesystem for blobs, live HTTP for redirects.
    pub fn from_config(config: &Config, store: Arc<SqliteStore>) -> Result<Self> {
        let lookups = Arc::new(CachedLookups::new(store.clone(), config.lookup_ttl));
        let fetcher = Arc::new(HttpHopFetcher::from_config(config)?);
        let redirects = Arc::new(RedirectResolver::new(
            fetcher,
            store.clone(),
            config.redirect_max_hops,
        ));
        let content_ids = match &config.content_id_rules {
            Some(path) => ContentIdRules::load(path)
                .with_context(|| format!("Cannot load content id rules {}", path.display()))?,
            None => ContentIdRules::builtin(),
        };
        let blobs = Arc::new(FsBlobStore::new(&config.creatives_dir));

        Ok(Self::new(lookups, store, blobs, redirects)
            .with_classifier(Classifier::from_config(config))
            .with_content_id_rules(content_ids)
            .with_cipher(config.cipher.clone()))
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_content_id_rules(mut self, rules: ContentIdRules) -> Self {
        self.content_ids = rules;
        self
    }

    pub fn with_cipher(mut self, cipher: Option<CipherConstants>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_registry(mut self, registry: DecoderRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn sink(&self) -> &Arc<dyn AttributionSink> {
        &self.sink
    }

    // ── run level ────────────────────────────────────────────────────────

    /// Read the capture at `path` and attribute it.
    pub fn process_capture(&self, path: &Path, publisher_store_id: &str, run_id: i64) -> Result<RunSummary> {
        let records = match capture::read_capture(path) {
            Ok(records) => records,
            Err(e) => {
                warn!("{publisher_store_id} run {run_id}: {e}");
                self.diagnose(&ErrorDiagnostic::for_run(run_id, publisher_store_id, e.to_string()));
                return Ok(RunSummary {
                    diagnostics: 1,
                    ..RunSummary::default()
                });
            }
        };
        if records.is_empty() {
            let e = ScanError::CaptureUnreadable {
                path: path.to_path_buf(),
                reason: "no exchanges".into(),
            };
            warn!("{publisher_store_id} run {run_id}: {e}");
            self.diagnose(&ErrorDiagnostic::for_run(run_id, publisher_store_id, e.to_string()));
            return Ok(RunSummary {
                diagnostics: 1,
                ..RunSummary::default()
            });
        }
        self.attribute_run(&records, publisher_store_id, run_id)
    }

    /// Attribute every creative among `records`.
    pub fn attribute_run(
        &self,
        records: &[ExchangeRecord],
        publisher_store_id: &str,
        run_id: i64,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary {
            exchanges: records.len(),
            ..RunSummary::default()
        };

        let creatives = self.classifier.find_creatives(records);
        summary.creatives = creatives.len();
        if creatives.is_empty() {
            info!("{publisher_store_id} run {run_id}: no creatives among {} exchanges", records.len());
            return Ok(summary);
        }

        let Some(publisher_app_id) = self
            .lookups
            .resolve_store_app_id(publisher_store_id)
            .context("Publisher lookup failed")?
        else {
            let e = ScanError::Unattributed(format!(
                "publisher {publisher_store_id} is not in the store app table"
            ));
            warn!("Run {run_id}: {e}");
            self.diagnose(&ErrorDiagnostic::for_run(run_id, publisher_store_id, e.to_string()));
            summary.diagnostics = 1;
            return Ok(summary);
        };

        let domains = self.lookups.domain_tables().context("Domain tables unavailable")?;
        let texts = self.response_texts(records, publisher_store_id)?;
        let run = Run {
            publisher_store_id,
            publisher_app_id,
            run_id,
            domains: &domains,
            correlator: Correlator::new(records, &texts),
        };

        let mut seen: HashSet<(String, u64)> = HashSet::new();
        let mut decoded: HashMap<String, Result<AdInfo, ScanError>> = HashMap::new();
        for mut creative in creatives {
            match self.attribute_creative(&run, &mut creative, &mut seen, &mut decoded) {
                Ok(Outcome::Attributed) => summary.attributed += 1,
                Ok(Outcome::Ignored) => summary.ignored += 1,
                Ok(Outcome::Duplicate) => {}
                Err(e) => {
                    warn!(
                        "{publisher_store_id} run {run_id}: {} ({}) unattributed: {e}",
                        creative.record.url,
                        e.kind()
                    );
                    self.diagnose(&creative_diagnostic(&run, &creative, &e));
                    summary.diagnostics += 1;
                }
            }
        }

        info!(
            "{publisher_store_id} run {run_id}: {} creatives, {} attributed, {} diagnostics",
            summary.creatives, summary.attributed, summary.diagnostics
        );
        Ok(summary)
    }

    /// Response text of every exchange, AppLovin cipher payloads decoded.
    fn response_texts(&self, records: &[ExchangeRecord], publisher_store_id: &str) -> Result<Vec<String>> {
        let mut sdk_keys = None;
        let mut texts = Vec::with_capacity(records.len());
        for record in records {
            let blob = record
                .response_body
                .as_deref()
                .filter(|b| record.tld_str() == APPLOVIN_TLD && cipher::looks_like_blob(b));
            let (Some(body), Some(constants)) = (blob, &self.cipher) else {
                texts.push(record.response_text());
                continue;
            };
            let keys = match &sdk_keys {
                Some(keys) => Arc::clone(keys),
                None => {
                    let keys = self
                        .lookups
                        .sdk_keys_for_app(publisher_store_id)
                        .context("SDK key lookup failed")?;
                    sdk_keys = Some(Arc::clone(&keys));
                    keys
                }
            };
            match cipher::decode(body, &keys, constants) {
                Ok(text) => texts.push(text),
                Err(e) => {
                    warn!("{}: {}", record.url, ScanError::from(e));
                    texts.push(record.response_text());
                }
            }
        }
        Ok(texts)
    }

    fn diagnose(&self, diagnostic: &ErrorDiagnostic) {
        if let Err(e) = self.sink.log_scan_result(diagnostic) {
            tracing::error!(
                "Cannot log diagnostic for run {}: {e:#} ({})",
                diagnostic.run_id,
                diagnostic.error_message
            );
        }
    }

    // ── creative level ───────────────────────────────────────────────────

    fn attribute_creative(
        &self,
        run: &Run<'_>,
        creative: &mut CreativeCandidate<'_>,
        seen: &mut HashSet<(String, u64)>,
        decoded: &mut HashMap<String, Result<AdInfo, ScanError>>,
    ) -> Result<Outcome, ScanError> {
        let record = creative.record;
        let content_id = self
            .content_ids
            .content_id(record)
            .ok_or_else(|| ScanError::Unattributed("no content id in creative url".into()))?;
        creative.content_id = Some(content_id.clone());

        if IGNORED_CONTENT_IDS.contains(&content_id.as_str()) {
            debug!("Ignoring {content_id} ({})", record.url);
            return Ok(Outcome::Ignored);
        }
        if !seen.insert((content_id.clone(), record.response_size)) {
            debug!("Duplicate creative {content_id} ({} bytes)", record.response_size);
            return Ok(Outcome::Duplicate);
        }
        if content_id.len() < MIN_CONTENT_ID_LEN {
            return Err(ScanError::CorrelationMiss {
                tld: record.tld_str().to_string(),
                content_id,
            });
        }

        let mut info = decoded
            .entry(content_id.clone())
            .or_insert_with(|| self.decode(run, record, &content_id))
            .clone()?;

        let advertiser = info
            .advertiser_store_id
            .clone()
            .ok_or_else(|| ScanError::Unattributed(format!("no advertiser found for {content_id}")))?;
        if advertiser == run.publisher_store_id {
            return Err(ScanError::SelfAttribution {
                store_id: advertiser,
            });
        }
        let advertiser_app_id = match self.lookups.resolve_store_app_id(&advertiser) {
            Ok(Some(id)) => id,
            Ok(None) => {
                return Err(ScanError::Unattributed(format!(
                    "advertiser {advertiser} is not in the store app table"
                )))
            }
            Err(e) => {
                return Err(ScanError::Unattributed(format!(
                    "advertiser {advertiser} lookup failed: {e:#}"
                )))
            }
        };
        info.advertiser_app_id = Some(advertiser_app_id);

        let body = record.response_body.as_deref().unwrap_or_default();
        let md5_hash = format!("{:x}", md5::compute(body));
        creative.md5_hash = Some(md5_hash.clone());
        creative.phash = phash::phash(body);

        self.blobs
            .put(&advertiser, &md5_hash, &creative.file_extension, body)
            .map_err(ScanError::storage)?;
        let creative_asset_id = self
            .sink
            .upsert_creative_asset(&CreativeAsset {
                advertiser_app_id,
                md5_hash,
                file_extension: creative.file_extension.clone(),
                phash: creative.phash.clone(),
            })
            .map_err(ScanError::storage)?;

        let mmp_tlds = info.mmp_tlds();
        if mmp_tlds.len() > 1 {
            warn!(
                "{} run {}: multiple MMP domains for {content_id}: {mmp_tlds:?}",
                run.publisher_store_id, run.run_id
            );
        }

        let host_domain = record.tld.clone().unwrap_or_else(|| record.host.clone());
        let init_domain = info.init_tld.clone().unwrap_or_else(|| host_domain.clone());
        let initiating_domain_id = self.domain_id(&init_domain)?;
        let host_domain_id = self.domain_id(&host_domain)?;
        let mmp_domain_id = info.mmp_tld().map(|d| self.domain_id(&d)).transpose()?;
        let additional_ad_domain_ids = info
            .ad_network_tlds
            .iter()
            .map(|d| self.domain_id(d))
            .collect::<Result<Vec<_>, _>>()?;

        self.sink
            .upsert_creative_record(&CreativeAttributionRecord {
                publisher_app_id: run.publisher_app_id,
                advertiser_app_id,
                creative_asset_id,
                run_id: run.run_id,
                initiating_domain_id,
                host_domain_id,
                mmp_domain_id,
                mmp_urls: info.mmp_urls.iter().cloned().collect(),
                additional_ad_domain_ids,
                updated_at: Utc::now(),
            })
            .map_err(ScanError::storage)?;

        info!(
            "{} run {}: {content_id} from {host_domain} attributed to {advertiser} via {}",
            run.publisher_store_id,
            run.run_id,
            info.ad_network_tld.as_deref().unwrap_or(&init_domain)
        );
        Ok(Outcome::Attributed)
    }

    fn decode(&self, run: &Run<'_>, creative: &ExchangeRecord, content_id: &str) -> Result<AdInfo, ScanError> {
        let source = run
            .correlator
            .correlate(creative, content_id)
            .ok_or_else(|| ScanError::CorrelationMiss {
                tld: creative.tld_str().to_string(),
                content_id: content_id.to_string(),
            })?;
        debug!("{content_id} correlated with {}", source.record.url);
        let ctx = DecodeContext {
            publisher_store_id: run.publisher_store_id,
            run_id: run.run_id,
            content_id,
            domains: run.domains,
            redirects: &self.redirects,
        };
        self.registry.decode_source(source.record, source.text, &ctx)
    }

    fn domain_id(&self, domain: &str) -> Result<i64, ScanError> {
        self.sink.upsert_domain(domain).map_err(ScanError::storage)
    }
}

/// Run-local state.
struct Run<'a> {
    publisher_store_id: &'a str,
    publisher_app_id: i64,
    run_id: i64,
    domains: &'a DomainTables,
    correlator: Correlator<'a>,
}

fn creative_diagnostic(run: &Run<'_>, creative: &CreativeCandidate<'_>, e: &ScanError) -> ErrorDiagnostic {
    ErrorDiagnostic {
        run_id: run.run_id,
        publisher_store_id: run.publisher_store_id.to_string(),
        error_message: e.to_string(),
        url: Some(creative.record.url.clone()),
        tld: creative.record.tld.clone(),
        file_extension: Some(creative.file_extension.clone()),
        creative_size: Some(creative.record.response_size),
    }
}
