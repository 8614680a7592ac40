//! Redirect-chain resolution for click-tracking URLs.
//!
//! Chains are followed one `Location` hop at a time with automatic
//! redirects disabled, and cached per `(run_id, url)` so that a URL seen
//! again in the same run never touches the network twice.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::LOCATION;
use tracing::{debug, warn};

use adscan_common::config::Config;

/// One network hop: the `Location` target of `url`, if any.
pub trait HopFetcher: Send + Sync {
    fn next_hop(&self, url: &str) -> Result<Option<String>>;
}

/// Persistent chain cache keyed by `(run_id, url)`.
pub trait RedirectCache: Send + Sync {
    fn cached_chain(&self, run_id: i64, url: &str) -> Result<Option<Vec<String>>>;
    /// Insert-if-absent; concurrent writers of the same key are harmless.
    fn store_chain(&self, run_id: i64, url: &str, chain: &[String]) -> Result<()>;
}

// ── HTTP ─────────────────────────────────────────────────────────────────

pub struct HttpHopFetcher {
    client: reqwest::blocking::Client,
}

impl HttpHopFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .context("Cannot create HTTP client")?;
        Ok(Self { client })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.user_agent, config.redirect_timeout)
    }
}

impl HopFetcher for HttpHopFetcher {
    fn next_hop(&self, url: &str) -> Result<Option<String>> {
        let resp = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("GET {url}"))?;
        Ok(resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string))
    }
}

// ── resolver ─────────────────────────────────────────────────────────────

pub struct RedirectResolver {
    fetcher: Arc<dyn HopFetcher>,
    cache: Arc<dyn RedirectCache>,
    max_hops: usize,
}

impl RedirectResolver {
    pub fn new(fetcher: Arc<dyn HopFetcher>, cache: Arc<dyn RedirectCache>, max_hops: usize) -> Self {
        Self {
            fetcher,
            cache,
            max_hops,
        }
    }

    /// The hops after `url`, in order.  Network errors end the chain
    /// without retry; cache failures only cost a refetch.
    pub fn resolve(&self, url: &str, run_id: i64) -> Vec<String> {
        match self.cache.cached_chain(run_id, url) {
            Ok(Some(chain)) => return chain,
            Ok(None) => {}
            Err(e) => warn!("Redirect cache read failed for {url}: {e:#}"),
        }

        let mut chain: Vec<String> = Vec::new();
        let mut current = url.to_string();
        while chain.len() < self.max_hops {
            match self.fetcher.next_hop(&current) {
                Ok(Some(next)) => {
                    chain.push(next.clone());
                    if !next.starts_with("http") {
                        break;
                    }
                    current = next;
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Redirect chain for {url} stops at {current}: {e:#}");
                    break;
                }
            }
        }
        debug!("Resolved {url} in {} hop(s)", chain.len());

        if let Err(e) = self.cache.store_chain(run_id, url, &chain) {
            warn!("Cannot cache redirect chain for {url}: {e:#}");
        }
        chain
    }
}

// ── in-memory cache ──────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryRedirectCache {
    chains: Mutex<HashMap<(i64, String), Vec<String>>>,
}

impl RedirectCache for MemoryRedirectCache {
    fn cached_chain(&self, run_id: i64, url: &str) -> Result<Option<Vec<String>>> {
        let chains = self
            .chains
            .lock()
            .map_err(|_| anyhow::anyhow!("redirect cache poisoned"))?;
        Ok(chains.get(&(run_id, url.to_string())).cloned())
    }

    fn store_chain(&self, run_id: i64, url: &str, chain: &[String]) -> Result<()> {
        let mut chains = self
            .chains
            .lock()
            .map_err(|_| anyhow::anyhow!("redirect cache poisoned"))?;
        chains
            .entry((run_id, url.to_string()))
            .or_insert_with(|| chain.to_vec());
        Ok(())
    }
}

/// Fetcher that never leaves the process: every URL is a dead end unless
/// listed in `hops`.
#[derive(Default)]
pub struct StaticHopFetcher {
    pub hops: HashMap<String, String>,
    pub calls: std::sync::atomic::AtomicUsize,
}

impl StaticHopFetcher {
    pub fn with_hop(mut self, from: &str, to: &str) -> Self {
        self.hops.insert(from.to_string(), to.to_string());
        self
    }
}

impl HopFetcher for StaticHopFetcher {
    fn next_hop(&self, url: &str) -> Result<Option<String>> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(self.hops.get(url).cloned())
    }
}
