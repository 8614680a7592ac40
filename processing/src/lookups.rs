//! Lookup services: known ad / MMP domains, SDK keys and store-app ids.
//!
//! The tables change rarely, so workers share a [`CachedLookups`] that
//! serves snapshots for up to `ttl` before asking the backing store again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::debug;

/// Contract of the lookup backend (SQLite in production, memory in tests).
pub trait LookupTables: Send + Sync {
    fn known_ad_domains(&self) -> Result<HashSet<String>>;
    fn known_mmp_domains(&self) -> Result<HashSet<String>>;
    /// SDK keys registered for a publisher app; all known keys when the app
    /// has none of its own.
    fn sdk_keys_for_app(&self, publisher_store_id: &str) -> Result<Vec<String>>;
    /// Case-insensitive store-id lookup.
    fn resolve_store_app_id(&self, store_id: &str) -> Result<Option<i64>>;
}

/// Snapshot of the two domain tables used by URL classification.
#[derive(Debug, Clone, Default)]
pub struct DomainTables {
    ad_domains: HashSet<String>,
    mmp_domains: HashSet<String>,
}

impl DomainTables {
    pub fn new<A, M>(ad_domains: A, mmp_domains: M) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        M: IntoIterator,
        M::Item: Into<String>,
    {
        Self {
            ad_domains: ad_domains.into_iter().map(Into::into).collect(),
            mmp_domains: mmp_domains.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_ad_domain(&self, tld: &str) -> bool {
        self.ad_domains.contains(tld)
    }

    pub fn is_mmp(&self, tld: &str) -> bool {
        self.mmp_domains.contains(tld)
    }
}

// ── cache ────────────────────────────────────────────────────────────────

struct Timed<T> {
    loaded_at: Instant,
    value: Arc<T>,
}

impl<T> Timed<T> {
    fn fresh(&self, ttl: Duration) -> Option<Arc<T>> {
        (self.loaded_at.elapsed() < ttl).then(|| Arc::clone(&self.value))
    }
}

/// Read-mostly cache in front of a [`LookupTables`] backend.
pub struct CachedLookups {
    inner: Arc<dyn LookupTables>,
    ttl: Duration,
    domains: RwLock<Option<Timed<DomainTables>>>,
    sdk_keys: RwLock<HashMap<String, Timed<Vec<String>>>>,
    store_apps: RwLock<HashMap<String, i64>>,
}

impl CachedLookups {
    pub fn new(inner: Arc<dyn LookupTables>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            domains: RwLock::new(None),
            sdk_keys: RwLock::new(HashMap::new()),
            store_apps: RwLock::new(HashMap::new()),
        }
    }

    pub fn domain_tables(&self) -> Result<Arc<DomainTables>> {
        if let Ok(guard) = self.domains.read() {
            if let Some(hit) = guard.as_ref().and_then(|t| t.fresh(self.ttl)) {
                return Ok(hit);
            }
        }
        let tables = Arc::new(DomainTables {
            ad_domains: self.inner.known_ad_domains()?,
            mmp_domains: self.inner.known_mmp_domains()?,
        });
        debug!(
            "Domain tables refreshed ({} ad, {} mmp)",
            tables.ad_domains.len(),
            tables.mmp_domains.len()
        );
        if let Ok(mut guard) = self.domains.write() {
            *guard = Some(Timed {
                loaded_at: Instant::now(),
                value: Arc::clone(&tables),
            });
        }
        Ok(tables)
    }

    pub fn sdk_keys_for_app(&self, publisher_store_id: &str) -> Result<Arc<Vec<String>>> {
        if let Ok(guard) = self.sdk_keys.read() {
            if let Some(hit) = guard.get(publisher_store_id).and_then(|t| t.fresh(self.ttl)) {
                return Ok(hit);
            }
        }
        let keys = Arc::new(self.inner.sdk_keys_for_app(publisher_store_id)?);
        if let Ok(mut guard) = self.sdk_keys.write() {
            guard.insert(
                publisher_store_id.to_string(),
                Timed {
                    loaded_at: Instant::now(),
                    value: Arc::clone(&keys),
                },
            );
        }
        Ok(keys)
    }

    /// Store-app ids never change once assigned, so hits are kept forever;
    /// misses are always re-queried.
    pub fn resolve_store_app_id(&self, store_id: &str) -> Result<Option<i64>> {
        let key = store_id.to_lowercase();
        if let Some(id) = self.store_apps.read().ok().and_then(|g| g.get(&key).copied()) {
            return Ok(Some(id));
        }
        let found = self.inner.resolve_store_app_id(store_id)?;
        if let Some(id) = found {
            if let Ok(mut guard) = self.store_apps.write() {
                guard.insert(key, id);
            }
        }
        Ok(found)
    }
}

// ── in-memory backend ────────────────────────────────────────────────────

/// In-memory lookup tables for tests and one-off tooling.
#[derive(Debug, Default)]
pub struct MemoryLookups {
    pub ad_domains: HashSet<String>,
    pub mmp_domains: HashSet<String>,
    /// publisher store id → SDK keys
    pub sdk_keys: HashMap<String, Vec<String>>,
    /// lower-cased store id → app id
    pub store_apps: HashMap<String, i64>,
    /// Number of domain-table loads served (cache observability in tests).
    pub domain_loads: AtomicUsize,
}

impl MemoryLookups {
    pub fn with_ad_domains(mut self, domains: &[&str]) -> Self {
        self.ad_domains.extend(domains.iter().map(|d| d.to_string()));
        self
    }

    pub fn with_mmp_domains(mut self, domains: &[&str]) -> Self {
        self.mmp_domains.extend(domains.iter().map(|d| d.to_string()));
        self
    }

    pub fn with_store_app(mut self, store_id: &str, app_id: i64) -> Self {
        self.store_apps.insert(store_id.to_lowercase(), app_id);
        self
    }

    pub fn with_sdk_key(mut self, publisher_store_id: &str, key: &str) -> Self {
        self.sdk_keys
            .entry(publisher_store_id.to_string())
            .or_default()
            .push(key.to_string());
        self
    }
}

impl LookupTables for MemoryLookups {
    fn known_ad_domains(&self) -> Result<HashSet<String>> {
        self.domain_loads.fetch_add(1, Ordering::Relaxed);
        Ok(self.ad_domains.clone())
    }

    fn known_mmp_domains(&self) -> Result<HashSet<String>> {
        Ok(self.mmp_domains.clone())
    }

    fn sdk_keys_for_app(&self, publisher_store_id: &str) -> Result<Vec<String>> {
        match self.sdk_keys.get(publisher_store_id) {
            Some(keys) if !keys.is_empty() => Ok(keys.clone()),
            _ => {
                let mut all: Vec<String> = self.sdk_keys.values().flatten().cloned().collect();
                all.sort();
                all.dedup();
                Ok(all)
            }
        }
    }

    fn resolve_store_app_id(&self, store_id: &str) -> Result<Option<i64>> {
        Ok(self.store_apps.get(&store_id.to_lowercase()).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_tables_are_cached_within_ttl() {
        let mem = Arc::new(
            MemoryLookups::default()
                .with_ad_domains(&["vungle.com"])
                .with_mmp_domains(&["adjust.com"]),
        );
        let cached = CachedLookups::new(mem.clone(), Duration::from_secs(60));
        let t1 = cached.domain_tables().unwrap();
        let t2 = cached.domain_tables().unwrap();
        assert!(t1.is_ad_domain("vungle.com"));
        assert!(t2.is_mmp("adjust.com"));
        assert_eq!(mem.domain_loads.load(Ordering::Relaxed), 1);

        let uncached = CachedLookups::new(mem.clone(), Duration::ZERO);
        uncached.domain_tables().unwrap();
        uncached.domain_tables().unwrap();
        assert_eq!(mem.domain_loads.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_store_app_lookup_is_case_insensitive() {
        let mem = Arc::new(MemoryLookups::default().with_store_app("com.Example.App", 7));
        let cached = CachedLookups::new(mem, Duration::from_secs(60));
        assert_eq!(cached.resolve_store_app_id("com.example.app").unwrap(), Some(7));
        assert_eq!(cached.resolve_store_app_id("COM.EXAMPLE.APP").unwrap(), Some(7));
        assert_eq!(cached.resolve_store_app_id("com.unknown").unwrap(), None);
    }

    #[test]
    fn test_sdk_keys_fall_back_to_all_keys() {
        let mem = MemoryLookups::default()
            .with_sdk_key("com.pub.a", "key-a")
            .with_sdk_key("com.pub.b", "key-b");
        assert_eq!(mem.sdk_keys_for_app("com.pub.a").unwrap(), vec!["key-a"]);
        assert_eq!(mem.sdk_keys_for_app("com.pub.z").unwrap(), vec!["key-a", "key-b"]);
    }
}
