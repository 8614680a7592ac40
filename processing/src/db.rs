//! SQLite database layer.
//!
//! One database file backs the lookup tables, the attribution sinks and
//! the redirect-chain cache.  Connections are opened per operation so the
//! store can be shared by every worker thread; writes are retried when the
//! database is busy.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use adscan_common::record::{CreativeAsset, CreativeAttributionRecord, ErrorDiagnostic};

use crate::lookups::LookupTables;
use crate::redirect::RedirectCache;
use crate::store::AttributionSink;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_ATTEMPTS: u32 = 3;

pub struct SqliteStore {
    path: PathBuf,
    retry_delay: Duration,
}

impl SqliteStore {
    /// Open (and create if needed) the database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        initialize(db_path)?;
        Ok(Self {
            path: db_path.to_path_buf(),
            retry_delay: Duration::from_secs(2),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("Cannot open database: {}", self.path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Run a write, retrying while the database is busy or locked.  Any
    /// other failure is returned at once.
    fn write<T>(&self, what: &str, mut op: impl FnMut(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            let conn = self.connect()?;
            match op(&conn) {
                Ok(v) => return Ok(v),
                Err(e) if is_busy(&e) && attempt < WRITE_ATTEMPTS => {
                    warn!("Database busy (attempt {attempt}/{WRITE_ATTEMPTS}) on {what}: {e}");
                    drop(conn);
                    std::thread::sleep(self.retry_delay);
                    attempt += 1;
                }
                Err(e) => return Err(e).with_context(|| format!("Failed to {what}")),
            }
        }
    }

    // ── seeding (tooling and tests) ─────────────────────────────────────

    pub fn add_store_app(&self, store_id: &str) -> Result<i64> {
        self.write("insert store app", |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO store_apps (store_id) VALUES (?1)",
                params![store_id],
            )?;
            conn.query_row(
                "SELECT id FROM store_apps WHERE store_id = ?1",
                params![store_id],
                |row| row.get(0),
            )
        })
    }

    /// Mark `domain` as a known ad network and/or attribution partner.
    pub fn add_known_domain(&self, domain: &str, is_ad_network: bool, is_mmp: bool) -> Result<i64> {
        self.write("insert known domain", |conn| {
            conn.execute(
                "INSERT INTO domains (domain_name, is_ad_network, is_mmp) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(domain_name) DO UPDATE SET \
                 is_ad_network = MAX(is_ad_network, excluded.is_ad_network), \
                 is_mmp = MAX(is_mmp, excluded.is_mmp)",
                params![domain, is_ad_network, is_mmp],
            )?;
            domain_id(conn, domain)
        })
    }

    pub fn add_sdk_key(&self, publisher_store_id: &str, sdk_key: &str) -> Result<()> {
        self.write("insert sdk key", |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO ad_network_sdk_keys (store_id, sdk_key) VALUES (?1, ?2)",
                params![publisher_store_id, sdk_key],
            )
            .map(|_| ())
        })
    }

    // ── reporting ───────────────────────────────────────────────────────

    pub fn count_records_for_run(&self, run_id: i64) -> Result<u64> {
        count(&self.connect()?, "SELECT COUNT(*) FROM creative_records WHERE run_id = ?1", run_id)
    }

    pub fn count_diagnostics_for_run(&self, run_id: i64) -> Result<u64> {
        count(&self.connect()?, "SELECT COUNT(*) FROM creative_scan_results WHERE run_id = ?1", run_id)
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if matches!(f.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// Create every table (and index) if it doesn't exist.
pub fn initialize(db_path: &Path) -> Result<()> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(db_path)
        .with_context(|| format!("Cannot open database: {}", db_path.display()))?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS domains (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            domain_name    TEXT NOT NULL UNIQUE,
            is_ad_network  INTEGER NOT NULL DEFAULT 0,
            is_mmp         INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS store_apps (
            id        INTEGER PRIMARY KEY AUTOINCREMENT,
            store_id  TEXT NOT NULL UNIQUE
        );
        CREATE INDEX IF NOT EXISTS store_apps_store_id_lower ON store_apps (lower(store_id));
        CREATE TABLE IF NOT EXISTS ad_network_sdk_keys (
            store_id  TEXT NOT NULL,
            sdk_key   TEXT NOT NULL,
            PRIMARY KEY (store_id, sdk_key)
        );
        CREATE TABLE IF NOT EXISTS creative_assets (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            advertiser_app_id  INTEGER NOT NULL,
            md5_hash           TEXT NOT NULL,
            file_extension     TEXT NOT NULL,
            phash              TEXT,
            UNIQUE (advertiser_app_id, md5_hash)
        );
        CREATE TABLE IF NOT EXISTS creative_records (
            id                        INTEGER PRIMARY KEY AUTOINCREMENT,
            publisher_app_id          INTEGER NOT NULL,
            advertiser_app_id         INTEGER NOT NULL,
            creative_asset_id         INTEGER NOT NULL,
            run_id                    INTEGER NOT NULL,
            initiating_domain_id      INTEGER NOT NULL,
            host_domain_id            INTEGER NOT NULL,
            mmp_domain_id             INTEGER,
            mmp_urls                  TEXT NOT NULL DEFAULT '[]',
            additional_ad_domain_ids  TEXT NOT NULL DEFAULT '[]',
            updated_at                TEXT NOT NULL,
            UNIQUE (publisher_app_id, creative_asset_id, run_id, initiating_domain_id, host_domain_id)
        );
        CREATE INDEX IF NOT EXISTS creative_records_run_id ON creative_records (run_id);
        CREATE TABLE IF NOT EXISTS creative_scan_results (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id              INTEGER NOT NULL,
            publisher_store_id  TEXT NOT NULL,
            url                 TEXT,
            tld                 TEXT,
            file_extension      TEXT,
            creative_size       INTEGER,
            error_message       TEXT NOT NULL,
            created_at          TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS creative_scan_results_run_id ON creative_scan_results (run_id);
        CREATE TABLE IF NOT EXISTS url_redirect_chains (
            run_id  INTEGER NOT NULL,
            url     TEXT NOT NULL,
            chain   TEXT NOT NULL,
            PRIMARY KEY (run_id, url)
        );
    ",
    )
    .context("Failed to create schema")?;

    info!("Database schema verified");
    Ok(())
}

fn domain_id(conn: &Connection, domain: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT id FROM domains WHERE domain_name = ?1",
        params![domain],
        |row| row.get(0),
    )
}

fn count(conn: &Connection, sql: &str, run_id: i64) -> Result<u64> {
    let n: i64 = conn.query_row(sql, params![run_id], |row| row.get(0))?;
    Ok(n.max(0) as u64)
}

fn string_set(conn: &Connection, sql: &str) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

// ── lookups ──────────────────────────────────────────────────────────────

impl LookupTables for SqliteStore {
    fn known_ad_domains(&self) -> Result<HashSet<String>> {
        string_set(&self.connect()?, "SELECT domain_name FROM domains WHERE is_ad_network = 1")
    }

    fn known_mmp_domains(&self) -> Result<HashSet<String>> {
        string_set(&self.connect()?, "SELECT domain_name FROM domains WHERE is_mmp = 1")
    }

    fn sdk_keys_for_app(&self, publisher_store_id: &str) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT sdk_key FROM ad_network_sdk_keys WHERE store_id = ?1 ORDER BY sdk_key")?;
        let own: Vec<String> = stmt
            .query_map(params![publisher_store_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        if !own.is_empty() {
            return Ok(own);
        }
        let mut stmt = conn.prepare("SELECT DISTINCT sdk_key FROM ad_network_sdk_keys ORDER BY sdk_key")?;
        let all = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(all)
    }

    fn resolve_store_app_id(&self, store_id: &str) -> Result<Option<i64>> {
        let id = self
            .connect()?
            .query_row(
                "SELECT id FROM store_apps WHERE lower(store_id) = lower(?1) ORDER BY id LIMIT 1",
                params![store_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }
}

// ── sinks ────────────────────────────────────────────────────────────────

impl AttributionSink for SqliteStore {
    fn upsert_domain(&self, domain: &str) -> Result<i64> {
        self.write("upsert domain", |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO domains (domain_name) VALUES (?1)",
                params![domain],
            )?;
            domain_id(conn, domain)
        })
    }

    fn upsert_creative_asset(&self, asset: &CreativeAsset) -> Result<i64> {
        self.write("upsert creative asset", |conn| {
            conn.execute(
                "INSERT INTO creative_assets (advertiser_app_id, md5_hash, file_extension, phash) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(advertiser_app_id, md5_hash) DO UPDATE SET \
                 phash = COALESCE(creative_assets.phash, excluded.phash)",
                params![asset.advertiser_app_id, asset.md5_hash, asset.file_extension, asset.phash],
            )?;
            conn.query_row(
                "SELECT id FROM creative_assets WHERE advertiser_app_id = ?1 AND md5_hash = ?2",
                params![asset.advertiser_app_id, asset.md5_hash],
                |row| row.get(0),
            )
        })
    }

    fn upsert_creative_record(&self, r: &CreativeAttributionRecord) -> Result<()> {
        let mmp_urls = serde_json::to_string(&r.mmp_urls)?;
        let additional = serde_json::to_string(&r.additional_ad_domain_ids)?;
        let updated_at = r.updated_at.to_rfc3339();
        self.write("upsert creative record", |conn| {
            conn.execute(
                "INSERT INTO creative_records (publisher_app_id, advertiser_app_id, creative_asset_id, \
                 run_id, initiating_domain_id, host_domain_id, mmp_domain_id, mmp_urls, \
                 additional_ad_domain_ids, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                 ON CONFLICT(publisher_app_id, creative_asset_id, run_id, initiating_domain_id, host_domain_id) \
                 DO UPDATE SET advertiser_app_id = excluded.advertiser_app_id, \
                 mmp_domain_id = excluded.mmp_domain_id, mmp_urls = excluded.mmp_urls, \
                 additional_ad_domain_ids = excluded.additional_ad_domain_ids, \
                 updated_at = excluded.updated_at",
                params![
                    r.publisher_app_id,
                    r.advertiser_app_id,
                    r.creative_asset_id,
                    r.run_id,
                    r.initiating_domain_id,
                    r.host_domain_id,
                    r.mmp_domain_id,
                    mmp_urls,
                    additional,
                    updated_at,
                ],
            )
            .map(|_| ())
        })
    }

    fn log_scan_result(&self, d: &ErrorDiagnostic) -> Result<()> {
        let size = d.creative_size.map(|s| s as i64);
        self.write("log scan result", |conn| {
            conn.execute(
                "INSERT INTO creative_scan_results \
                 (run_id, publisher_store_id, url, tld, file_extension, creative_size, error_message) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    d.run_id,
                    d.publisher_store_id,
                    d.url,
                    d.tld,
                    d.file_extension,
                    size,
                    d.error_message,
                ],
            )
            .map(|_| ())
        })
    }

    fn has_records_for_run(&self, run_id: i64) -> Result<bool> {
        Ok(self.count_records_for_run(run_id)? > 0)
    }
}

// ── redirect cache ───────────────────────────────────────────────────────

impl RedirectCache for SqliteStore {
    fn cached_chain(&self, run_id: i64, url: &str) -> Result<Option<Vec<String>>> {
        let chain: Option<String> = self
            .connect()?
            .query_row(
                "SELECT chain FROM url_redirect_chains WHERE run_id = ?1 AND url = ?2",
                params![run_id, url],
                |row| row.get(0),
            )
            .optional()?;
        chain
            .map(|c| serde_json::from_str(&c).context("Corrupt redirect chain"))
            .transpose()
    }

    fn store_chain(&self, run_id: i64, url: &str, chain: &[String]) -> Result<()> {
        let json = serde_json::to_string(chain)?;
        self.write("cache redirect chain", |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO url_redirect_chains (run_id, url, chain) VALUES (?1, ?2, ?3)",
                params![run_id, url, json],
            )
            .map(|_| ())
        })
    }
}
