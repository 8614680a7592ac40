//! Whole runs, from a tnetstring capture on disk to records and diagnostics.

use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use adscan_processing::aggregator::Engine;
use adscan_processing::blobs::FsBlobStore;
use adscan_processing::classifier::Classifier;
use adscan_processing::db::SqliteStore;
use adscan_processing::lookups::{CachedLookups, LookupTables, MemoryLookups};
use adscan_processing::redirect::{MemoryRedirectCache, RedirectCache, RedirectResolver, StaticHopFetcher};
use adscan_processing::store::MemorySink;
use adscan_processing::tnetstring::{dump, Value};

const PUBLISHER: &str = "com.pub.game";

// ── capture fixtures ─────────────────────────────────────────────────────

fn s(v: &str) -> Value {
    Value::Str(v.to_string())
}

/// One HTTPS flow as the proxy writes it.
fn flow(id: &str, offset_secs: f64, url: &str, mime: &str, body: &[u8]) -> Value {
    let parsed = url::Url::parse(url).unwrap();
    let path = match parsed.query() {
        Some(q) => format!("{}?{q}", parsed.path()),
        None => parsed.path().to_string(),
    };
    Value::Dict(vec![
        ("type".into(), s("http")),
        ("id".into(), s(id)),
        (
            "request".into(),
            Value::Dict(vec![
                ("host".into(), s(parsed.host_str().unwrap())),
                ("port".into(), Value::Int(443)),
                ("scheme".into(), s("https")),
                ("method".into(), s("GET")),
                ("path".into(), s(&path)),
                ("headers".into(), Value::List(vec![])),
                ("content".into(), Value::Bytes(vec![])),
                ("timestamp_start".into(), Value::Float(1_700_000_000.0 + offset_secs)),
            ]),
        ),
        (
            "response".into(),
            Value::Dict(vec![
                ("status_code".into(), Value::Int(200)),
                (
                    "headers".into(),
                    Value::List(vec![Value::List(vec![s("Content-Type"), s(mime)])]),
                ),
                ("content".into(), Value::Bytes(body.to_vec())),
            ]),
        ),
    ])
}

fn write_capture(dir: &Path, name: &str, flows: &[Value]) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    for f in flows {
        file.write_all(&dump(f)).unwrap();
    }
    path
}

fn vungle_response(advertiser: &str, creative_url: &str) -> Vec<u8> {
    format!(
        r#"{{"ads":[{{"ad_markup":{{"ad_market_id":"{advertiser}","tpat":{{"clickUrl":["https://app.adjust.com/abc"]}},"templateSettings":{{"cacheable_replacements":{{"MAIN_VIDEO":{{"url":"{creative_url}"}}}}}}}}}}]}}"#
    )
    .into_bytes()
}

fn png_bytes() -> Vec<u8> {
    let img = image::ImageBuffer::from_fn(64, 48, |x, y| image::Luma([((x * 5 + y * 3) % 256) as u8]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

// ── engine fixtures ──────────────────────────────────────────────────────

fn lookups() -> MemoryLookups {
    MemoryLookups::default()
        .with_ad_domains(&["vungle.com", "smallnet.io"])
        .with_mmp_domains(&["adjust.com", "appsflyer.com"])
        .with_store_app(PUBLISHER, 1)
        .with_store_app("com.example.advertiser", 2)
        .with_store_app("com.foo.bar", 3)
        .with_store_app("com.hop.adv", 4)
}

struct Harness {
    engine: Engine,
    sink: Arc<MemorySink>,
    fetcher: Arc<StaticHopFetcher>,
    blob_dir: tempfile::TempDir,
}

fn harness(lookups: MemoryLookups, fetcher: StaticHopFetcher) -> Harness {
    let sink = Arc::new(MemorySink::default());
    let fetcher = Arc::new(fetcher);
    let blob_dir = tempfile::tempdir().unwrap();
    let redirects = Arc::new(RedirectResolver::new(
        fetcher.clone(),
        Arc::new(MemoryRedirectCache::default()),
        5,
    ));
    let engine = Engine::new(
        Arc::new(CachedLookups::new(Arc::new(lookups), Duration::from_secs(300))),
        sink.clone(),
        Arc::new(FsBlobStore::new(blob_dir.path())),
        redirects,
    )
    .with_classifier(Classifier::new(32, Vec::new()));
    Harness {
        engine,
        sink,
        fetcher,
        blob_dir,
    }
}

// ── scenarios ────────────────────────────────────────────────────────────

#[test]
fn test_vungle_capture_is_attributed() {
    let dir = tempfile::tempdir().unwrap();
    let creative_url = "https://cdn-lb.vungle.com/zen/main_video_9f3e2a.mp4";
    let capture = write_capture(
        dir.path(),
        "com.pub.game_11.log",
        &[
            flow("f1", 0.0, "https://api.vungle.com/api/v5/ads", "application/json", &vungle_response("com.example.advertiser", creative_url)),
            flow("f2", 1.0, creative_url, "video/mp4", &[9u8; 256]),
        ],
    );
    let h = harness(lookups(), StaticHopFetcher::default());

    let summary = h.engine.process_capture(&capture, PUBLISHER, 11).unwrap();
    assert_eq!(summary.exchanges, 2);
    assert_eq!(summary.creatives, 1);
    assert_eq!(summary.attributed, 1);
    assert!(h.sink.diagnostics().is_empty());

    let records = h.sink.records();
    assert_eq!(records.len(), 1);
    let r = &records[0];
    assert_eq!(r.publisher_app_id, 1);
    assert_eq!(r.advertiser_app_id, 2);
    assert_eq!(r.run_id, 11);
    assert_eq!(h.sink.domain_name(r.initiating_domain_id).as_deref(), Some("vungle.com"));
    assert_eq!(r.mmp_domain_id.and_then(|id| h.sink.domain_name(id)).as_deref(), Some("adjust.com"));
    assert_eq!(r.mmp_urls, vec!["https://app.adjust.com/abc".to_string()]);

    let md5 = format!("{:x}", md5::compute([9u8; 256]));
    let blob = h.blob_dir.path().join("com.example.advertiser").join(format!("{md5}.mp4"));
    assert_eq!(std::fs::read(blob).unwrap(), vec![9u8; 256]);
}

#[test]
fn test_market_link_in_unknown_network() {
    let dir = tempfile::tempdir().unwrap();
    let image = png_bytes();
    let body = r#"<html><img src="https://img.smallnet.io/c/banner_55aa10.png"><a href="market://details?id=com.foo.bar&referrer=xyz">Install</a></html>"#;
    let capture = write_capture(
        dir.path(),
        "com.pub.game_12.log",
        &[
            flow("f1", 0.0, "https://ads.smallnet.io/serve", "text/html", body.as_bytes()),
            flow("f2", 1.0, "https://img.smallnet.io/c/banner_55aa10.png", "image/png", &image),
        ],
    );
    let h = harness(lookups(), StaticHopFetcher::default());

    let summary = h.engine.process_capture(&capture, PUBLISHER, 12).unwrap();
    assert_eq!(summary.attributed, 1, "{:?}", h.sink.diagnostics());
    assert_eq!(h.sink.records()[0].advertiser_app_id, 3);
    let assets = h.sink.assets();
    assert_eq!(assets[0].file_extension, "png");
    assert!(assets[0].phash.is_some());
}

#[test]
fn test_self_attribution_for_every_creative() {
    let dir = tempfile::tempdir().unwrap();
    let first = "https://cdn-lb.vungle.com/zen/selfie_one_01.mp4";
    let second = "https://cdn-lb.vungle.com/zen/selfie_two_02.mp4";
    let capture = write_capture(
        dir.path(),
        "com.pub.game_13.log",
        &[
            flow("f1", 0.0, "https://api.vungle.com/api/v5/ads", "application/json", &vungle_response(PUBLISHER, first)),
            flow("f2", 1.0, first, "video/mp4", &[1u8; 128]),
            flow("f3", 2.0, "https://api.vungle.com/api/v5/ads", "application/json", &vungle_response(PUBLISHER, second)),
            flow("f4", 3.0, second, "video/mp4", &[2u8; 128]),
        ],
    );
    let h = harness(lookups(), StaticHopFetcher::default());

    let summary = h.engine.process_capture(&capture, PUBLISHER, 13).unwrap();
    assert_eq!(summary.creatives, 2);
    assert_eq!(summary.attributed, 0);
    assert!(h.sink.records().is_empty());

    let diags = h.sink.diagnostics();
    assert_eq!(diags.len(), 2);
    for d in &diags {
        assert!(d.error_message.contains("identified publisher"), "{}", d.error_message);
        assert_eq!(d.run_id, 13);
        assert_eq!(d.tld.as_deref(), Some("vungle.com"));
    }
}

#[test]
fn test_no_creatives_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let capture = write_capture(
        dir.path(),
        "com.pub.game_14.log",
        &[
            flow("f1", 0.0, "https://api.vungle.com/config", "application/json", br#"{"ok":true}"#),
            flow("f2", 1.0, "https://example.com/index.html", "text/html", &[b'a'; 512]),
        ],
    );
    let h = harness(lookups(), StaticHopFetcher::default());

    let summary = h.engine.process_capture(&capture, PUBLISHER, 14).unwrap();
    assert_eq!(summary.exchanges, 2);
    assert_eq!(summary.creatives, 0);
    assert_eq!(summary.diagnostics, 0);
    assert!(h.sink.diagnostics().is_empty());
}

#[test]
fn test_unreadable_and_empty_captures() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(lookups(), StaticHopFetcher::default());

    let garbage = dir.path().join("com.pub.game_15.log");
    std::fs::write(&garbage, b"not a flow dump").unwrap();
    assert_eq!(h.engine.process_capture(&garbage, PUBLISHER, 15).unwrap().diagnostics, 1);

    let empty = write_capture(dir.path(), "com.pub.game_16.log", &[]);
    assert_eq!(h.engine.process_capture(&empty, PUBLISHER, 16).unwrap().diagnostics, 1);

    let diags = h.sink.diagnostics();
    assert_eq!(diags.len(), 2);
    assert!(diags.iter().all(|d| d.error_message.starts_with("Capture unreadable")));
    assert_eq!(diags[1].run_id, 16);
}

#[test]
fn test_click_redirects_resolved_once_per_run() {
    let click = "https://api.youappi.com/v1/e/click?cid=77";
    let body = format!(r#"{{"creative":"https://img.smallnet.io/c/promo_778899.mp4","click":"{click}"}}"#);
    let flows = [
        flow("f1", 0.0, "https://ads.smallnet.io/bid", "application/json", body.as_bytes()),
        flow("f2", 1.0, "https://img.smallnet.io/c/promo_778899.mp4", "video/mp4", &[4u8; 100]),
        flow("f3", 2.0, "https://img.smallnet.io/c/promo_778899.mp4", "video/mp4", &[5u8; 140]),
    ];
    let dir = tempfile::tempdir().unwrap();
    let capture = write_capture(dir.path(), "com.pub.game_17.log", &flows);
    let fetcher = StaticHopFetcher::default()
        .with_hop(click, "https://app.appsflyer.com/com.hop.adv?pid=smallnet")
        .with_hop(
            "https://app.appsflyer.com/com.hop.adv?pid=smallnet",
            "https://play.google.com/store/apps/details?id=com.hop.adv",
        );
    let h = harness(lookups(), fetcher);

    let summary = h.engine.process_capture(&capture, PUBLISHER, 17).unwrap();
    assert_eq!(summary.attributed, 2, "{:?}", h.sink.diagnostics());
    let calls = h.fetcher.calls.load(Ordering::Relaxed);
    // Two hops plus the dead end after the store page.
    assert_eq!(calls, 3);

    h.engine.process_capture(&capture, PUBLISHER, 17).unwrap();
    assert_eq!(h.fetcher.calls.load(Ordering::Relaxed), calls);
    assert!(h.sink.records().iter().all(|r| r.advertiser_app_id == 4));
}

#[test]
fn test_click_redirect_to_market_url_attributes_advertiser() {
    let click = "https://api.youappi.com/v1/e/click?cid=31";
    let body = format!(r#"{{"creative":"https://img.smallnet.io/c/promo_556677.mp4","click":"{click}"}}"#);
    let dir = tempfile::tempdir().unwrap();
    let capture = write_capture(
        dir.path(),
        "com.pub.game_18.log",
        &[
            flow("f1", 0.0, "https://ads.smallnet.io/bid", "application/json", body.as_bytes()),
            flow("f2", 1.0, "https://img.smallnet.io/c/promo_556677.mp4", "video/mp4", &[7u8; 120]),
        ],
    );
    let fetcher = StaticHopFetcher::default()
        .with_hop(click, "https://app.adjust.com/xyz")
        .with_hop("https://app.adjust.com/xyz", "market://details?id=com.foo.bar");
    let h = harness(lookups(), fetcher);

    let summary = h.engine.process_capture(&capture, PUBLISHER, 18).unwrap();
    assert_eq!(summary.attributed, 1, "{:?}", h.sink.diagnostics());
    let records = h.sink.records();
    assert_eq!(records[0].advertiser_app_id, 3);
    assert!(records[0].mmp_urls.iter().any(|u| u == "https://app.adjust.com/xyz"));
    // The store link ends the chain; nothing is fetched past it.
    assert_eq!(h.fetcher.calls.load(Ordering::Relaxed), 2);
}

#[test]
fn test_sqlite_backed_run() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("adscan.db")).unwrap());
    let publisher = store.add_store_app(PUBLISHER).unwrap();
    let advertiser = store.add_store_app("com.example.advertiser").unwrap();
    store.add_known_domain("vungle.com", true, false).unwrap();
    store.add_known_domain("adjust.com", false, true).unwrap();

    let creative_url = "https://cdn-lb.vungle.com/zen/main_video_5511aa.mp4";
    let capture = write_capture(
        dir.path(),
        "com.pub.game_21.log",
        &[
            flow("f1", 0.0, "https://api.vungle.com/api/v5/ads", "application/json", &vungle_response("com.example.advertiser", creative_url)),
            flow("f2", 1.0, creative_url, "video/mp4", &[3u8; 256]),
            flow("f3", 2.0, "https://cdn-lb.vungle.com/zen/orphan_999999.mp4", "video/mp4", &[6u8; 256]),
        ],
    );

    let lookups: Arc<dyn LookupTables> = store.clone();
    let cache: Arc<dyn RedirectCache> = store.clone();
    let engine = Engine::new(
        Arc::new(CachedLookups::new(lookups, Duration::from_secs(300))),
        store.clone(),
        Arc::new(FsBlobStore::new(dir.path().join("creatives"))),
        Arc::new(RedirectResolver::new(Arc::new(StaticHopFetcher::default()), cache, 5)),
    )
    .with_classifier(Classifier::new(32, Vec::new()));

    let summary = engine.process_capture(&capture, PUBLISHER, 21).unwrap();
    assert_eq!(summary.attributed, 1);
    assert_eq!(summary.diagnostics, 1);
    assert_eq!(store.count_records_for_run(21).unwrap(), 1);
    assert_eq!(store.count_diagnostics_for_run(21).unwrap(), 1);
    assert!(publisher != advertiser);

    // A rerun rewrites the same record instead of adding one.
    engine.process_capture(&capture, PUBLISHER, 21).unwrap();
    assert_eq!(store.count_records_for_run(21).unwrap(), 1);
}
