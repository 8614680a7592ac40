//! adscan Processing Worker – attributes every pending capture in
//! CAPTURE_DIR, writes creative records and diagnostics to SQLite.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use adscan_processing::aggregator::Engine;
use adscan_processing::db::SqliteStore;
use adscan_processing::store::AttributionSink;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// One capture waiting for attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RunJob {
    path: PathBuf,
    publisher_store_id: String,
    run_id: i64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| adscan_common::config::Config::default_path().to_string());
    let config =
        adscan_common::config::load(&PathBuf::from(&config_path)).context("Config load failed")?;

    info!(
        "adscan Processing Worker starting (captures={}, workers={})",
        config.capture_dir.display(),
        config.workers
    );

    // ── open database and wire the engine ────────────────────────────
    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    let engine = Arc::new(Engine::from_config(&config, store)?);

    // ── ctrl-c ───────────────────────────────────────────────────────
    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
        info!("Shutdown signal received");
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── queue pending captures ───────────────────────────────────────
    let jobs = pending_runs(&config.capture_dir, engine.sink().as_ref())?;
    if jobs.is_empty() {
        info!("No pending captures in {}", config.capture_dir.display());
        return Ok(());
    }
    info!("{} pending captures", jobs.len());

    let (job_tx, job_rx) = mpsc::channel::<RunJob>();
    for job in jobs {
        job_tx.send(job).context("Job queue closed")?;
    }
    drop(job_tx);
    let job_rx = Arc::new(Mutex::new(job_rx));

    // ── worker threads ───────────────────────────────────────────────
    let mut workers = Vec::with_capacity(config.workers);
    for i in 0..config.workers {
        let engine = Arc::clone(&engine);
        let job_rx = Arc::clone(&job_rx);
        let handle = std::thread::Builder::new()
            .name(format!("worker-{i}"))
            .spawn(move || worker_loop(&engine, &job_rx))
            .context("Cannot spawn worker thread")?;
        workers.push(handle);
    }
    for handle in workers {
        if handle.join().is_err() {
            error!("A worker thread panicked");
        }
    }

    info!("adscan Processing Worker stopped");
    Ok(())
}

fn worker_loop(engine: &Engine, jobs: &Mutex<mpsc::Receiver<RunJob>>) {
    while !SHUTDOWN.load(Ordering::Relaxed) {
        let next = match jobs.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => return,
        };
        let Ok(job) = next else {
            return;
        };
        info!("Processing {} (run {})", job.path.display(), job.run_id);
        match engine.process_capture(&job.path, &job.publisher_store_id, job.run_id) {
            Ok(summary) => info!(
                "{} run {} done: {} exchanges, {} creatives, {} attributed, {} ignored, {} diagnostics",
                job.publisher_store_id,
                job.run_id,
                summary.exchanges,
                summary.creatives,
                summary.attributed,
                summary.ignored,
                summary.diagnostics
            ),
            Err(e) => error!("{} run {} failed: {e:#}", job.publisher_store_id, job.run_id),
        }
    }
}

/// Captures in `dir` whose run has no creative records yet, sorted by path.
fn pending_runs(dir: &Path, sink: &dyn AttributionSink) -> Result<Vec<RunJob>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Cannot read capture dir {}", dir.display()))?;
    let mut jobs = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let Some(job) = parse_capture_path(&path) else {
            warn!("Ignoring capture with unexpected name: {}", path.display());
            continue;
        };
        if sink.has_records_for_run(job.run_id)? {
            info!("Run {} already attributed, skipping", job.run_id);
            continue;
        }
        jobs.push(job);
    }
    jobs.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(jobs)
}

/// `<publisher_store_id>_<run_id>.log`; store ids may contain `_`.
fn parse_capture_path(path: &Path) -> Option<RunJob> {
    let stem = path.file_stem()?.to_str()?;
    let (store_id, run_id) = stem.rsplit_once('_')?;
    if store_id.is_empty() {
        return None;
    }
    Some(RunJob {
        path: path.to_path_buf(),
        publisher_store_id: store_id.to_string(),
        run_id: run_id.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use adscan_processing::store::MemorySink;

    #[test]
    fn test_parse_capture_path() {
        let job = parse_capture_path(Path::new("/caps/com.my_game.app_42.log")).unwrap();
        assert_eq!(job.publisher_store_id, "com.my_game.app");
        assert_eq!(job.run_id, 42);
        assert!(parse_capture_path(Path::new("/caps/com.app.log")).is_none());
        assert!(parse_capture_path(Path::new("/caps/com.app_x.log")).is_none());
        assert!(parse_capture_path(Path::new("/caps/_7.log")).is_none());
    }

    #[test]
    fn test_pending_runs_filters() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["com.a_1.log", "com.b_2.log", "notes.txt", "bad.log"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let sink = MemorySink::default();
        let jobs = pending_runs(dir.path(), &sink).unwrap();
        let ids: Vec<i64> = jobs.iter().map(|j| j.run_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
