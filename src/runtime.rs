//! The long-running daemon: reconciler and sweepers on their own threads.
//!
//! Every worker opens its own store and lock connections. Workers check the
//! stop flag between iterations; nothing is cancelled mid-pass.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{error, info};

use crate::config::Config;
use crate::lock::LockManager;
use crate::log::ActivityLog;
use crate::paths;
use crate::reconciler;
use crate::store::Store;
use crate::sweeper::{self, SweepKind, Sweeper};

const STOP_CHECK: Duration = Duration::from_millis(100);

/// Sleep for `total`, returning early once `stop` is set.
pub fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(STOP_CHECK));
    }
}

/// Run every background loop until `stop` is set, then wait for them.
pub fn run_daemon(
    config: &Config,
    database: PathBuf,
    journal: Arc<ActivityLog>,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    // Schema and WAL setup happen once here, not racing across workers.
    drop(connect(config, &database)?);

    let mut workers: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::new();

    {
        let config = config.clone();
        let database = database.clone();
        let journal = Arc::clone(&journal);
        let stop = Arc::clone(&stop);
        workers.push((
            "reconciler",
            spawn_worker("reconciler", move || {
                let (store, locks) = connect(&config, &database)?;
                let interval = seconds(config.reconciler.interval_secs);
                reconciler::run_loop(
                    &store,
                    &locks,
                    config.match_window(),
                    Some(journal.as_ref()),
                    interval,
                    stop,
                );
                Ok(())
            })?,
        ));
    }

    for kind in SweepKind::ALL {
        let config = config.clone();
        let database = database.clone();
        let journal = Arc::clone(&journal);
        let stop = Arc::clone(&stop);
        let name = kind.as_str();
        workers.push((
            name,
            spawn_worker(name, move || {
                let (store, locks) = connect(&config, &database)?;
                let mux = config.multiplexer();
                let sweeper = Sweeper::new(&store, &locks, &mux, config.sweep_settings())
                    .with_journal(&journal);
                sweeper::run_loop(&sweeper, kind, sweep_interval(&config, kind), stop);
                Ok(())
            })?,
        ));
    }

    info!(database = %database.display(), workers = workers.len(), "daemon running");

    let mut failed = 0;
    for (name, handle) in workers {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(worker = name, error = %format!("{e:#}"), "worker failed");
                failed += 1;
            }
            Err(_) => {
                error!(worker = name, "worker panicked");
                failed += 1;
            }
        }
    }

    info!("daemon stopped");
    if failed > 0 {
        return Err(anyhow!("{failed} daemon worker(s) failed"));
    }
    Ok(())
}

/// Install a Ctrl-C handler that sets the returned flag.
pub fn stop_on_ctrlc() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .ok();
    stop
}

fn connect(config: &Config, database: &std::path::Path) -> Result<(Store, LockManager)> {
    paths::ensure_parent(database)?;
    let store = Store::open(database)
        .with_context(|| format!("failed to open store: {}", database.display()))?;
    let locks = LockManager::open(database, config.lock_settings())
        .with_context(|| format!("failed to open lock table: {}", database.display()))?;
    Ok((store, locks))
}

fn spawn_worker<F>(name: &str, work: F) -> Result<JoinHandle<Result<()>>>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    thread::Builder::new()
        .name(format!("tether-{name}"))
        .spawn(work)
        .with_context(|| format!("failed to spawn {name} thread"))
}

fn sweep_interval(config: &Config, kind: SweepKind) -> Duration {
    let secs = match kind {
        SweepKind::Reaper => config.sweeper.reaper_interval_secs,
        SweepKind::Watchdog => config.sweeper.watchdog_interval_secs,
        SweepKind::Context => config.sweeper.context_interval_secs,
    };
    seconds(secs)
}

fn seconds(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}
