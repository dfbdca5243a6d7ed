//! `kvlease contend`: several handles race for one lock

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kvlease_common::KvError;
use kvlease_lock::LeaseLock;
use kvlease_store::CasStore;

use crate::config::{ContendArgs, Settings};

/// Outcome of a contention run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContendReport {
    pub acquisitions: usize,
    pub lost: usize,
    /// Highest number of workers that believed they held the lock at once
    pub max_concurrent: usize,
}

#[derive(Default)]
struct Tally {
    acquisitions: AtomicUsize,
    lost: AtomicUsize,
    holding: AtomicUsize,
    max_concurrent: AtomicUsize,
}

pub async fn run(
    store: CasStore,
    settings: &Settings,
    args: &ContendArgs,
    shutdown: CancellationToken,
) -> anyhow::Result<ContendReport> {
    let holder = settings.holder();
    let tally = Arc::new(Tally::default());
    info!(key = %args.key, workers = args.workers, rounds = args.rounds, holder = %holder, "starting contention run");

    let mut tasks = Vec::with_capacity(args.workers);
    for worker in 0..args.workers {
        let options = settings.lock_options(&format!("{}-{}", holder, worker));
        let lock = LeaseLock::new(store.clone(), args.key.clone(), options)
            .context("invalid lock options")?;
        tasks.push(tokio::spawn(worker_loop(
            lock,
            args.rounds,
            Duration::from_millis(args.hold_ms),
            tally.clone(),
            shutdown.clone(),
        )));
    }

    for task in tasks {
        task.await.context("contention worker panicked")??;
    }

    let report = ContendReport {
        acquisitions: tally.acquisitions.load(Ordering::SeqCst),
        lost: tally.lost.load(Ordering::SeqCst),
        max_concurrent: tally.max_concurrent.load(Ordering::SeqCst),
    };
    info!(
        acquisitions = report.acquisitions,
        lost = report.lost,
        max_concurrent = report.max_concurrent,
        "contention run finished"
    );
    if report.max_concurrent > 1 {
        bail!(
            "mutual exclusion violated: {} holders at once",
            report.max_concurrent
        );
    }
    Ok(report)
}

async fn worker_loop(
    mut lock: LeaseLock,
    rounds: usize,
    hold: Duration,
    tally: Arc<Tally>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    for _ in 0..rounds {
        let lost = match lock.lock(&shutdown).await {
            Ok(lost) => lost,
            Err(KvError::AcquireCancelled) => break,
            Err(e) => return Err(e).context("lock acquire failed"),
        };

        tally.acquisitions.fetch_add(1, Ordering::SeqCst);
        let holding = tally.holding.fetch_add(1, Ordering::SeqCst) + 1;
        tally.max_concurrent.fetch_max(holding, Ordering::SeqCst);

        tokio::select! {
            _ = tokio::time::sleep(hold) => {}
            _ = lost.lost() => {
                if !shutdown.is_cancelled() {
                    warn!(key = lock.key(), reason = ?lost.reason(), "lock lost while working");
                    tally.lost.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        tally.holding.fetch_sub(1, Ordering::SeqCst);
        lock.unlock(&shutdown)
            .await
            .context("lock release failed")?;
        if shutdown.is_cancelled() {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvlease_store::MemoryBackend;

    fn args(workers: usize, rounds: usize) -> ContendArgs {
        ContendArgs {
            key: "mylock".to_string(),
            workers,
            rounds,
            hold_ms: 5,
        }
    }

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.lock.retry_interval_ms = 5;
        settings
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_contention_is_exclusive() {
        let backend = Arc::new(MemoryBackend::new());
        let store = CasStore::new(backend.clone()).with_change_feed(backend.clone());

        let report = run(store, &settings(), &args(3, 2), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.acquisitions, 6);
        assert_eq!(report.max_concurrent, 1);
        assert_eq!(report.lost, 0);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let store = CasStore::new(Arc::new(MemoryBackend::new()));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let report = run(store, &settings(), &args(2, 5), shutdown).await.unwrap();
        assert_eq!(report.acquisitions, 0);
    }
}
