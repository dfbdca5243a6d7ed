//! `kvlease delete-tree`: seed a prefix and delete it with bounded retry

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::time::Instant;
use tracing::info;

use kvlease_common::WriteOptions;
use kvlease_store::{CasStore, DeleteTreeOptions, MemoryBackend};

use crate::config::DeleteTreeArgs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteTreeReport {
    pub seeded: usize,
    pub batch_calls: usize,
    pub elapsed: Duration,
}

pub async fn run(
    store: &CasStore,
    backend: &Arc<MemoryBackend>,
    args: &DeleteTreeArgs,
) -> anyhow::Result<DeleteTreeReport> {
    for i in 0..args.keys {
        let key = format!("{}{}", args.prefix, i);
        store
            .put(&key, format!("item-{}", i).as_bytes(), WriteOptions::default())
            .await
            .with_context(|| format!("failed to seed {}", key))?;
    }
    backend.throttle_batch_deletes(args.throttle.iter().copied());

    let options = DeleteTreeOptions {
        retry_interval: Duration::from_millis(args.retry_ms),
        deadline: Duration::from_millis(args.deadline_ms),
        ..Default::default()
    };
    let calls_before = backend.batch_delete_calls();
    let start = Instant::now();
    store
        .delete_tree_with(&args.prefix, options)
        .await
        .with_context(|| format!("failed to delete tree {}", args.prefix))?;

    let report = DeleteTreeReport {
        seeded: args.keys,
        batch_calls: backend.batch_delete_calls() - calls_before,
        elapsed: start.elapsed(),
    };
    info!(
        prefix = %args.prefix,
        seeded = report.seeded,
        batch_calls = report.batch_calls,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "tree deleted"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvlease_common::KvError;

    fn args(throttle: Vec<usize>, deadline_ms: u64) -> DeleteTreeArgs {
        DeleteTreeArgs {
            prefix: "jobs/".to_string(),
            keys: 5,
            throttle,
            retry_ms: 1_000,
            deadline_ms,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_then_drain() {
        let backend = Arc::new(MemoryBackend::new());
        let store = CasStore::new(backend.clone());

        let report = run(&store, &backend, &args(vec![2, 0], 30_000))
            .await
            .unwrap();
        assert_eq!(report.seeded, 5);
        assert_eq!(report.batch_calls, 2);
        assert_eq!(report.elapsed, Duration::from_secs(1));
        assert!(backend.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_surfaces_error() {
        let backend = Arc::new(MemoryBackend::new());
        backend.stall_batch_deletes(true);
        let store = CasStore::new(backend.clone());

        let err = run(&store, &backend, &args(Vec::new(), 3_000))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KvError>(),
            Some(KvError::DeleteTreeTimeout { .. })
        ));
        assert_eq!(backend.len(), 5);
    }
}
