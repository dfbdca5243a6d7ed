//! Prefix deletion with bounded retry
//!
//! A batch delete may come back with part of its keys unprocessed. The remainder
//! is resubmitted on a fixed cadence until it drains or the deadline passes; on
//! timeout the leftover keys stay in the backend and are reported in the error.

use std::time::Duration;

use metrics::counter;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, warn};

use kvlease_common::{DELETE_TREE_TIMEOUT_SECONDS, KvError, ReadOptions, Result};

use crate::backend::Backend;
use crate::cas::CasStore;

/// Counter bumped on every resubmission of an unprocessed remainder
pub const DELETE_TREE_RETRIES: &str = "kvlease_delete_tree_retries_total";

/// Tree deletion tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteTreeOptions {
    /// Pause between resubmissions of the unprocessed remainder
    pub retry_interval: Duration,
    /// Overall budget, measured from the start of the first batch
    pub deadline: Duration,
    pub read: ReadOptions,
}

impl Default for DeleteTreeOptions {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            deadline: Duration::from_secs(DELETE_TREE_TIMEOUT_SECONDS),
            read: ReadOptions::default(),
        }
    }
}

impl CasStore {
    /// Delete every key under `prefix` with the default retry policy
    pub async fn delete_tree(&self, prefix: &str) -> Result<()> {
        self.delete_tree_with(prefix, DeleteTreeOptions::default())
            .await
    }

    pub async fn delete_tree_with(&self, prefix: &str, options: DeleteTreeOptions) -> Result<()> {
        let keys: Vec<String> = self
            .scan(prefix, options.read)
            .await?
            .into_iter()
            .map(|item| item.key)
            .collect();

        if keys.is_empty() {
            debug!(prefix, "delete tree matched nothing");
            return Ok(());
        }

        debug!(prefix, count = keys.len(), "deleting tree");
        drain_batch(self.backend().as_ref(), keys, options).await
    }
}

/// Submit `keys` as one batch and resubmit the unprocessed remainder until it
/// drains or `options.deadline` elapses
pub async fn drain_batch(
    backend: &dyn Backend,
    keys: Vec<String>,
    options: DeleteTreeOptions,
) -> Result<()> {
    let deadline = tokio::time::sleep(options.deadline);
    tokio::pin!(deadline);

    let mut unprocessed = backend.batch_delete(&keys).await?;

    let mut ticker = interval_at(Instant::now() + options.retry_interval, options.retry_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !unprocessed.is_empty() {
        tokio::select! {
            _ = &mut deadline => {
                warn!(remaining = unprocessed.len(), "delete batch timed out");
                return Err(KvError::DeleteTreeTimeout { unprocessed });
            }
            _ = ticker.tick() => {
                counter!(DELETE_TREE_RETRIES).increment(1);
                debug!(remaining = unprocessed.len(), "resubmitting unprocessed keys");
                unprocessed = backend.batch_delete(&unprocessed).await?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::MemoryBackend;
    use kvlease_common::WriteOptions;

    async fn seeded(count: usize) -> (CasStore, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let store = CasStore::new(backend.clone());
        for i in 0..count {
            store
                .put(&format!("tree/{}", i), b"x", WriteOptions::default())
                .await
                .unwrap();
        }
        (store, backend)
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_tree_succeeds() {
        let (store, backend) = seeded(0).await;
        store.delete_tree("tree/").await.unwrap();
        assert_eq!(backend.batch_delete_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_pass() {
        let (store, backend) = seeded(3).await;
        store.delete_tree("tree/").await.unwrap();
        assert!(backend.is_empty());
        assert_eq!(backend.batch_delete_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrinking_remainder_converges() {
        let (store, backend) = seeded(6).await;
        backend.throttle_batch_deletes([4, 2, 1]);

        let start = Instant::now();
        store.delete_tree("tree/").await.unwrap();

        assert!(backend.is_empty());
        assert_eq!(backend.batch_delete_calls(), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_deadline() {
        let (store, backend) = seeded(2).await;
        backend.stall_batch_deletes(true);

        let options = DeleteTreeOptions {
            retry_interval: Duration::from_millis(100),
            deadline: Duration::from_millis(550),
            ..Default::default()
        };
        let err = store.delete_tree_with("tree/", options).await.unwrap_err();
        assert!(matches!(err, KvError::DeleteTreeTimeout { ref unprocessed } if unprocessed.len() == 2));
        // first batch plus one retry per elapsed interval
        assert_eq!(backend.batch_delete_calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_error_stops_retry() {
        let (store, backend) = seeded(2).await;
        backend.throttle_batch_deletes([1]);

        let handle = {
            let store = store.clone();
            tokio::spawn(async move { store.delete_tree("tree/").await })
        };
        // let the first batch land, then break the backend before the retry
        while backend.batch_delete_calls() == 0 {
            tokio::task::yield_now().await;
        }
        backend.inject_failure("throttled");

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, KvError::Backend(_)));
        assert_eq!(backend.len(), 1);
    }
}
