//! Polling watch and the optional change feed
//!
//! A watch re-reads its key on a fixed poll interval. When the store has a
//! `ChangeFeed` attached, an event for the key triggers an immediate re-read as
//! well; the poll keeps running so expirations (which produce no event) are still
//! noticed.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kvlease_common::{KvError, KvItem, ReadOptions, Result};

use crate::cas::CasStore;

/// What happened to a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Put { revision: u64 },
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: String,
    pub kind: ChangeKind,
}

/// Push notification of writes, used only as a wake-up hint
pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}

/// Outcome of waiting on a feed subscription
pub(crate) enum FeedSignal {
    Changed,
    Closed,
}

/// Wait until `events` reports something about `key`
///
/// A lagged receiver counts as a change since events may have been missed. With
/// no subscription this never resolves.
pub(crate) async fn next_change(
    events: &mut Option<broadcast::Receiver<ChangeEvent>>,
    key: &str,
) -> FeedSignal {
    let Some(rx) = events.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(event) if event.key == key => return FeedSignal::Changed,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => return FeedSignal::Changed,
            Err(broadcast::error::RecvError::Closed) => return FeedSignal::Closed,
        }
    }
}

/// Wait for a change to `key` on the store's feed, if it has one
pub async fn wait_for_change(events: &mut Option<broadcast::Receiver<ChangeEvent>>, key: &str) {
    if let FeedSignal::Closed = next_change(events, key).await {
        *events = None;
        std::future::pending::<()>().await;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    pub poll_interval: Duration,
    /// Channel capacity between the watch task and the receiver
    pub buffer: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            buffer: 16,
        }
    }
}

fn same_state(a: &Option<KvItem>, b: &Option<KvItem>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.revision == b.revision,
        _ => false,
    }
}

impl CasStore {
    /// Watch a single key
    ///
    /// The receiver first gets the current item (`None` when absent), then every
    /// observed change of revision or presence. The watch ends when `cancel`
    /// fires or the receiver is dropped.
    pub async fn watch(
        &self,
        key: &str,
        cancel: CancellationToken,
        options: WatchOptions,
    ) -> Result<mpsc::Receiver<Option<KvItem>>> {
        let initial = self.read_optional(key).await?;
        let (tx, rx) = mpsc::channel(options.buffer.max(1));
        // capacity is at least one and the receiver is still held here
        let _ = tx.try_send(initial.clone());

        let store = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let mut events = store.change_feed().map(|feed| feed.subscribe());
            let mut ticker = interval_at(Instant::now() + options.poll_interval, options.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last = initial;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    _ = wait_for_change(&mut events, &key) => {}
                    _ = ticker.tick() => {}
                }

                let current = match store.read_optional(&key).await {
                    Ok(current) => current,
                    Err(e) => {
                        warn!(key = %key, error = %e, "watch read failed");
                        continue;
                    }
                };
                if same_state(&last, &current) {
                    continue;
                }
                if tx.send(current.clone()).await.is_err() {
                    break;
                }
                last = current;
            }
            debug!(key = %key, "watch stopped");
        });

        Ok(rx)
    }

    /// Watching a whole prefix is not offered
    pub async fn watch_tree(
        &self,
        _prefix: &str,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Vec<KvItem>>> {
        Err(KvError::CallNotSupported)
    }

    async fn read_optional(&self, key: &str) -> Result<Option<KvItem>> {
        match self.get(key, ReadOptions::default()).await {
            Ok(item) => Ok(Some(item)),
            Err(KvError::KeyNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
