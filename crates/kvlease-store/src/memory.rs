//! In-process backend
//!
//! Items live in a `DashMap`; conditional writes go through the entry API so the
//! condition check and the write happen under the same shard lock. The backend
//! can be told to misbehave (partial batch deletes, stalls, hard failures, slow
//! scans) so the retry and loss paths above it can be exercised.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

use kvlease_common::{Condition, ItemUpdate, KvError, KvItem, Result, StoreConfig};

use crate::backend::{Backend, Conditional};
use crate::watch::{ChangeEvent, ChangeFeed, ChangeKind};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Faults {
    /// Per batch-delete call: how many of the submitted keys to leave behind
    batch_plan: VecDeque<usize>,
    stall_batch_deletes: bool,
    failure: Option<String>,
    scan_delay: Option<Duration>,
    conditional_put_delay: Option<Duration>,
}

/// In-memory `Backend`
#[derive(Clone)]
pub struct MemoryBackend {
    table: String,
    items: Arc<DashMap<String, KvItem>>,
    faults: Arc<Mutex<Faults>>,
    batch_calls: Arc<AtomicUsize>,
    events: broadcast::Sender<ChangeEvent>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_table("kvlease")
    }

    pub fn with_table(table: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            table: table.into(),
            items: Arc::new(DashMap::new()),
            faults: Arc::new(Mutex::new(Faults::default())),
            batch_calls: Arc::new(AtomicUsize::new(0)),
            events,
        }
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_table(config.table.clone()))
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Physically stored item, ignoring expiration
    pub fn raw_item(&self, key: &str) -> Option<KvItem> {
        self.items.get(key).map(|entry| entry.value().clone())
    }

    /// Number of physically stored items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Physically remove items expired at `now_ms`; returns how many were dropped
    pub fn purge_expired(&self, now_ms: i64) -> usize {
        let before = self.items.len();
        self.items.retain(|_, item| !item.is_expired_at(now_ms));
        before - self.items.len()
    }

    /// Leave `counts[i]` keys unprocessed on the i-th following batch delete
    pub fn throttle_batch_deletes(&self, counts: impl IntoIterator<Item = usize>) {
        self.faults.lock().batch_plan = counts.into_iter().collect();
    }

    /// Make every batch delete return all of its keys unprocessed
    pub fn stall_batch_deletes(&self, stall: bool) {
        self.faults.lock().stall_batch_deletes = stall;
    }

    /// Fail every operation with a backend error until cleared
    pub fn inject_failure(&self, message: impl Into<String>) {
        self.faults.lock().failure = Some(message.into());
    }

    pub fn clear_failure(&self) {
        self.faults.lock().failure = None;
    }

    /// Delay every prefix scan
    pub fn set_scan_delay(&self, delay: Option<Duration>) {
        self.faults.lock().scan_delay = delay;
    }

    /// Delay every conditional put before it is evaluated
    pub fn set_conditional_put_delay(&self, delay: Option<Duration>) {
        self.faults.lock().conditional_put_delay = delay;
    }

    /// Number of live change feed subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    pub fn batch_delete_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> Result<()> {
        match &self.faults.lock().failure {
            Some(message) => Err(KvError::backend(message)),
            None => Ok(()),
        }
    }

    fn publish(&self, key: &str, kind: ChangeKind) {
        // no subscribers is fine
        let _ = self.events.send(ChangeEvent {
            key: key.to_string(),
            kind,
        });
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("table", &self.table)
            .field("items", &self.items.len())
            .finish()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str, _consistent: bool) -> Result<Option<KvItem>> {
        self.check_failure()?;
        Ok(self.raw_item(key))
    }

    async fn put(&self, key: &str, update: ItemUpdate) -> Result<KvItem> {
        self.check_failure()?;
        let item = match self.items.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let next = update.apply(key, Some(entry.get()));
                entry.insert(next.clone());
                next
            }
            Entry::Vacant(entry) => entry.insert(update.apply(key, None)).value().clone(),
        };
        self.publish(key, ChangeKind::Put {
            revision: item.revision,
        });
        Ok(item)
    }

    async fn conditional_put(
        &self,
        key: &str,
        update: ItemUpdate,
        condition: Condition,
    ) -> Result<Conditional<KvItem>> {
        let delay = self.faults.lock().conditional_put_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_failure()?;
        let outcome = match self.items.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if condition.holds(Some(entry.get())) {
                    let next = update.apply(key, Some(entry.get()));
                    entry.insert(next.clone());
                    Conditional::Applied(next)
                } else {
                    Conditional::Rejected
                }
            }
            Entry::Vacant(entry) => {
                if condition.holds(None) {
                    Conditional::Applied(entry.insert(update.apply(key, None)).value().clone())
                } else {
                    Conditional::Rejected
                }
            }
        };

        match &outcome {
            Conditional::Applied(item) => self.publish(key, ChangeKind::Put {
                revision: item.revision,
            }),
            Conditional::Rejected => trace!(key, ?condition, "conditional put rejected"),
        }
        Ok(outcome)
    }

    async fn conditional_delete(&self, key: &str, condition: Condition) -> Result<Conditional<()>> {
        self.check_failure()?;
        let removed = self
            .items
            .remove_if(key, |_, item| condition.holds(Some(item)))
            .is_some();

        if removed {
            self.publish(key, ChangeKind::Deleted);
            Ok(Conditional::Applied(()))
        } else if !self.items.contains_key(key) && condition.holds(None) {
            Ok(Conditional::Applied(()))
        } else {
            Ok(Conditional::Rejected)
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_failure()?;
        if self.items.remove(key).is_some() {
            self.publish(key, ChangeKind::Deleted);
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str, _consistent: bool) -> Result<Vec<KvItem>> {
        self.check_failure()?;
        let delay = self.faults.lock().scan_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut items: Vec<KvItem> = self
            .items
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.value().clone())
            .collect();
        items.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(items)
    }

    async fn batch_delete(&self, keys: &[String]) -> Result<Vec<String>> {
        self.check_failure()?;
        self.batch_calls.fetch_add(1, Ordering::SeqCst);

        let leave = {
            let mut faults = self.faults.lock();
            if faults.stall_batch_deletes {
                keys.len()
            } else {
                faults.batch_plan.pop_front().unwrap_or(0).min(keys.len())
            }
        };
        let split = keys.len() - leave;

        for key in &keys[..split] {
            if self.items.remove(key).is_some() {
                self.publish(key, ChangeKind::Deleted);
            }
        }
        Ok(keys[split..].to_vec())
    }
}

impl ChangeFeed for MemoryBackend {
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvlease_common::{Expectation, WriteOptions};

    fn update(value: &str, now: i64) -> ItemUpdate {
        ItemUpdate::new(Some(value.as_bytes()), &WriteOptions::default(), now)
    }

    #[tokio::test]
    async fn test_put_get() {
        let backend = MemoryBackend::new();

        let first = backend.put("config/db", update("mysql", 0)).await.unwrap();
        assert_eq!(first.revision, 1);
        let second = backend.put("config/db", update("pg", 0)).await.unwrap();
        assert_eq!(second.revision, 2);

        let stored = backend.get("config/db", true).await.unwrap().unwrap();
        assert_eq!(stored.value, b"pg");
        assert!(backend.get("missing", true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conditional_put() {
        let backend = MemoryBackend::new();

        let created = backend
            .conditional_put("k", update("a", 0), Expectation::Absent.to_condition(0))
            .await
            .unwrap();
        assert!(created.is_applied());

        // create-only against a live item
        let again = backend
            .conditional_put("k", update("b", 0), Expectation::Absent.to_condition(0))
            .await
            .unwrap();
        assert_eq!(again, Conditional::Rejected);

        let swapped = backend
            .conditional_put("k", update("c", 0), Expectation::Revision(1).to_condition(0))
            .await
            .unwrap();
        assert!(matches!(swapped, Conditional::Applied(ref item) if item.revision == 2));

        let stale = backend
            .conditional_put("k", update("d", 0), Expectation::Revision(1).to_condition(0))
            .await
            .unwrap();
        assert_eq!(stale, Conditional::Rejected);
        assert_eq!(backend.raw_item("k").unwrap().value, b"c");
    }

    #[tokio::test]
    async fn test_conditional_delete() {
        let backend = MemoryBackend::new();
        backend.put("k", update("a", 0)).await.unwrap();

        let rejected = backend
            .conditional_delete("k", Condition::Revision(7))
            .await
            .unwrap();
        assert_eq!(rejected, Conditional::Rejected);

        let applied = backend
            .conditional_delete("k", Condition::Revision(1))
            .await
            .unwrap();
        assert!(applied.is_applied());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_scan_prefix_sorted() {
        let backend = MemoryBackend::new();
        backend.put("app/b", update("2", 0)).await.unwrap();
        backend.put("app/a", update("1", 0)).await.unwrap();
        backend.put("other", update("3", 0)).await.unwrap();

        let keys: Vec<String> = backend
            .scan_prefix("app/", true)
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.key)
            .collect();
        assert_eq!(keys, vec!["app/a", "app/b"]);
    }

    #[tokio::test]
    async fn test_batch_delete_throttle() {
        let backend = MemoryBackend::new();
        let keys: Vec<String> = (0..5).map(|i| format!("tree/{}", i)).collect();
        for key in &keys {
            backend.put(key, update("x", 0)).await.unwrap();
        }
        backend.throttle_batch_deletes([2]);

        let unprocessed = backend.batch_delete(&keys).await.unwrap();
        assert_eq!(unprocessed, vec!["tree/3", "tree/4"]);
        assert_eq!(backend.len(), 2);

        let unprocessed = backend.batch_delete(&unprocessed).await.unwrap();
        assert!(unprocessed.is_empty());
        assert!(backend.is_empty());
        assert_eq!(backend.batch_delete_calls(), 2);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let backend = MemoryBackend::new();
        backend.inject_failure("throttled");

        let err = backend.get("k", true).await.unwrap_err();
        assert_eq!(err.to_string(), "backend error: throttled");

        backend.clear_failure();
        assert!(backend.get("k", true).await.is_ok());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let backend = MemoryBackend::new();
        let short = ItemUpdate::new(Some(b"x"), &WriteOptions::with_ttl(Duration::from_millis(10)), 0);
        backend.put("short", short).await.unwrap();
        backend.put("forever", update("y", 0)).await.unwrap();

        assert_eq!(backend.purge_expired(5), 0);
        assert_eq!(backend.purge_expired(10), 1);
        assert!(backend.raw_item("forever").is_some());
    }

    #[tokio::test]
    async fn test_change_events() {
        let backend = MemoryBackend::new();
        let mut events = backend.subscribe();

        backend.put("k", update("a", 0)).await.unwrap();
        backend.delete("k").await.unwrap();

        let put = events.recv().await.unwrap();
        assert_eq!(put.key, "k");
        assert_eq!(put.kind, ChangeKind::Put { revision: 1 });
        assert_eq!(events.recv().await.unwrap().kind, ChangeKind::Deleted);
    }

    #[test]
    fn test_from_config_validates() {
        assert!(MemoryBackend::from_config(&StoreConfig::default()).is_err());
        let backend = MemoryBackend::from_config(&StoreConfig::new("locks")).unwrap();
        assert_eq!(backend.table(), "locks");
    }
}
