//! CAS engine
//!
//! `CasStore` turns the raw backend into the revision-checked API the lock is
//! built on. Every successful write bumps the key's revision, and items whose
//! expiration has been reached read as absent even while they are still stored.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use kvlease_common::{
    Clock, DEFAULT_SCAN_TIMEOUT_SECONDS, Expectation, ItemUpdate, KvError, KvItem, ReadOptions,
    Result, SystemClock, WriteOptions,
};

use crate::backend::{Backend, Conditional};
use crate::watch::ChangeFeed;

/// Revision-checked key-value access over a `Backend`
#[derive(Clone)]
pub struct CasStore {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    feed: Option<Arc<dyn ChangeFeed>>,
    scan_timeout: Duration,
}

impl CasStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_clock(backend, Arc::new(SystemClock))
    }

    pub fn with_clock(backend: Arc<dyn Backend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            feed: None,
            scan_timeout: Duration::from_secs(DEFAULT_SCAN_TIMEOUT_SECONDS),
        }
    }

    /// Attach a change feed used to wake watchers and waiting acquirers early
    pub fn with_change_feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn change_feed(&self) -> Option<&Arc<dyn ChangeFeed>> {
        self.feed.as_ref()
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Live item at `key`; `KeyNotFound` when absent or expired
    pub async fn get(&self, key: &str, options: ReadOptions) -> Result<KvItem> {
        let now = self.now_millis();
        match self.backend.get(key, options.consistent).await? {
            Some(item) if !item.is_expired_at(now) => {
                debug!(key, revision = item.revision, "get");
                Ok(item)
            }
            _ => Err(KvError::KeyNotFound),
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self.get(key, ReadOptions::default()).await {
            Ok(_) => Ok(true),
            Err(KvError::KeyNotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Unconditional upsert
    ///
    /// An empty `value` keeps the stored value; a missing TTL keeps the stored
    /// expiration. Over an expired remnant neither is kept: the write starts a
    /// fresh item that only inherits the revision counter.
    pub async fn put(&self, key: &str, value: &[u8], options: WriteOptions) -> Result<KvItem> {
        let update = ItemUpdate::new(Some(value), &options, self.now_millis());
        let item = self.backend.put(key, update).await?;
        debug!(key, revision = item.revision, "put");
        Ok(item)
    }

    /// Write only if the stored item matches `expected`
    ///
    /// Fails with `KeyExists` when `Absent` was expected but a live item is
    /// stored, and with `KeyModified` when the expected revision is not the live
    /// one (including the case where it has expired).
    pub async fn conditional_put(
        &self,
        key: &str,
        value: &[u8],
        expected: Expectation,
        options: WriteOptions,
    ) -> Result<KvItem> {
        let now = self.now_millis();
        let update = ItemUpdate::new(Some(value), &options, now);

        match self
            .backend
            .conditional_put(key, update, expected.to_condition(now))
            .await?
        {
            Conditional::Applied(item) => {
                debug!(key, revision = item.revision, ?expected, "conditional put applied");
                Ok(item)
            }
            Conditional::Rejected => {
                debug!(key, ?expected, "conditional put rejected");
                Err(match expected {
                    Expectation::Absent => KvError::KeyExists,
                    Expectation::Revision(_) => KvError::KeyModified,
                })
            }
        }
    }

    /// Remove the item only if it matches `expected`
    ///
    /// With a revision: `KeyNotFound` when nothing live is stored, `KeyModified`
    /// when a different revision is live. With `Absent`: `KeyExists` when a live
    /// item is stored, otherwise any expired remnant is purged.
    pub async fn conditional_delete(&self, key: &str, expected: Expectation) -> Result<()> {
        let now = self.now_millis();

        match self
            .backend
            .conditional_delete(key, expected.to_condition(now))
            .await?
        {
            Conditional::Applied(()) => {
                debug!(key, ?expected, "conditional delete applied");
                Ok(())
            }
            Conditional::Rejected => {
                debug!(key, ?expected, "conditional delete rejected");
                match expected {
                    Expectation::Absent => Err(KvError::KeyExists),
                    Expectation::Revision(_) => {
                        // diagnose after the fact; the rejection itself was atomic
                        match self.backend.get(key, true).await? {
                            Some(item) if !item.is_expired_at(self.now_millis()) => {
                                Err(KvError::KeyModified)
                            }
                            _ => Err(KvError::KeyNotFound),
                        }
                    }
                }
            }
        }
    }

    /// Unconditional removal; deleting a missing key succeeds
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(key).await?;
        debug!(key, "delete");
        Ok(())
    }

    /// Live items under `prefix`, excluding the item stored at `prefix` itself
    pub async fn list(&self, prefix: &str, options: ReadOptions) -> Result<Vec<KvItem>> {
        let items = self.scan(prefix, options).await?;
        let now = self.now_millis();

        let live: Vec<KvItem> = items
            .into_iter()
            .filter(|item| item.key != prefix && !item.is_expired_at(now))
            .collect();

        debug!(prefix, count = live.len(), "list");
        if live.is_empty() {
            return Err(KvError::KeyNotFound);
        }
        Ok(live)
    }

    /// Raw prefix scan bounded by the scan timeout
    pub(crate) async fn scan(&self, prefix: &str, options: ReadOptions) -> Result<Vec<KvItem>> {
        tokio::time::timeout(
            self.scan_timeout,
            self.backend.scan_prefix(prefix, options.consistent),
        )
        .await
        .map_err(|_| KvError::ScanTimeout(prefix.to_string()))?
    }

    pub async fn close(&self) -> Result<()> {
        debug!(backend = self.backend.name(), "closing store");
        self.backend.close().await
    }
}

impl std::fmt::Debug for CasStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CasStore")
            .field("backend", &self.backend.name())
            .field("clock", &self.clock)
            .field("change_feed", &self.feed.is_some())
            .field("scan_timeout", &self.scan_timeout)
            .finish()
    }
}
