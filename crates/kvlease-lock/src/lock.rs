//! Lease lock
//!
//! A lock is a single item whose value names the holder and whose expiration is
//! the lease. Acquiring is a create-only (or revision-checked) conditional put;
//! holding is a background task re-issuing that put every `ttl / 3` against the
//! last revision it wrote; releasing is a conditional delete on that revision.
//! A holder that has been superseded can therefore neither renew nor delete the
//! new holder's lease.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kvlease_common::{Expectation, KvError, KvItem, Result, WriteOptions};
use kvlease_store::CasStore;
use kvlease_store::watch::wait_for_change;

use crate::metrics;
use crate::notification::{HoldEnd, LossNotification};
use crate::options::{LockOptions, RELEASE_ON_CANCEL_TIMEOUT};

/// Lifecycle of one handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Idle,
    Acquiring,
    Held,
    Releasing,
    Released,
}

/// Signals the hold loop reacts to; the first one to fire wins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoldEvent {
    Heartbeat,
    RenewCancelled,
    UnlockRequested,
    HandleDropped,
    Cancelled,
}

struct HoldExit {
    /// Last item this cycle wrote, unless it was already deleted
    last: Option<KvItem>,
    end: HoldEnd,
}

struct HoldHandle {
    unlock: CancellationToken,
    dropped: CancellationToken,
    revision: Arc<AtomicU64>,
    notification: LossNotification,
    task: JoinHandle<HoldExit>,
}

/// Everything the background hold task owns
struct HoldContext {
    store: CasStore,
    key: String,
    value: Vec<u8>,
    ttl: Duration,
    period: Duration,
    renew: CancellationToken,
    unlock: CancellationToken,
    dropped: CancellationToken,
    cancel: CancellationToken,
    revision: Arc<AtomicU64>,
    notification: LossNotification,
}

/// Lease-based mutual exclusion on one key
///
/// Not reentrant: a handle runs at most one acquire/hold cycle at a time.
pub struct LeaseLock {
    store: CasStore,
    key: String,
    options: LockOptions,
    state: LockState,
    /// Fencing token for the next conditional write; owned by the hold task
    /// while held
    last: Option<KvItem>,
    hold: Option<HoldHandle>,
}

impl LeaseLock {
    pub fn new(store: CasStore, key: impl Into<String>, options: LockOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            store,
            key: key.into(),
            options,
            state: LockState::Idle,
            last: None,
            hold: None,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    /// Whether the current cycle still holds the lease
    pub fn is_held(&self) -> bool {
        self.hold
            .as_ref()
            .is_some_and(|hold| !hold.notification.is_lost())
    }

    /// Revision of the last write made by this handle
    pub fn fencing_token(&self) -> Option<u64> {
        match &self.hold {
            Some(hold) => Some(hold.revision.load(Ordering::SeqCst)),
            None => self.last.as_ref().map(|item| item.revision),
        }
    }

    /// Block until the lock is acquired or `cancel` fires
    ///
    /// Cancellation is honoured while a write is in flight too; a lease written
    /// after `cancel` fired is deleted again before `AcquireCancelled` is returned.
    /// The returned notification closes when this cycle stops holding the lock,
    /// for whatever reason. Cancelling `cancel` after acquisition stops renewal
    /// and releases the lease on a best-effort basis.
    pub async fn lock(&mut self, cancel: &CancellationToken) -> Result<LossNotification> {
        self.reap_lost().await;
        if self.hold.is_some() {
            return Err(KvError::AlreadyHeld(self.key.clone()));
        }
        if cancel.is_cancelled() {
            return Err(KvError::AcquireCancelled);
        }

        self.state = LockState::Acquiring;
        let mut events = self.store.change_feed().map(|feed| feed.subscribe());
        let write = WriteOptions::with_ttl(self.options.ttl);

        loop {
            let expected = Expectation::from_previous(self.last.as_ref());
            let attempt = tokio::select! {
                result = self.store.conditional_put(&self.key, &self.options.value, expected, write) => Some(result),
                _ = cancel.cancelled() => None,
            };
            let Some(result) = attempt else {
                debug!(key = %self.key, "lock acquire cancelled during write");
                self.state = LockState::Idle;
                return Err(KvError::AcquireCancelled);
            };

            match result {
                Ok(item) if cancel.is_cancelled() => {
                    // written after the caller gave up; take it back
                    if !release_on_cancel(&self.store, &self.key, &item).await {
                        self.last = Some(item);
                    }
                    self.state = LockState::Idle;
                    return Err(KvError::AcquireCancelled);
                }
                Ok(item) => {
                    info!(key = %self.key, revision = item.revision, "lock acquired");
                    metrics::record_acquired(&self.key);
                    return Ok(self.start_hold(item, cancel));
                }
                Err(e) if e.is_conflict() => {
                    if let Expectation::Revision(revision) = expected
                        && matches!(e, KvError::KeyModified | KvError::KeyNotFound)
                    {
                        debug!(key = %self.key, revision, "discarding stale lease token");
                        self.last = None;
                    }
                    debug!(key = %self.key, error = %e, "lock held elsewhere, retrying");
                    metrics::record_contended(&self.key);
                }
                Err(e) => {
                    self.state = LockState::Idle;
                    return Err(e);
                }
            }

            let cancelled = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(self.options.retry_interval) => false,
                _ = wait_for_change(&mut events, &self.key) => false,
            };
            if cancelled {
                debug!(key = %self.key, "lock acquire cancelled");
                self.state = LockState::Idle;
                return Err(KvError::AcquireCancelled);
            }
        }
    }

    /// Stop renewing and delete the lease if this handle still owns it
    ///
    /// A lease that was already lost or taken over is not an error. When
    /// `cancel` fires before the delete completes the lease is left to lapse.
    pub async fn unlock(&mut self, cancel: &CancellationToken) -> Result<()> {
        if let Some(hold) = self.hold.take() {
            hold.unlock.cancel();
            self.join_hold(hold).await;
        }

        let Some(last) = self.last.take() else {
            if self.state != LockState::Idle {
                self.state = LockState::Released;
            }
            return Ok(());
        };

        self.state = LockState::Releasing;
        let outcome = tokio::select! {
            result = self.store.conditional_delete(&self.key, Expectation::Revision(last.revision)) => Some(result),
            _ = cancel.cancelled() => None,
        };

        match outcome {
            Some(Ok(())) => {
                info!(key = %self.key, revision = last.revision, "lock released");
                metrics::record_released(&self.key);
            }
            Some(Err(e)) if e.is_conflict() => {
                debug!(key = %self.key, revision = last.revision, error = %e, "lease already gone");
            }
            Some(Err(e)) => {
                // keep the token so a later unlock can retry
                self.last = Some(last);
                self.state = LockState::Idle;
                return Err(e);
            }
            None => {
                warn!(key = %self.key, "release cancelled, lease left to expire");
            }
        }
        self.state = LockState::Released;
        Ok(())
    }

    fn start_hold(&mut self, item: KvItem, cancel: &CancellationToken) -> LossNotification {
        let unlock = CancellationToken::new();
        let dropped = CancellationToken::new();
        let revision = Arc::new(AtomicU64::new(item.revision));
        let notification = LossNotification::new();

        let ctx = HoldContext {
            store: self.store.clone(),
            key: self.key.clone(),
            value: self.options.value.clone(),
            ttl: self.options.ttl,
            period: self.options.renew_period(),
            renew: self.options.renew_lock.clone().unwrap_or_default(),
            unlock: unlock.clone(),
            dropped: dropped.clone(),
            cancel: cancel.clone(),
            revision: revision.clone(),
            notification: notification.clone(),
        };
        let task = tokio::spawn(hold_lease(ctx, item));

        self.last = None;
        self.state = LockState::Held;
        self.hold = Some(HoldHandle {
            unlock,
            dropped,
            revision,
            notification: notification.clone(),
            task,
        });
        notification
    }

    /// Collect a hold task that already ended on its own
    async fn reap_lost(&mut self) {
        let lost = self
            .hold
            .as_ref()
            .is_some_and(|hold| hold.notification.is_lost());
        if lost && let Some(hold) = self.hold.take() {
            self.join_hold(hold).await;
            self.state = LockState::Released;
        }
    }

    async fn join_hold(&mut self, hold: HoldHandle) {
        match hold.task.await {
            Ok(exit) => {
                debug!(key = %self.key, end = ?exit.end, "hold loop joined");
                self.last = exit.last;
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "hold task failed");
                self.last = None;
            }
        }
    }
}

impl Drop for LeaseLock {
    fn drop(&mut self) {
        // stop renewing; the lease lapses after its ttl
        if let Some(hold) = self.hold.take() {
            hold.dropped.cancel();
        }
    }
}

impl std::fmt::Debug for LeaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseLock")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("fencing_token", &self.fencing_token())
            .finish()
    }
}

async fn hold_lease(ctx: HoldContext, mut last: KvItem) -> HoldExit {
    let HoldContext {
        store,
        key,
        value,
        ttl,
        period,
        renew,
        unlock,
        dropped,
        cancel,
        revision,
        notification,
    } = ctx;
    let _closed = notification.close_on_drop();

    let write = WriteOptions::with_ttl(ttl);
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit = loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => HoldEvent::Cancelled,
            _ = unlock.cancelled() => HoldEvent::UnlockRequested,
            _ = dropped.cancelled() => HoldEvent::HandleDropped,
            _ = renew.cancelled() => HoldEvent::RenewCancelled,
            _ = heartbeat.tick() => HoldEvent::Heartbeat,
        };

        match event {
            HoldEvent::Heartbeat => {
                match store
                    .conditional_put(&key, &value, Expectation::Revision(last.revision), write)
                    .await
                {
                    Ok(item) => {
                        debug!(key = %key, revision = item.revision, "lease renewed");
                        metrics::record_renewed(&key);
                        revision.store(item.revision, Ordering::SeqCst);
                        last = item;
                    }
                    Err(e) => {
                        warn!(key = %key, revision = last.revision, error = %e, "lease renewal failed, lock lost");
                        metrics::record_lost(&key);
                        break HoldExit {
                            last: Some(last),
                            end: HoldEnd::RenewalFailed,
                        };
                    }
                }
            }
            HoldEvent::RenewCancelled => {
                info!(key = %key, revision = last.revision, "renewal stopped, lease will lapse");
                break HoldExit {
                    last: Some(last),
                    end: HoldEnd::RenewStopped,
                };
            }
            HoldEvent::UnlockRequested => {
                break HoldExit {
                    last: Some(last),
                    end: HoldEnd::Unlocked,
                };
            }
            HoldEvent::HandleDropped => {
                debug!(key = %key, revision = last.revision, "handle dropped, lease will lapse");
                break HoldExit {
                    last: Some(last),
                    end: HoldEnd::Dropped,
                };
            }
            HoldEvent::Cancelled => {
                let released = release_on_cancel(&store, &key, &last).await;
                break HoldExit {
                    last: (!released).then_some(last),
                    end: HoldEnd::Cancelled,
                };
            }
        }
    };

    metrics::record_hold_ended();
    notification.close(exit.end);
    exit
}

/// Best-effort fenced delete, bounded so cancellation never blocks for long
async fn release_on_cancel(store: &CasStore, key: &str, last: &KvItem) -> bool {
    let delete = store.conditional_delete(key, Expectation::Revision(last.revision));
    match tokio::time::timeout(RELEASE_ON_CANCEL_TIMEOUT, delete).await {
        Ok(Ok(())) => {
            info!(key, revision = last.revision, "lock released on cancel");
            metrics::record_released(key);
            true
        }
        Ok(Err(e)) if e.is_conflict() => {
            debug!(key, error = %e, "lease already gone on cancel");
            true
        }
        Ok(Err(e)) => {
            warn!(key, error = %e, "release on cancel failed");
            false
        }
        Err(_) => {
            warn!(key, "release on cancel timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvlease_store::{MemoryBackend, TokioClock};

    fn lock_on(backend: &Arc<MemoryBackend>, holder: &str) -> LeaseLock {
        let store = CasStore::with_clock(backend.clone(), Arc::new(TokioClock::new()));
        LeaseLock::new(store, "mylock", LockOptions::new(holder)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_renew_release() {
        let backend = Arc::new(MemoryBackend::new());
        let mut lock = lock_on(&backend, "node-a");
        let cancel = CancellationToken::new();

        let lost = lock.lock(&cancel).await.unwrap();
        assert_eq!(lock.state(), LockState::Held);
        assert_eq!(lock.fencing_token(), Some(1));
        assert_eq!(backend.raw_item("mylock").unwrap().value, b"node-a");

        tokio::time::sleep(Duration::from_millis(6_700)).await;
        assert_eq!(backend.raw_item("mylock").unwrap().revision, 2);
        assert_eq!(lock.fencing_token(), Some(2));

        lock.unlock(&cancel).await.unwrap();
        assert!(lost.is_lost());
        assert_eq!(lost.reason(), Some(HoldEnd::Unlocked));
        assert_eq!(lock.state(), LockState::Released);
        assert!(backend.raw_item("mylock").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_twice_is_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let mut lock = lock_on(&backend, "node-a");
        let cancel = CancellationToken::new();

        lock.lock(&cancel).await.unwrap();
        let err = lock.lock(&cancel).await.unwrap_err();
        assert!(matches!(err, KvError::AlreadyHeld(ref key) if key == "mylock"));
        lock.unlock(&cancel).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_without_lock_is_noop() {
        let backend = Arc::new(MemoryBackend::new());
        let mut lock = lock_on(&backend, "node-a");
        lock.unlock(&CancellationToken::new()).await.unwrap();
        assert_eq!(lock.state(), LockState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_acquire() {
        let backend = Arc::new(MemoryBackend::new());
        let mut lock = lock_on(&backend, "node-a");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = lock.lock(&cancel).await.unwrap_err();
        assert!(matches!(err, KvError::AcquireCancelled));
        assert!(backend.is_empty());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let store = CasStore::new(Arc::new(MemoryBackend::new()));
        let options = LockOptions::new("x").with_ttl(Duration::ZERO);
        assert!(matches!(
            LeaseLock::new(store, "k", options),
            Err(KvError::InvalidConfiguration(_))
        ));
    }
}
