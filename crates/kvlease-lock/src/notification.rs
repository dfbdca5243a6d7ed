//! Lock-loss notification

use std::sync::{Arc, OnceLock};

use tokio_util::sync::{CancellationToken, DropGuard};

/// Why a hold cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldEnd {
    /// `unlock` was called
    Unlocked,
    /// The handle was dropped while held; the lease lapses after its TTL
    Dropped,
    /// A renewal was rejected or failed; another holder may own the key now
    RenewalFailed,
    /// The external renew-cancel signal fired; the lease lapses after its TTL
    RenewStopped,
    /// The caller's cancellation token fired while the lock was held
    Cancelled,
}

/// Closed exactly once, when the hold loop of a lock cycle ends
///
/// Clones observe the same closure.
#[derive(Debug, Clone, Default)]
pub struct LossNotification {
    token: CancellationToken,
    end: Arc<OnceLock<HoldEnd>>,
}

impl LossNotification {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wait until the lock is no longer held
    pub async fn lost(&self) {
        self.token.cancelled().await;
    }

    pub fn is_lost(&self) -> bool {
        self.token.is_cancelled()
    }

    /// How the hold ended; `None` while still held
    pub fn reason(&self) -> Option<HoldEnd> {
        self.end.get().copied()
    }

    pub(crate) fn close(&self, end: HoldEnd) {
        let _ = self.end.set(end);
        self.token.cancel();
    }

    /// Closes the notification when dropped, even if the hold task unwinds
    pub(crate) fn close_on_drop(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }
}
