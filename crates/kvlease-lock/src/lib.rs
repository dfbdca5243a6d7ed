//! kvlease Lock - lease-based distributed mutual exclusion
//!
//! Built purely on the conditional writes of `kvlease_store::CasStore`:
//! - `lock`: the `LeaseLock` state machine (acquire, renew, fenced release)
//! - `notification`: the loss signal handed out on acquisition
//! - `options`: TTL, holder value, retry interval and renew-cancel signal
//! - `metrics`: counters and gauges published through the `metrics` facade

pub mod lock;
pub mod metrics;
pub mod notification;
pub mod options;

pub use lock::{LeaseLock, LockState};
pub use notification::{HoldEnd, LossNotification};
pub use options::{LockOptions, LockSettings};
