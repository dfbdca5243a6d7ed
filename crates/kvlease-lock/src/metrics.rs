// Lock metrics published through the `metrics` facade
// No recorder is installed here; the embedding application picks the exporter

use metrics::{counter, describe_counter, describe_gauge, gauge};

pub use kvlease_store::DELETE_TREE_RETRIES;

pub const LOCK_ACQUISITIONS: &str = "kvlease_lock_acquisitions_total";
pub const LOCK_CONTENDED: &str = "kvlease_lock_contended_total";
pub const LOCK_RENEWALS: &str = "kvlease_lock_renewals_total";
pub const LOCK_LOST: &str = "kvlease_lock_lost_total";
pub const LOCK_RELEASES: &str = "kvlease_lock_releases_total";
pub const LOCKS_HELD: &str = "kvlease_locks_held";

/// Register metric descriptions
/// Should be called once at application startup
pub fn init_metrics() {
    describe_counter!(LOCK_ACQUISITIONS, "Total number of lock acquisitions");
    describe_counter!(
        LOCK_CONTENDED,
        "Total number of acquire attempts that found the lock held elsewhere"
    );
    describe_counter!(LOCK_RENEWALS, "Total number of successful lease renewals");
    describe_counter!(
        LOCK_LOST,
        "Total number of leases lost to a failed renewal"
    );
    describe_counter!(LOCK_RELEASES, "Total number of explicit lock releases");
    describe_gauge!(LOCKS_HELD, "Number of locks currently held by this process");
    describe_counter!(
        DELETE_TREE_RETRIES,
        "Total number of batch delete resubmissions"
    );
}

pub(crate) fn record_acquired(key: &str) {
    counter!(LOCK_ACQUISITIONS, "key" => key.to_string()).increment(1);
    gauge!(LOCKS_HELD).increment(1.0);
}

pub(crate) fn record_contended(key: &str) {
    counter!(LOCK_CONTENDED, "key" => key.to_string()).increment(1);
}

pub(crate) fn record_renewed(key: &str) {
    counter!(LOCK_RENEWALS, "key" => key.to_string()).increment(1);
}

pub(crate) fn record_lost(key: &str) {
    counter!(LOCK_LOST, "key" => key.to_string()).increment(1);
}

pub(crate) fn record_released(key: &str) {
    counter!(LOCK_RELEASES, "key" => key.to_string()).increment(1);
}

pub(crate) fn record_hold_ended() {
    gauge!(LOCKS_HELD).decrement(1.0);
}
