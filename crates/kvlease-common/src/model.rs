//! Stored item model and the CAS vocabulary built on it

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A stored key/value unit
///
/// `revision` is bumped by exactly one on every successful write to the key and
/// serves as the fencing token for conditional operations. An item whose
/// `expires_at` (unix millis) has been reached is logically absent even while it
/// is still physically stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvItem {
    pub key: String,
    #[serde(default)]
    pub value: Vec<u8>,
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl KvItem {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            revision: 0,
            expires_at: None,
        }
    }

    /// Check if the item is logically expired at `now_ms`
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => now_ms >= expires_at,
            None => false,
        }
    }

    /// Remaining lifetime at `now_ms`; `None` when the item never expires
    pub fn remaining_ttl(&self, now_ms: i64) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| Duration::from_millis(expires_at.saturating_sub(now_ms).max(0) as u64))
    }

    /// Value as UTF-8, lossy
    pub fn value_string(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// What a conditional operation expects to find at the key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    /// The key must be missing or logically expired
    Absent,
    /// The key must be live at exactly this revision
    Revision(u64),
}

impl Expectation {
    pub fn from_previous(previous: Option<&KvItem>) -> Self {
        match previous {
            Some(item) => Expectation::Revision(item.revision),
            None => Expectation::Absent,
        }
    }

    /// Translate into the atomic condition evaluated by the backend at `now_ms`
    pub fn to_condition(self, now_ms: i64) -> Condition {
        match self {
            Expectation::Absent => Condition::AbsentOrExpired { now: now_ms },
            Expectation::Revision(revision) => Condition::LiveRevision {
                revision,
                now: now_ms,
            },
        }
    }
}

impl From<Option<&KvItem>> for Expectation {
    fn from(previous: Option<&KvItem>) -> Self {
        Expectation::from_previous(previous)
    }
}

/// Precondition a backend checks atomically with a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// Nothing stored, or the stored item expired at `now`
    AbsentOrExpired { now: i64 },
    /// Stored revision matches and the item has not expired at `now`
    LiveRevision { revision: u64, now: i64 },
    /// Stored revision matches, expiration ignored
    Revision(u64),
}

impl Condition {
    /// Evaluate against the physically stored item
    pub fn holds(&self, current: Option<&KvItem>) -> bool {
        match *self {
            Condition::AbsentOrExpired { now } => current.is_none_or(|item| item.is_expired_at(now)),
            Condition::LiveRevision { revision, now } => {
                current.is_some_and(|item| item.revision == revision && !item.is_expired_at(now))
            }
            Condition::Revision(revision) => current.is_some_and(|item| item.revision == revision),
        }
    }
}

/// Field changes carried by a write
///
/// A `None` field leaves the stored field untouched. Applying an update always
/// increments the revision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemUpdate {
    pub value: Option<Vec<u8>>,
    pub expires_at: Option<i64>,
    /// Evaluation time; a stored item expired at this instant is treated as a
    /// fresh creation apart from its revision
    pub now: i64,
}

impl ItemUpdate {
    /// Build an update; an empty value means "keep the stored value"
    pub fn new(value: Option<&[u8]>, options: &WriteOptions, now_ms: i64) -> Self {
        Self {
            value: value.filter(|v| !v.is_empty()).map(<[u8]>::to_vec),
            expires_at: options
                .ttl
                .filter(|ttl| !ttl.is_zero())
                .map(|ttl| now_ms.saturating_add(ttl.as_millis() as i64)),
            now: now_ms,
        }
    }

    /// Produce the post-write item for `key`
    pub fn apply(&self, key: &str, existing: Option<&KvItem>) -> KvItem {
        let revision = existing.map_or(0, |item| item.revision) + 1;
        let live = existing.filter(|item| !item.is_expired_at(self.now));

        KvItem {
            key: key.to_string(),
            value: self
                .value
                .clone()
                .or_else(|| live.map(|item| item.value.clone()))
                .unwrap_or_default(),
            revision,
            expires_at: self.expires_at.or_else(|| live.and_then(|item| item.expires_at)),
        }
    }
}

/// Read options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOptions {
    /// Request a strongly consistent read
    pub consistent: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self { consistent: true }
    }
}

impl ReadOptions {
    pub fn eventual() -> Self {
        Self { consistent: false }
    }
}

/// Write options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Item lifetime from the moment of the write
    pub ttl: Option<Duration>,
}

impl WriteOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }
}
