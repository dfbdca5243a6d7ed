//! Backend capability contract
//!
//! A backend stores raw items and evaluates a `Condition` atomically with the
//! write it guards. Everything else (revision semantics seen by callers, logical
//! expiration on reads, error mapping) lives in `CasStore`.

use async_trait::async_trait;
use kvlease_common::{Condition, ItemUpdate, KvItem, Result};

/// Outcome of a conditional backend write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conditional<T> {
    Applied(T),
    /// The condition did not hold; nothing was written
    Rejected,
}

impl<T> Conditional<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Conditional::Applied(_))
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Physically stored item, expired or not
    async fn get(&self, key: &str, consistent: bool) -> Result<Option<KvItem>>;

    /// Unconditional upsert; bumps the revision by one
    async fn put(&self, key: &str, update: ItemUpdate) -> Result<KvItem>;

    async fn conditional_put(
        &self,
        key: &str,
        update: ItemUpdate,
        condition: Condition,
    ) -> Result<Conditional<KvItem>>;

    async fn conditional_delete(&self, key: &str, condition: Condition) -> Result<Conditional<()>>;

    /// Unconditional removal; a missing key is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// All physically stored items whose key starts with `prefix`
    async fn scan_prefix(&self, prefix: &str, consistent: bool) -> Result<Vec<KvItem>>;

    /// Best-effort removal of `keys`; returns the keys left unprocessed
    async fn batch_delete(&self, keys: &[String]) -> Result<Vec<String>>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
