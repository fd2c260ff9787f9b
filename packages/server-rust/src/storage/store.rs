//! Persistent store SPI.

use std::collections::HashSet;

use async_trait::async_trait;
use gridcache_core::{CacheEntry, Modification};

use crate::transaction::GlobalTransactionId;

/// Key predicate handed to [`CacheStore::load_all_keys`].
pub type KeyFilter<'a> = &'a (dyn for<'k> Fn(&'k str) -> bool + Send + Sync);

/// External persistence backend.
///
/// Implementations own their concurrency control. The cache only guarantees
/// that each transaction sees at most one `prepare` followed by one `commit`
/// or `rollback`. Errors are surfaced to callers unchanged.
///
/// Used as `Arc<dyn CacheStore>`.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn store(&self, entry: &CacheEntry) -> anyhow::Result<()>;

    /// Removes `key`. Returns whether it existed.
    async fn remove(&self, key: &str) -> anyhow::Result<bool>;

    async fn clear(&self) -> anyhow::Result<()>;

    /// Stages `modifications` for `gtx`. With `one_phase` they are applied
    /// immediately and no `commit` follows.
    async fn prepare(
        &self,
        modifications: &[Modification],
        gtx: &GlobalTransactionId,
        one_phase: bool,
    ) -> anyhow::Result<()>;

    /// Applies the modifications staged for `gtx`. Unknown transactions are
    /// a no-op.
    async fn commit(&self, gtx: &GlobalTransactionId) -> anyhow::Result<()>;

    /// Discards the modifications staged for `gtx`.
    async fn rollback(&self, gtx: &GlobalTransactionId) -> anyhow::Result<()>;

    /// Keys accepted by `filter`.
    async fn load_all_keys(
        &self,
        filter: KeyFilter<'_>,
    ) -> anyhow::Result<HashSet<String>>;

    async fn purge_expired(&self) -> anyhow::Result<()>;

    async fn contains_key(&self, key: &str) -> anyhow::Result<bool>;

    /// Loads the live entry for `key`.
    async fn load(&self, key: &str) -> anyhow::Result<Option<CacheEntry>>;
}
