//! Bridge between in-memory mutations and the persistent store.
//!
//! Non-transactional writes are persisted after they were applied in memory
//! (`after_*`); transactional writes reach the store only through
//! `prepare`/`commit`/`rollback`. Every write-through call is skipped, with no
//! side effect and no statistics change, when the store is disabled, the
//! command carries a skip flag, or this node is not the proper writer.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gridcache_core::{CacheEntry, Flag, Flags, Modification, WriteCommand};
use tracing::{debug, trace};

use super::stats::StoreStatistics;
use super::store::{CacheStore, KeyFilter};
use crate::config::PersistenceConfig;
use crate::context::InvocationContext;
use crate::error::{CacheError, CacheResult};
use crate::transaction::GlobalTransactionId;

pub struct PersistentStoreGateway {
    store: Option<Arc<dyn CacheStore>>,
    shared: bool,
    ignore_modifications: bool,
    enabled: AtomicBool,
    stats: StoreStatistics,
}

impl PersistentStoreGateway {
    #[must_use]
    pub fn new(
        store: Option<Arc<dyn CacheStore>>,
        config: &PersistenceConfig,
        statistics_enabled: bool,
    ) -> Self {
        let enabled = config.enabled && store.is_some();
        Self {
            store,
            shared: config.shared,
            ignore_modifications: config.ignore_modifications,
            enabled: AtomicBool::new(enabled),
            stats: StoreStatistics::new(statistics_enabled),
        }
    }

    /// A gateway with no store behind it.
    #[must_use]
    pub fn without_store() -> Self {
        Self::new(None, &PersistenceConfig::default(), false)
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    #[must_use]
    pub fn statistics(&self) -> &StoreStatistics {
        &self.stats
    }

    /// Turns every store interaction into a no-op from now on.
    pub fn disable(&self) {
        debug!("disabling persistent store");
        self.enabled.store(false, Ordering::Release);
    }

    fn loader(&self) -> Option<&Arc<dyn CacheStore>> {
        if self.enabled.load(Ordering::Acquire) {
            self.store.as_ref()
        } else {
            None
        }
    }

    fn writer(&self) -> Option<&Arc<dyn CacheStore>> {
        if self.ignore_modifications {
            return None;
        }
        self.loader()
    }

    /// Whether writes may reach the store at all.
    #[must_use]
    pub fn is_store_enabled(&self) -> bool {
        self.writer().is_some()
    }

    /// Whether a command carrying `flags` may write to the store.
    #[must_use]
    pub fn is_store_enabled_for(&self, flags: Flags) -> bool {
        if !self.is_store_enabled() {
            return false;
        }
        if flags.contains(Flag::SkipCacheStore) {
            trace!("skipping cache store: SkipCacheStore flag");
            return false;
        }
        if self.shared && flags.contains(Flag::SkipSharedCacheStore) {
            trace!("skipping cache store: shared store and SkipSharedCacheStore flag");
            return false;
        }
        true
    }

    /// Whether this node may persist a write to a key.
    ///
    /// For a shared store only the originating node writes. For a private
    /// store every node that holds the key in memory (`applied_locally`)
    /// persists its own copy.
    #[must_use]
    pub fn is_proper_writer(&self, ctx: &InvocationContext, applied_locally: bool) -> bool {
        if self.shared {
            ctx.origin_local
        } else {
            applied_locally
        }
    }

    /// Every node clears its store.
    #[must_use]
    pub fn is_proper_writer_for_clear(&self, _ctx: &InvocationContext) -> bool {
        true
    }

    fn skip_write_through(&self, ctx: &InvocationContext, cmd: &WriteCommand) -> Option<&Arc<dyn CacheStore>> {
        if ctx.in_tx || !self.is_store_enabled_for(cmd.flags) {
            return None;
        }
        self.writer()
    }

    // -- non-transactional write-through ------------------------------------

    /// Persists the entry written by a successful put, replace, or delta.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Store`] if the store fails.
    pub async fn after_put(
        &self,
        ctx: &InvocationContext,
        cmd: &WriteCommand,
        entry: &CacheEntry,
        applied_locally: bool,
    ) -> CacheResult<()> {
        if !cmd.is_successful() || !self.is_proper_writer(ctx, applied_locally) {
            return Ok(());
        }
        let Some(store) = self.skip_write_through(ctx, cmd) else {
            return Ok(());
        };
        store.store(entry).await.map_err(CacheError::store)?;
        trace!(key = %entry.key, "stored entry");
        self.stats.increment();
        Ok(())
    }

    /// Removes the key of a successful remove from the store.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Store`] if the store fails.
    pub async fn after_remove(
        &self,
        ctx: &InvocationContext,
        cmd: &WriteCommand,
        key: &str,
        applied_locally: bool,
    ) -> CacheResult<()> {
        if !cmd.is_successful() || !self.is_proper_writer(ctx, applied_locally) {
            return Ok(());
        }
        let Some(store) = self.skip_write_through(ctx, cmd) else {
            return Ok(());
        };
        let existed = store.remove(key).await.map_err(CacheError::store)?;
        trace!(%key, existed, "removed entry from store");
        Ok(())
    }

    /// Persists every entry of a put-all this node may write. Statistics count
    /// every key of the command.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Store`] on the first store failure.
    pub async fn after_put_all(
        &self,
        ctx: &InvocationContext,
        cmd: &WriteCommand,
        entries: &[(CacheEntry, bool)],
    ) -> CacheResult<()> {
        let Some(store) = self.skip_write_through(ctx, cmd) else {
            return Ok(());
        };
        for (entry, applied_locally) in entries {
            if self.is_proper_writer(ctx, *applied_locally) {
                store.store(entry).await.map_err(CacheError::store)?;
                trace!(key = %entry.key, "stored entry");
            }
        }
        self.stats.add(cmd.keys().len() as u64);
        Ok(())
    }

    /// Clears the store for a clear command.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Store`] if the store fails.
    pub async fn clear(&self, ctx: &InvocationContext, cmd: &WriteCommand) -> CacheResult<()> {
        if !self.is_proper_writer_for_clear(ctx) {
            return Ok(());
        }
        let Some(store) = self.skip_write_through(ctx, cmd) else {
            return Ok(());
        };
        store.clear().await.map_err(CacheError::store)?;
        trace!("cleared cache store");
        Ok(())
    }

    // -- transactional ------------------------------------------------------

    /// # Errors
    ///
    /// Returns [`CacheError::Store`] if the store fails.
    pub async fn prepare(
        &self,
        modifications: &[Modification],
        gtx: &GlobalTransactionId,
        one_phase: bool,
    ) -> CacheResult<()> {
        match self.writer() {
            Some(store) => store
                .prepare(modifications, gtx, one_phase)
                .await
                .map_err(CacheError::store),
            None => Ok(()),
        }
    }

    /// # Errors
    ///
    /// Returns [`CacheError::Store`] if the store fails.
    pub async fn commit(&self, gtx: &GlobalTransactionId) -> CacheResult<()> {
        match self.writer() {
            Some(store) => store.commit(gtx).await.map_err(CacheError::store),
            None => Ok(()),
        }
    }

    /// # Errors
    ///
    /// Returns [`CacheError::Store`] if the store fails.
    pub async fn rollback(&self, gtx: &GlobalTransactionId) -> CacheResult<()> {
        match self.writer() {
            Some(store) => store.rollback(gtx).await.map_err(CacheError::store),
            None => Ok(()),
        }
    }

    // -- loading ------------------------------------------------------------

    /// Loads `key` unless loading is skipped or the store is disabled.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Store`] if the store fails.
    pub async fn load(&self, key: &str, flags: Flags) -> CacheResult<Option<CacheEntry>> {
        if flags.contains(Flag::SkipCacheLoad) {
            return Ok(None);
        }
        match self.loader() {
            Some(store) => store.load(key).await.map_err(CacheError::store),
            None => Ok(None),
        }
    }

    /// # Errors
    ///
    /// Returns [`CacheError::Store`] if the store fails.
    pub async fn contains_key(&self, key: &str) -> CacheResult<bool> {
        match self.loader() {
            Some(store) => store.contains_key(key).await.map_err(CacheError::store),
            None => Ok(false),
        }
    }

    /// # Errors
    ///
    /// Returns [`CacheError::Store`] if the store fails.
    pub async fn load_all_keys(
        &self,
        filter: KeyFilter<'_>,
    ) -> CacheResult<HashSet<String>> {
        match self.loader() {
            Some(store) => store.load_all_keys(filter).await.map_err(CacheError::store),
            None => Ok(HashSet::new()),
        }
    }

    /// # Errors
    ///
    /// Returns [`CacheError::Store`] if the store fails.
    pub async fn purge_expired(&self) -> CacheResult<()> {
        match self.writer() {
            Some(store) => store.purge_expired().await.map_err(CacheError::store),
            None => Ok(()),
        }
    }

    /// Clears the store regardless of flags (startup purge).
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Store`] if the store fails.
    pub async fn purge_all(&self) -> CacheResult<()> {
        match self.writer() {
            Some(store) => store.clear().await.map_err(CacheError::store),
            None => Ok(()),
        }
    }
}
