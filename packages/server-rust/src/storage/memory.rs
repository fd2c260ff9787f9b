//! In-memory [`CacheStore`] backed by [`DashMap`].
//!
//! Honours two-phase prepare/commit/rollback and keeps a journal of every
//! modification it applied, in order. Several nodes may share one instance
//! to model a shared store.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use gridcache_core::{now_millis, CacheEntry, Key, Modification};
use parking_lot::Mutex;
use tracing::trace;

use super::store::{CacheStore, KeyFilter};
use crate::transaction::GlobalTransactionId;

#[derive(Default)]
pub struct InMemoryStore {
    entries: DashMap<Key, CacheEntry>,
    staged: DashMap<GlobalTransactionId, Vec<Modification>>,
    journal: Mutex<Vec<Modification>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Modifications applied so far, oldest first.
    #[must_use]
    pub fn journal(&self) -> Vec<Modification> {
        self.journal.lock().clone()
    }

    /// Number of entries held, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Peeks at the stored entry without expiry checks.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    /// Transactions with staged, uncommitted modifications.
    #[must_use]
    pub fn staged_transactions(&self) -> usize {
        self.staged.len()
    }

    fn apply(&self, modification: &Modification) -> bool {
        let existed = match modification {
            Modification::Store(entry) => {
                self.entries.insert(entry.key.clone(), entry.clone());
                true
            }
            Modification::Remove(key) => self.entries.remove(key).is_some(),
            Modification::Clear => {
                self.entries.clear();
                true
            }
        };
        self.journal.lock().push(modification.clone());
        existed
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    async fn store(&self, entry: &CacheEntry) -> anyhow::Result<()> {
        self.apply(&Modification::Store(entry.clone()));
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.apply(&Modification::Remove(key.to_string())))
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.apply(&Modification::Clear);
        Ok(())
    }

    async fn prepare(
        &self,
        modifications: &[Modification],
        gtx: &GlobalTransactionId,
        one_phase: bool,
    ) -> anyhow::Result<()> {
        if one_phase {
            for m in modifications {
                self.apply(m);
            }
        } else {
            trace!(%gtx, count = modifications.len(), "staging modifications");
            self.staged.insert(gtx.clone(), modifications.to_vec());
        }
        Ok(())
    }

    async fn commit(&self, gtx: &GlobalTransactionId) -> anyhow::Result<()> {
        if let Some((_, modifications)) = self.staged.remove(gtx) {
            for m in &modifications {
                self.apply(m);
            }
        }
        Ok(())
    }

    async fn rollback(&self, gtx: &GlobalTransactionId) -> anyhow::Result<()> {
        self.staged.remove(gtx);
        Ok(())
    }

    async fn load_all_keys(
        &self,
        filter: KeyFilter<'_>,
    ) -> anyhow::Result<HashSet<String>> {
        let now = now_millis();
        Ok(self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired(now) && filter(e.key()))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn purge_expired(&self) -> anyhow::Result<()> {
        let now = now_millis();
        self.entries.retain(|_, e| !e.is_expired(now));
        Ok(())
    }

    async fn contains_key(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.load(key).await?.is_some())
    }

    async fn load(&self, key: &str) -> anyhow::Result<Option<CacheEntry>> {
        let now = now_millis();
        Ok(self
            .entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.clone()))
    }
}
