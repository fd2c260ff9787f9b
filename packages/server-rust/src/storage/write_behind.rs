//! Write-behind store decorator.
//!
//! Modifications are queued and coalesced per key (only the latest write for
//! a key survives; a `Clear` drops everything queued before it). The queue is
//! drained into the delegate store by [`WriteBehindStore::flush`], which runs
//! on a background worker tick, when the queue reaches capacity, and on
//! shutdown. Reads consult the queue before the delegate so callers always
//! see their own writes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use gridcache_core::{now_millis, CacheEntry, Key, Modification};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::store::{CacheStore, KeyFilter};
use crate::service::worker::BackgroundRunnable;
use crate::transaction::GlobalTransactionId;

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct Queue {
    clear: bool,
    order: Vec<Key>,
    pending: HashMap<Key, Modification>,
}

impl Queue {
    fn push(&mut self, modification: Modification) {
        match modification.key() {
            None => {
                self.clear = true;
                self.order.clear();
                self.pending.clear();
            }
            Some(key) => {
                let key = key.to_string();
                if self.pending.insert(key.clone(), modification).is_none() {
                    self.order.push(key);
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.pending.len()
    }

    fn is_empty(&self) -> bool {
        !self.clear && self.pending.is_empty()
    }

    /// `Some(entry-or-none)` when the queue decides the key's state.
    fn lookup(&self, key: &str) -> Option<Option<CacheEntry>> {
        match self.pending.get(key) {
            Some(Modification::Store(entry)) => Some(Some(entry.clone())),
            Some(_) => Some(None),
            None if self.clear => Some(None),
            None => None,
        }
    }

    fn apply_to_keys(&self, keys: &mut HashSet<String>, filter: KeyFilter<'_>, now: i64) {
        if self.clear {
            keys.clear();
        }
        for modification in self.pending.values() {
            match modification {
                Modification::Store(entry) => {
                    if !entry.is_expired(now) && filter(&entry.key) {
                        keys.insert(entry.key.clone());
                    } else {
                        keys.remove(&entry.key);
                    }
                }
                Modification::Remove(key) => {
                    keys.remove(key);
                }
                Modification::Clear => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// WriteBehindStore
// ---------------------------------------------------------------------------

pub struct WriteBehindStore {
    delegate: Arc<dyn CacheStore>,
    capacity: usize,
    queue: Mutex<Queue>,
    in_flight: Mutex<Option<Queue>>,
    staged: DashMap<GlobalTransactionId, Vec<Modification>>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl WriteBehindStore {
    /// Wraps `delegate`. `capacity` is the number of distinct queued keys
    /// that triggers an inline flush.
    #[must_use]
    pub fn new(delegate: Arc<dyn CacheStore>, capacity: usize) -> Self {
        Self {
            delegate,
            capacity: capacity.max(1),
            queue: Mutex::new(Queue::default()),
            in_flight: Mutex::new(None),
            staged: DashMap::new(),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Number of distinct keys waiting to be flushed.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queue.lock().len()
    }

    async fn enqueue(&self, modifications: impl IntoIterator<Item = Modification>) -> anyhow::Result<()> {
        let full = {
            let mut queue = self.queue.lock();
            for m in modifications {
                queue.push(m);
            }
            queue.len() >= self.capacity
        };
        if full {
            debug!(capacity = self.capacity, "write-behind queue full, flushing inline");
            self.flush().await?;
        }
        Ok(())
    }

    /// Drains the queue into the delegate store.
    ///
    /// # Errors
    ///
    /// Returns the first delegate failure. The batch that failed is dropped.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let _guard = self.flush_lock.lock().await;
        let batch = std::mem::take(&mut *self.queue.lock());
        if batch.is_empty() {
            return Ok(());
        }
        *self.in_flight.lock() = Some(batch.clone());
        let result = self.write_batch(&batch).await;
        *self.in_flight.lock() = None;
        if let Err(e) = &result {
            warn!(error = %e, dropped = batch.len(), "write-behind flush failed");
        }
        result
    }

    async fn write_batch(&self, batch: &Queue) -> anyhow::Result<()> {
        if batch.clear {
            self.delegate.clear().await?;
        }
        for key in &batch.order {
            match batch.pending.get(key) {
                Some(Modification::Store(entry)) => self.delegate.store(entry).await?,
                Some(Modification::Remove(key)) => {
                    self.delegate.remove(key).await?;
                }
                Some(Modification::Clear) | None => {}
            }
        }
        Ok(())
    }

    fn queued_state(&self, key: &str) -> Option<Option<CacheEntry>> {
        if let Some(state) = self.queue.lock().lookup(key) {
            return Some(state);
        }
        self.in_flight.lock().as_ref().and_then(|q| q.lookup(key))
    }
}

#[async_trait]
impl CacheStore for WriteBehindStore {
    async fn store(&self, entry: &CacheEntry) -> anyhow::Result<()> {
        self.enqueue([Modification::Store(entry.clone())]).await
    }

    async fn remove(&self, key: &str) -> anyhow::Result<bool> {
        let existed = self.load(key).await?.is_some();
        self.enqueue([Modification::Remove(key.to_string())]).await?;
        Ok(existed)
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.enqueue([Modification::Clear]).await
    }

    async fn prepare(
        &self,
        modifications: &[Modification],
        gtx: &GlobalTransactionId,
        one_phase: bool,
    ) -> anyhow::Result<()> {
        if one_phase {
            self.enqueue(modifications.iter().cloned()).await
        } else {
            self.staged.insert(gtx.clone(), modifications.to_vec());
            Ok(())
        }
    }

    async fn commit(&self, gtx: &GlobalTransactionId) -> anyhow::Result<()> {
        match self.staged.remove(gtx) {
            Some((_, modifications)) => self.enqueue(modifications).await,
            None => Ok(()),
        }
    }

    async fn rollback(&self, gtx: &GlobalTransactionId) -> anyhow::Result<()> {
        self.staged.remove(gtx);
        Ok(())
    }

    async fn load_all_keys(
        &self,
        filter: KeyFilter<'_>,
    ) -> anyhow::Result<HashSet<String>> {
        let queued = self.queue.lock().clone();
        let in_flight = self.in_flight.lock().clone();
        let now = now_millis();

        let mut keys = if queued.clear || in_flight.as_ref().is_some_and(|q| q.clear) {
            HashSet::new()
        } else {
            self.delegate.load_all_keys(filter).await?
        };
        if let Some(layer) = &in_flight {
            layer.apply_to_keys(&mut keys, filter, now);
        }
        queued.apply_to_keys(&mut keys, filter, now);
        Ok(keys)
    }

    async fn purge_expired(&self) -> anyhow::Result<()> {
        self.delegate.purge_expired().await
    }

    async fn contains_key(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.load(key).await?.is_some())
    }

    async fn load(&self, key: &str) -> anyhow::Result<Option<CacheEntry>> {
        match self.queued_state(key) {
            Some(state) => Ok(state.filter(|e| !e.is_expired(now_millis()))),
            None => self.delegate.load(key).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Background flushing
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum WriteBehindTask {
    /// Flush now instead of waiting for the next tick.
    Flush,
}

/// Drives [`WriteBehindStore::flush`] from a
/// [`BackgroundWorker`](crate::service::worker::BackgroundWorker).
pub struct WriteBehindFlusher {
    store: Arc<WriteBehindStore>,
}

impl WriteBehindFlusher {
    #[must_use]
    pub fn new(store: Arc<WriteBehindStore>) -> Self {
        Self { store }
    }

    async fn flush_logged(&self) {
        // Failures are already logged by flush().
        let _ = self.store.flush().await;
    }
}

#[async_trait]
impl BackgroundRunnable for WriteBehindFlusher {
    type Task = WriteBehindTask;

    fn name(&self) -> &'static str {
        "write-behind"
    }

    async fn run(&mut self, task: WriteBehindTask) {
        match task {
            WriteBehindTask::Flush => self.flush_logged().await,
        }
    }

    async fn on_tick(&mut self) {
        self.flush_logged().await;
    }

    async fn shutdown(&mut self) {
        self.flush_logged().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gridcache_core::{Metadata, Value};

    use super::*;
    use crate::service::worker::BackgroundWorker;
    use crate::storage::memory::InMemoryStore;

    fn entry(key: &str, v: i64) -> CacheEntry {
        CacheEntry::new(key, Value::Int(v), Metadata::IMMORTAL)
    }

    fn setup(capacity: usize) -> (Arc<InMemoryStore>, Arc<WriteBehindStore>) {
        let delegate = Arc::new(InMemoryStore::new());
        let store = Arc::new(WriteBehindStore::new(
            Arc::clone(&delegate) as Arc<dyn CacheStore>,
            capacity,
        ));
        (delegate, store)
    }

    #[tokio::test]
    async fn writes_are_deferred_but_readable() {
        let (delegate, store) = setup(100);
        store.store(&entry("a", 1)).await.unwrap();
        assert!(delegate.is_empty());
        assert_eq!(store.load("a").await.unwrap().unwrap().value, Value::Int(1));
        assert!(store.contains_key("a").await.unwrap());

        store.flush().await.unwrap();
        assert_eq!(delegate.len(), 1);
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn modifications_coalesce_per_key() {
        let (delegate, store) = setup(100);
        delegate.store(&entry("b", 0)).await.unwrap();
        store.store(&entry("a", 1)).await.unwrap();
        store.store(&entry("a", 2)).await.unwrap();
        assert!(store.remove("b").await.unwrap());
        assert!(store.load("b").await.unwrap().is_none());
        assert_eq!(store.pending_count(), 2);

        store.flush().await.unwrap();
        let journal = delegate.journal();
        // One seed write plus one write per key.
        assert_eq!(journal.len(), 3);
        assert_eq!(delegate.get("a").unwrap().value, Value::Int(2));
        assert!(delegate.get("b").is_none());
    }

    #[tokio::test]
    async fn clear_supersedes_queued_writes() {
        let (delegate, store) = setup(100);
        delegate.store(&entry("old", 0)).await.unwrap();
        store.store(&entry("a", 1)).await.unwrap();
        store.clear().await.unwrap();
        store.store(&entry("b", 2)).await.unwrap();

        let keys = store.load_all_keys(&|_: &str| true).await.unwrap();
        assert_eq!(keys, HashSet::from(["b".to_string()]));
        assert!(store.load("old").await.unwrap().is_none());

        store.flush().await.unwrap();
        assert_eq!(delegate.len(), 1);
        assert!(delegate.get("b").is_some());
    }

    #[tokio::test]
    async fn key_listing_filters_delegate_and_queue() {
        let (delegate, store) = setup(100);
        delegate.store(&entry("keep:a", 0)).await.unwrap();
        delegate.store(&entry("drop:a", 0)).await.unwrap();
        store.store(&entry("keep:b", 1)).await.unwrap();
        store.store(&entry("drop:b", 1)).await.unwrap();

        let wanted = String::from("keep:");
        let keys = store
            .load_all_keys(&|key: &str| key.starts_with(wanted.as_str()))
            .await
            .unwrap();
        assert_eq!(keys, HashSet::from(["keep:a".to_string(), "keep:b".to_string()]));
    }

    #[tokio::test]
    async fn full_queue_flushes_inline() {
        let (delegate, store) = setup(2);
        store.store(&entry("a", 1)).await.unwrap();
        assert!(delegate.is_empty());
        store.store(&entry("b", 2)).await.unwrap();
        assert_eq!(delegate.len(), 2);
    }

    #[tokio::test]
    async fn two_phase_commit_enqueues_on_commit() {
        let (delegate, store) = setup(100);
        let gtx = GlobalTransactionId::new(gridcache_core::Address::new("n1"));
        store
            .prepare(&[Modification::Store(entry("a", 1))], &gtx, false)
            .await
            .unwrap();
        assert!(store.load("a").await.unwrap().is_none());
        store.commit(&gtx).await.unwrap();
        store.flush().await.unwrap();
        assert!(delegate.get("a").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn background_worker_flushes_on_tick() {
        let (delegate, store) = setup(100);
        let mut worker = BackgroundWorker::start(WriteBehindFlusher::new(Arc::clone(&store)), 50);
        store.store(&entry("a", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(delegate.len(), 1);

        store.store(&entry("b", 2)).await.unwrap();
        worker.stop().await;
        assert_eq!(delegate.len(), 2);
    }
}
