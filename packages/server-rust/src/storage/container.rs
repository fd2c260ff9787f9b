//! Local in-memory data container.
//!
//! Holds the entries this node owns. Reads never return expired entries; an
//! expired entry found on read is dropped on the spot.

use dashmap::DashMap;
use gridcache_core::{CacheEntry, Key};

/// Concurrent map of live entries backed by [`DashMap`].
#[derive(Default)]
pub struct DataContainer {
    entries: DashMap<Key, CacheEntry>,
}

impl DataContainer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live entry for `key`, touching it for max-idle tracking.
    #[must_use]
    pub fn get(&self, key: &str, now: i64) -> Option<CacheEntry> {
        {
            let mut entry = self.entries.get_mut(key)?;
            if !entry.is_expired(now) {
                entry.touch(now);
                return Some(entry.clone());
            }
        }
        self.entries.remove_if(key, |_, e| e.is_expired(now));
        None
    }

    /// Returns the live entry without touching it.
    #[must_use]
    pub fn peek(&self, key: &str, now: i64) -> Option<CacheEntry> {
        self.entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.clone())
    }

    pub fn put(&self, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(entry.key.clone(), entry)
    }

    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        self.entries.remove(key).map(|(_, e)| e)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn contains_key(&self, key: &str, now: i64) -> bool {
        self.peek(key, now).is_some()
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

    /// Keys of all live entries.
    #[must_use]
    pub fn keys(&self, now: i64) -> Vec<Key> {
        self.entries
            .iter()
            .filter(|e| !e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Drops every expired entry. Returns how many were removed.
    pub fn purge_expired(&self, now: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before.saturating_sub(self.entries.len())
    }
}
