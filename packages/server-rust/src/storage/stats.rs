//! Store statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counter of entries written to the persistent store.
///
/// When disabled, nothing is counted.
#[derive(Debug)]
pub struct StoreStatistics {
    enabled: bool,
    cache_stores: AtomicU64,
}

impl StoreStatistics {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            cache_stores: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn add(&self, count: u64) {
        if self.enabled && count > 0 {
            self.cache_stores.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn increment(&self) {
        self.add(1);
    }

    /// Number of entries stored since the last reset.
    #[must_use]
    pub fn cache_stores(&self) -> u64 {
        self.cache_stores.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.cache_stores.store(0, Ordering::Relaxed);
    }
}
