//! Pending-transaction bookkeeping.
//!
//! Entries are inserted when a two-phase prepare reaches the store and
//! removed when the transaction commits or rolls back, whatever the outcome
//! of the store call. Backed by [`DashMap`] so unrelated transactions never
//! contend on a single lock.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use gridcache_core::Key;

use super::id::GlobalTransactionId;

#[derive(Debug, Default)]
pub struct TransactionRegistry {
    preparing: DashMap<GlobalTransactionId, HashSet<Key>>,
    tx_stores: DashMap<GlobalTransactionId, u64>,
}

impl TransactionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a prepared transaction. `put_count` is only kept when
    /// positive.
    pub fn register(&self, gtx: &GlobalTransactionId, affected_keys: HashSet<Key>, put_count: Option<u64>) {
        self.preparing.insert(gtx.clone(), affected_keys);
        if let Some(count) = put_count.filter(|c| *c > 0) {
            self.tx_stores.insert(gtx.clone(), count);
        }
    }

    #[must_use]
    pub fn is_preparing(&self, gtx: &GlobalTransactionId) -> bool {
        self.preparing.contains_key(gtx)
    }

    /// Removes the transaction from the preparing map. Returns its affected
    /// keys if it was registered.
    pub fn remove_preparing(&self, gtx: &GlobalTransactionId) -> Option<HashSet<Key>> {
        self.preparing.remove(gtx).map(|(_, keys)| keys)
    }

    /// Removes and returns the transaction's recorded put count.
    pub fn take_store_count(&self, gtx: &GlobalTransactionId) -> Option<u64> {
        self.tx_stores.remove(gtx).map(|(_, count)| count)
    }

    /// Snapshot of the preparing map.
    #[must_use]
    pub fn preparing_snapshot(&self) -> HashMap<GlobalTransactionId, HashSet<Key>> {
        self.preparing
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Snapshot of the per-transaction put counts.
    #[must_use]
    pub fn store_counts_snapshot(&self) -> HashMap<GlobalTransactionId, u64> {
        self.tx_stores
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.preparing.is_empty() && self.tx_stores.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use gridcache_core::Address;

    use super::*;

    fn gtx() -> GlobalTransactionId {
        GlobalTransactionId::new(Address::new("n1"))
    }

    #[test]
    fn register_and_remove() {
        let registry = TransactionRegistry::new();
        let tx = gtx();
        registry.register(&tx, HashSet::from(["a".to_string()]), Some(2));
        assert!(registry.is_preparing(&tx));
        assert_eq!(registry.store_counts_snapshot().get(&tx), Some(&2));
        assert_eq!(registry.preparing_snapshot().len(), 1);

        assert_eq!(registry.remove_preparing(&tx).unwrap().len(), 1);
        assert_eq!(registry.take_store_count(&tx), Some(2));
        assert!(registry.is_empty());
        assert!(registry.remove_preparing(&tx).is_none());
    }

    #[test]
    fn zero_or_missing_counts_are_not_recorded() {
        let registry = TransactionRegistry::new();
        let a = gtx();
        let b = gtx();
        registry.register(&a, HashSet::new(), Some(0));
        registry.register(&b, HashSet::new(), None);
        assert!(registry.store_counts_snapshot().is_empty());
        assert_eq!(registry.preparing_snapshot().len(), 2);
    }
}
