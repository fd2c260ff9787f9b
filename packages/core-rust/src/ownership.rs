//! Ownership resolution: "who owns key K under topology T?"
//!
//! The whole write protocol rests on every node answering this identically
//! for the same `(key, topology id)` pair, so resolvers must be pure: no I/O,
//! no clocks, no randomness.

use std::collections::HashSet;

use crate::topology::{Address, CacheTopology};

/// Answers ownership questions against a topology snapshot.
///
/// Used as `Arc<dyn OwnershipResolver>`.
pub trait OwnershipResolver: Send + Sync {
    /// Owners of `key`, primary first. Never empty for a non-empty cluster.
    fn owners_of(&self, key: &str, topology: &CacheTopology) -> Vec<Address>;

    /// The member that serializes writes to `key`.
    fn primary_owner_of(&self, key: &str, topology: &CacheTopology) -> Address;

    /// Whether the topology keeps exactly one copy of each key.
    fn is_single_owner(&self, topology: &CacheTopology) -> bool;

    /// Union of the owners of `keys`, in order of first appearance.
    fn owners_of_keys(&self, keys: &[&str], topology: &CacheTopology) -> Vec<Address> {
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        for key in keys {
            for owner in self.owners_of(key, topology) {
                if seen.insert(owner.clone()) {
                    result.push(owner);
                }
            }
        }
        result
    }

    /// Whether `member` holds a copy of `key`.
    fn is_owner(&self, member: &Address, key: &str, topology: &CacheTopology) -> bool {
        self.owners_of(key, topology).contains(member)
    }
}

/// Resolver backed by the topology's read consistent hash.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsistentHashOwnership;

impl OwnershipResolver for ConsistentHashOwnership {
    fn owners_of(&self, key: &str, topology: &CacheTopology) -> Vec<Address> {
        topology.read_consistent_hash().locate_owners(key).to_vec()
    }

    fn primary_owner_of(&self, key: &str, topology: &CacheTopology) -> Address {
        topology
            .read_consistent_hash()
            .locate_primary_owner(key)
            .clone()
    }

    fn is_single_owner(&self, topology: &CacheTopology) -> bool {
        topology.num_owners() == 1
    }

    fn owners_of_keys(&self, keys: &[&str], topology: &CacheTopology) -> Vec<Address> {
        topology
            .read_consistent_hash()
            .locate_all_owners(keys.iter().copied())
    }

    fn is_owner(&self, member: &Address, key: &str, topology: &CacheTopology) -> bool {
        topology.read_consistent_hash().is_key_local_to(member, key)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::topology::ConsistentHash;

    fn topology(members: usize, owners: u32, segments: u32) -> CacheTopology {
        let addrs: Vec<Address> = (0..members).map(|i| Address::new(format!("node-{i}"))).collect();
        CacheTopology::new(7, ConsistentHash::new(&addrs, owners, segments).unwrap())
    }

    #[test]
    fn single_owner_detection() {
        let resolver = ConsistentHashOwnership;
        assert!(resolver.is_single_owner(&topology(3, 1, 8)));
        assert!(!resolver.is_single_owner(&topology(3, 2, 8)));
    }

    #[test]
    fn is_owner_matches_owner_list() {
        let resolver = ConsistentHashOwnership;
        let t = topology(4, 2, 16);
        for i in 0..50 {
            let key = format!("k{i}");
            let owners = resolver.owners_of(&key, &t);
            for member in t.members() {
                assert_eq!(resolver.is_owner(member, &key, &t), owners.contains(member));
            }
        }
    }

    #[test]
    fn owners_of_keys_default_matches_specialized() {
        struct Naive;
        impl OwnershipResolver for Naive {
            fn owners_of(&self, key: &str, topology: &CacheTopology) -> Vec<Address> {
                ConsistentHashOwnership.owners_of(key, topology)
            }
            fn primary_owner_of(&self, key: &str, topology: &CacheTopology) -> Address {
                ConsistentHashOwnership.primary_owner_of(key, topology)
            }
            fn is_single_owner(&self, topology: &CacheTopology) -> bool {
                ConsistentHashOwnership.is_single_owner(topology)
            }
        }

        let t = topology(5, 2, 32);
        let keys = ["a", "b", "c", "d"];
        assert_eq!(
            Naive.owners_of_keys(&keys, &t),
            ConsistentHashOwnership.owners_of_keys(&keys, &t)
        );
    }

    proptest! {
        #[test]
        fn owners_non_empty_and_primary_first(
            key in ".*",
            members in 1usize..8,
            owners in 1u32..4,
            segments in 1u32..64,
        ) {
            let resolver = ConsistentHashOwnership;
            let t = topology(members, owners, segments);
            let list = resolver.owners_of(&key, &t);
            prop_assert!(!list.is_empty());
            prop_assert_eq!(&list[0], &resolver.primary_owner_of(&key, &t));
            prop_assert!(list.len() <= owners as usize);
        }

        #[test]
        fn resolution_is_deterministic(key in "[a-z0-9]{0,16}") {
            let resolver = ConsistentHashOwnership;
            let a = topology(4, 2, 32);
            let b = topology(4, 2, 32);
            prop_assert_eq!(resolver.owners_of(&key, &a), resolver.owners_of(&key, &b));
        }
    }
}
