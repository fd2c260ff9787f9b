//! The node's view of the current cache topology.
//!
//! Readers take a snapshot with [`TopologyManager::current`] and use it for the
//! whole operation; a concurrent install never changes a snapshot already
//! taken. Staleness is caught by comparing topology ids, not by re-reading.

use std::sync::Arc;

use arc_swap::ArcSwap;
use gridcache_core::{Address, CacheTopology, OwnershipResolver};
use tracing::debug;

/// Holds the installed [`CacheTopology`] and the resolver used to query it.
pub struct TopologyManager {
    current: ArcSwap<CacheTopology>,
    resolver: Arc<dyn OwnershipResolver>,
}

impl std::fmt::Debug for TopologyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyManager")
            .field("topology_id", &self.topology_id())
            .finish_non_exhaustive()
    }
}

impl TopologyManager {
    #[must_use]
    pub fn new(initial: CacheTopology, resolver: Arc<dyn OwnershipResolver>) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            resolver,
        }
    }

    /// Snapshot of the installed topology.
    #[must_use]
    pub fn current(&self) -> Arc<CacheTopology> {
        self.current.load_full()
    }

    #[must_use]
    pub fn topology_id(&self) -> i32 {
        self.current.load().topology_id()
    }

    #[must_use]
    pub fn resolver(&self) -> &Arc<dyn OwnershipResolver> {
        &self.resolver
    }

    /// Installs `topology` if its id is newer than the installed one.
    ///
    /// Returns `false` (and keeps the current topology) otherwise.
    pub fn install(&self, topology: CacheTopology) -> bool {
        let previous = self.current.load();
        if topology.topology_id() <= previous.topology_id() {
            debug!(
                installed = previous.topology_id(),
                offered = topology.topology_id(),
                "ignoring stale topology"
            );
            return false;
        }
        debug!(
            from = previous.topology_id(),
            to = topology.topology_id(),
            members = topology.members().len(),
            "installing topology"
        );
        self.current.store(Arc::new(topology));
        true
    }

    /// Primary owner of `key` under the current topology.
    #[must_use]
    pub fn primary_owner(&self, key: &str) -> Address {
        self.resolver.primary_owner_of(key, &self.current())
    }

    /// Owners of `key` under the current topology, primary first.
    #[must_use]
    pub fn owners(&self, key: &str) -> Vec<Address> {
        self.resolver.owners_of(key, &self.current())
    }

    #[must_use]
    pub fn is_owner(&self, member: &Address, key: &str) -> bool {
        self.resolver.is_owner(member, key, &self.current())
    }
}
