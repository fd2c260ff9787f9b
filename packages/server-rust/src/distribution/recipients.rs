//! Per-operation recipient sets.
//!
//! A [`Recipients`] is built once per write from a single topology snapshot
//! and computes its owner list on first use. A topology installed while the
//! write is in flight does not change it; staleness is caught by fencing on
//! topology ids instead.

use std::sync::{Arc, OnceLock};

use gridcache_core::{Address, CacheTopology, Key, OwnershipResolver, WriteCommand, WriteOp};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    SingleKey(Key),
    MultipleKeys(Vec<Key>),
    /// Every member (clear).
    Everyone,
}

pub struct Recipients {
    target: Target,
    topology: Arc<CacheTopology>,
    resolver: Arc<dyn OwnershipResolver>,
    owners: OnceLock<Vec<Address>>,
}

impl Recipients {
    #[must_use]
    pub fn for_command(
        cmd: &WriteCommand,
        topology: Arc<CacheTopology>,
        resolver: Arc<dyn OwnershipResolver>,
    ) -> Self {
        let target = match &cmd.op {
            WriteOp::Clear => Target::Everyone,
            WriteOp::PutAll { entries, .. } => {
                Target::MultipleKeys(entries.iter().map(|(k, _)| k.clone()).collect())
            }
            WriteOp::Put { key, .. }
            | WriteOp::Remove { key, .. }
            | WriteOp::Replace { key, .. }
            | WriteOp::ApplyDelta { key, .. } => Target::SingleKey(key.clone()),
        };
        Self {
            target,
            topology,
            resolver,
            owners: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn topology(&self) -> &CacheTopology {
        &self.topology
    }

    /// The key of a single-key write.
    #[must_use]
    pub fn single_key(&self) -> Option<&str> {
        match &self.target {
            Target::SingleKey(key) => Some(key),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.target == Target::Everyone
    }

    /// Primary owner of a single-key write.
    #[must_use]
    pub fn primary(&self) -> Option<Address> {
        self.single_key()
            .map(|key| self.resolver.primary_owner_of(key, &self.topology))
    }

    /// Owners of every key touched, primary first for single-key writes.
    /// Every member for a broadcast.
    pub fn owners(&self) -> &[Address] {
        self.owners.get_or_init(|| match &self.target {
            Target::SingleKey(key) => self.resolver.owners_of(key, &self.topology),
            Target::MultipleKeys(keys) => {
                let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
                self.resolver.owners_of_keys(&keys, &self.topology)
            }
            Target::Everyone => self.topology.members().to_vec(),
        })
    }

    /// Owners other than `me`.
    #[must_use]
    pub fn others(&self, me: &Address) -> Vec<Address> {
        self.owners().iter().filter(|a| *a != me).cloned().collect()
    }

    #[must_use]
    pub fn is_single_owner(&self) -> bool {
        self.resolver.is_single_owner(&self.topology)
    }
}
