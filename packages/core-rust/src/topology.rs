//! Versioned consistent-hash topology.
//!
//! The key space is split into a fixed number of hash-wheel segments
//! ([`segment_of`]). Each segment has an ordered owner list; the first entry is
//! the segment's **primary owner**. A [`CacheTopology`] pairs that table with a
//! monotonically increasing topology id. Topologies are immutable snapshots:
//! a membership change or rebalance installs a new one with a higher id.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::hash::segment_of;

/// Topology id carried by commands that were never stamped.
///
/// Commands with this id bypass topology fencing.
pub const UNSTAMPED_TOPOLOGY_ID: i32 = -1;

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// Opaque network identity of a cluster member.
///
/// Equality is by identity (the node id string); ordering only exists to make
/// collections deterministic and carries no protocol meaning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    #[must_use]
    pub fn new(node_id: impl Into<String>) -> Self {
        Self(node_id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ---------------------------------------------------------------------------
// TopologyError
// ---------------------------------------------------------------------------

/// Reasons a consistent-hash table cannot be built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("a consistent hash needs at least one member")]
    NoMembers,
    #[error("num_owners must be positive")]
    ZeroOwners,
    #[error("num_segments must be positive")]
    ZeroSegments,
    #[error("segment {segment} has no owners")]
    EmptySegment { segment: u32 },
    #[error("segment {segment} is owned by {owner}, which is not a member")]
    UnknownOwner { segment: u32, owner: Address },
}

// ---------------------------------------------------------------------------
// ConsistentHash
// ---------------------------------------------------------------------------

/// Segment-to-owners table.
///
/// Indexed by segment id for O(1) lookup. Every segment's owner list is
/// non-empty and duplicate-free; its first element is the primary owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistentHash {
    num_owners: u32,
    members: Vec<Address>,
    segment_owners: Vec<Vec<Address>>,
}

impl ConsistentHash {
    /// Builds a table for `members` with a deterministic round-robin layout.
    ///
    /// Segment `s` is primarily owned by `members[s % n]`; its backups are the
    /// next `num_owners - 1` members, wrapping around. When there are fewer
    /// members than `num_owners`, every member owns every segment. Duplicate
    /// members are ignored (first occurrence wins).
    ///
    /// # Errors
    ///
    /// Returns an error if `members` is empty or either count is zero.
    pub fn new(
        members: &[Address],
        num_owners: u32,
        num_segments: u32,
    ) -> Result<Self, TopologyError> {
        if num_owners == 0 {
            return Err(TopologyError::ZeroOwners);
        }
        if num_segments == 0 {
            return Err(TopologyError::ZeroSegments);
        }

        let mut seen = HashSet::new();
        let members: Vec<Address> = members
            .iter()
            .filter(|m| seen.insert((*m).clone()))
            .cloned()
            .collect();
        let n = members.len();
        if n == 0 {
            return Err(TopologyError::NoMembers);
        }

        let copies = (num_owners as usize).min(n);
        let segment_owners = (0..num_segments as usize)
            .map(|segment| {
                (0..copies)
                    .map(|i| members[(segment + i) % n].clone())
                    .collect()
            })
            .collect();

        Ok(Self {
            num_owners,
            members,
            segment_owners,
        })
    }

    /// Builds a table from an explicit segment layout.
    ///
    /// Used when the layout is decided elsewhere (a coordinator, a test).
    ///
    /// # Errors
    ///
    /// Returns an error if there are no members or segments, a segment has no
    /// owners, or an owner is not listed in `members`.
    pub fn from_segment_owners(
        members: Vec<Address>,
        num_owners: u32,
        segment_owners: Vec<Vec<Address>>,
    ) -> Result<Self, TopologyError> {
        if members.is_empty() {
            return Err(TopologyError::NoMembers);
        }
        if num_owners == 0 {
            return Err(TopologyError::ZeroOwners);
        }
        if segment_owners.is_empty() {
            return Err(TopologyError::ZeroSegments);
        }
        for (segment, owners) in segment_owners.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let segment = segment as u32;
            if owners.is_empty() {
                return Err(TopologyError::EmptySegment { segment });
            }
            if let Some(owner) = owners.iter().find(|o| !members.contains(o)) {
                return Err(TopologyError::UnknownOwner {
                    segment,
                    owner: owner.clone(),
                });
            }
        }
        Ok(Self {
            num_owners,
            members,
            segment_owners,
        })
    }

    /// Configured number of copies per key.
    #[must_use]
    pub fn num_owners(&self) -> u32 {
        self.num_owners
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn num_segments(&self) -> u32 {
        self.segment_owners.len() as u32
    }

    /// Members in membership-list order.
    #[must_use]
    pub fn members(&self) -> &[Address] {
        &self.members
    }

    #[must_use]
    pub fn segment_of(&self, key: &str) -> u32 {
        segment_of(key, self.num_segments())
    }

    /// Owners of a segment, primary first.
    #[must_use]
    pub fn locate_owners_for_segment(&self, segment: u32) -> &[Address] {
        &self.segment_owners[segment as usize % self.segment_owners.len()]
    }

    /// Owners of a key, primary first. Never empty.
    #[must_use]
    pub fn locate_owners(&self, key: &str) -> &[Address] {
        self.locate_owners_for_segment(self.segment_of(key))
    }

    /// Primary owner of a key.
    #[must_use]
    pub fn locate_primary_owner(&self, key: &str) -> &Address {
        &self.locate_owners(key)[0]
    }

    /// Union of the owners of all `keys`, in order of first appearance.
    #[must_use]
    pub fn locate_all_owners<'a, I>(&self, keys: I) -> Vec<Address>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        for key in keys {
            for owner in self.locate_owners(key) {
                if seen.insert(owner) {
                    result.push(owner.clone());
                }
            }
        }
        result
    }

    /// Returns `true` if `member` holds a copy of `key`.
    #[must_use]
    pub fn is_key_local_to(&self, member: &Address, key: &str) -> bool {
        self.locate_owners(key).contains(member)
    }

    /// Segments for which `member` is an owner (primary or backup).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn segments_for_owner(&self, member: &Address) -> Vec<u32> {
        self.segment_owners
            .iter()
            .enumerate()
            .filter(|(_, owners)| owners.contains(member))
            .map(|(segment, _)| segment as u32)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// CacheTopology
// ---------------------------------------------------------------------------

/// Immutable, versioned snapshot of the key-to-owner mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTopology {
    topology_id: i32,
    consistent_hash: Arc<ConsistentHash>,
}

impl CacheTopology {
    #[must_use]
    pub fn new(topology_id: i32, consistent_hash: ConsistentHash) -> Self {
        Self {
            topology_id,
            consistent_hash: Arc::new(consistent_hash),
        }
    }

    #[must_use]
    pub fn topology_id(&self) -> i32 {
        self.topology_id
    }

    /// The table used to route reads and writes under this topology.
    #[must_use]
    pub fn read_consistent_hash(&self) -> &ConsistentHash {
        &self.consistent_hash
    }

    #[must_use]
    pub fn members(&self) -> &[Address] {
        self.consistent_hash.members()
    }

    #[must_use]
    pub fn num_owners(&self) -> u32 {
        self.consistent_hash.num_owners()
    }

    /// Derives the successor topology for a new member list.
    ///
    /// Keeps the owner and segment counts and increments the id.
    ///
    /// # Errors
    ///
    /// Returns an error if `members` is empty.
    pub fn rebalance(&self, members: &[Address]) -> Result<Self, TopologyError> {
        let ch = ConsistentHash::new(
            members,
            self.consistent_hash.num_owners(),
            self.consistent_hash.num_segments(),
        )?;
        Ok(Self::new(self.topology_id + 1, ch))
    }
}
