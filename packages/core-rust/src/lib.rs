//! `GridCache` Core: values, entries, consistent-hash topology, ownership,
//! write commands, and store modifications.
//!
//! Everything in this crate is pure data and pure functions; stateful
//! coordination lives in `gridcache-server`.

pub mod command;
pub mod effect;
pub mod hash;
pub mod modification;
pub mod ownership;
pub mod topology;
pub mod types;

pub use command::{CommandOutcome, Flag, Flags, WriteCommand, WriteOp};
pub use effect::{evaluate, Evaluation, KeyEffect};
pub use modification::Modification;
pub use ownership::{ConsistentHashOwnership, OwnershipResolver};
pub use topology::{Address, CacheTopology, ConsistentHash, TopologyError, UNSTAMPED_TOPOLOGY_ID};
pub use types::{now_millis, CacheEntry, Delta, Key, Metadata, Value};

