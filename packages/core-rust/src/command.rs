//! Write commands and the flags that steer them.
//!
//! A [`WriteCommand`] is the unit routed to owners, replicated to backups,
//! buffered by transactions, and converted into store
//! [`Modification`](crate::modification::Modification)s. The operation set is
//! closed ([`WriteOp`]), so every stage handles it with an exhaustive `match`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::topology::UNSTAMPED_TOPOLOGY_ID;
use crate::types::{Delta, Key, Metadata, Value};

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// Per-invocation behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Flag {
    /// Do not write through to, or clear, the persistent store.
    SkipCacheStore,
    /// Like `SkipCacheStore`, but only when the store is shared.
    SkipSharedCacheStore,
    /// Do not load missing entries from the persistent store.
    SkipCacheLoad,
    /// Do not fetch the previous value from a remote owner.
    SkipRemoteLookup,
    /// Apply on this node only; no forwarding or replication.
    CacheModeLocal,
    /// Replicate synchronously regardless of the cache mode.
    ForceSynchronous,
    /// Replicate asynchronously regardless of the cache mode.
    ForceAsynchronous,
    /// The caller does not need the previous value.
    IgnoreReturnValues,
}

impl Flag {
    const ALL: [Flag; 8] = [
        Flag::SkipCacheStore,
        Flag::SkipSharedCacheStore,
        Flag::SkipCacheLoad,
        Flag::SkipRemoteLookup,
        Flag::CacheModeLocal,
        Flag::ForceSynchronous,
        Flag::ForceAsynchronous,
        Flag::IgnoreReturnValues,
    ];

    const fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// Compact set of [`Flag`]s.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flags(u16);

impl Flags {
    pub const EMPTY: Self = Self(0);

    #[must_use]
    pub fn of(flags: &[Flag]) -> Self {
        flags.iter().fold(Self::EMPTY, |acc, f| acc.with(*f))
    }

    #[must_use]
    pub const fn with(self, flag: Flag) -> Self {
        Self(self.0 | flag.bit())
    }

    pub fn insert(&mut self, flag: Flag) {
        self.0 |= flag.bit();
    }

    #[must_use]
    pub const fn contains(self, flag: Flag) -> bool {
        self.0 & flag.bit() != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Flag> {
        Flag::ALL.into_iter().filter(move |f| self.contains(*f))
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

// ---------------------------------------------------------------------------
// WriteOp / WriteCommand
// ---------------------------------------------------------------------------

/// The closed set of write operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteOp {
    /// Unconditional put, or put-if-absent when `if_absent` is set.
    Put {
        key: Key,
        value: Value,
        metadata: Metadata,
        if_absent: bool,
    },
    /// Remove, conditional on the current value when `expected` is set.
    Remove { key: Key, expected: Option<Value> },
    /// Replace an existing mapping, optionally only if it equals `expected`.
    Replace {
        key: Key,
        expected: Option<Value>,
        value: Value,
        metadata: Metadata,
    },
    /// Unconditional multi-key put.
    PutAll {
        entries: Vec<(Key, Value)>,
        metadata: Metadata,
    },
    /// Partial update of a map-valued entry.
    ApplyDelta { key: Key, delta: Delta },
    /// Remove every entry.
    Clear,
}

/// A write operation plus its routing state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteCommand {
    pub op: WriteOp,
    pub flags: Flags,
    /// Topology id the command was dispatched under.
    pub topology_id: i32,
    /// Outcome of the last local application. Starts `true`.
    #[serde(default = "default_successful")]
    successful: bool,
}

fn default_successful() -> bool {
    true
}

impl WriteCommand {
    /// Wraps `op` with no flags and an unstamped topology id.
    #[must_use]
    pub fn new(op: WriteOp) -> Self {
        Self {
            op,
            flags: Flags::EMPTY,
            topology_id: UNSTAMPED_TOPOLOGY_ID,
            successful: true,
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(flag)
    }

    /// Short operation name for log fields.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self.op {
            WriteOp::Put { if_absent: false, .. } => "put",
            WriteOp::Put { if_absent: true, .. } => "putIfAbsent",
            WriteOp::Remove { .. } => "remove",
            WriteOp::Replace { .. } => "replace",
            WriteOp::PutAll { .. } => "putAll",
            WriteOp::ApplyDelta { .. } => "applyDelta",
            WriteOp::Clear => "clear",
        }
    }

    /// The key of a single-key command.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match &self.op {
            WriteOp::Put { key, .. }
            | WriteOp::Remove { key, .. }
            | WriteOp::Replace { key, .. }
            | WriteOp::ApplyDelta { key, .. } => Some(key),
            WriteOp::PutAll { .. } | WriteOp::Clear => None,
        }
    }

    /// Every key the command touches. Empty for `Clear`.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        match &self.op {
            WriteOp::PutAll { entries, .. } => entries.iter().map(|(k, _)| k.as_str()).collect(),
            WriteOp::Clear => Vec::new(),
            _ => self.key().into_iter().collect(),
        }
    }

    /// Whether the command's effect depends on the current value.
    #[must_use]
    pub fn is_conditional(&self) -> bool {
        match &self.op {
            WriteOp::Put { if_absent, .. } => *if_absent,
            WriteOp::Remove { expected, .. } => expected.is_some(),
            WriteOp::Replace { .. } => true,
            WriteOp::PutAll { .. } | WriteOp::ApplyDelta { .. } | WriteOp::Clear => false,
        }
    }

    /// Whether the command must see the current value before applying:
    /// conditional commands always do, others unless return values are ignored.
    #[must_use]
    pub fn needs_previous_value(&self) -> bool {
        match self.op {
            WriteOp::PutAll { .. } | WriteOp::Clear => false,
            WriteOp::ApplyDelta { .. } => true,
            _ => self.is_conditional() || !self.has_flag(Flag::IgnoreReturnValues),
        }
    }

    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.successful
    }

    pub fn set_successful(&mut self, successful: bool) {
        self.successful = successful;
    }
}

/// Result of applying a write command on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    /// `false` when a conditional command's condition did not hold.
    pub successful: bool,
    /// Value mapped before the command, if any.
    pub previous: Option<Value>,
}

impl CommandOutcome {
    #[must_use]
    pub fn applied(previous: Option<Value>) -> Self {
        Self {
            successful: true,
            previous,
        }
    }

    #[must_use]
    pub fn rejected(previous: Option<Value>) -> Self {
        Self {
            successful: false,
            previous,
        }
    }
}
