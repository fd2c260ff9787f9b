//! Commands exchanged between members.

use std::collections::BTreeMap;

use gridcache_core::{Flags, Key, WriteCommand};
use serde::{Deserialize, Serialize};

use crate::transaction::GlobalTransactionId;

/// A command sent to another member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemoteCommand {
    /// Apply a non-transactional write (forwarded to a primary, or replicated
    /// by one).
    Write(WriteCommand),
    /// Fetch the entry for `key` from an owner.
    ClusteredGet {
        key: Key,
        flags: Flags,
        /// Fetch performed on behalf of a write.
        write: bool,
    },
    /// Prepare a transaction on a participant.
    TxPrepare {
        gtx: GlobalTransactionId,
        commands: Vec<WriteCommand>,
        /// Entry versions assigned by the originator.
        versions: BTreeMap<Key, u64>,
        one_phase: bool,
    },
    TxCommit {
        gtx: GlobalTransactionId,
    },
    TxRollback {
        gtx: GlobalTransactionId,
    },
}

impl RemoteCommand {
    /// Short name for log fields.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            RemoteCommand::Write(cmd) => cmd.name(),
            RemoteCommand::ClusteredGet { .. } => "clusteredGet",
            RemoteCommand::TxPrepare { .. } => "prepare",
            RemoteCommand::TxCommit { .. } => "commit",
            RemoteCommand::TxRollback { .. } => "rollback",
        }
    }
}
