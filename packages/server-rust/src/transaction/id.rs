//! Global transaction identity.

use std::fmt;

use gridcache_core::Address;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cluster-wide identifier of a transaction: the originating member plus a
/// random id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalTransactionId {
    origin: Address,
    id: Uuid,
}

impl GlobalTransactionId {
    #[must_use]
    pub fn new(origin: Address) -> Self {
        Self {
            origin,
            id: Uuid::new_v4(),
        }
    }

    #[must_use]
    pub fn origin(&self) -> &Address {
        &self.origin
    }
}

impl fmt::Display for GlobalTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalTx:{}:{}", self.origin, self.id)
    }
}
