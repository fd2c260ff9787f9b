//! Error taxonomy for the routing and persistence core.
//!
//! Two variants are *retryable*: both mean "the owner set this command was
//! routed against is no longer current". Callers refetch the topology and
//! resubmit; this crate never retries on their behalf.

use gridcache_core::Address;

use crate::config::ConfigError;

/// Errors raised by the read/write paths and the transactional store path.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The command was stamped with a topology id that is no longer current.
    #[error("cache topology changed while the command was executing: expected {expected}, got {current}")]
    TopologyMismatch { expected: i32, current: i32 },

    /// The primary owner no longer runs the cache (e.g. mid-rebalance).
    #[error("cache is no longer running on primary owner {primary}")]
    CacheNotFoundAtPrimary { primary: Address },

    /// The persistent store failed. The original error is preserved as the source.
    #[error("cache store failure: {0}")]
    Store(#[source] anyhow::Error),

    /// A caller broke the protocol contract (e.g. prepare without a transaction).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A remote member answered with an exception.
    #[error("unsuccessful response from {member}: {message}")]
    RemoteFailure { member: Address, message: String },

    /// The transport could not deliver a command.
    #[error("transport failure: {0}")]
    Transport(#[source] anyhow::Error),

    /// A command or response could not be encoded or decoded.
    #[error("codec failure: {0}")]
    Codec(String),

    /// The operation is not valid in the node's current lifecycle state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CacheError {
    /// Whether the caller should refetch the topology and resubmit.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::TopologyMismatch { .. } | CacheError::CacheNotFoundAtPrimary { .. }
        )
    }

    /// Wraps a store error unchanged.
    pub fn store(err: anyhow::Error) -> Self {
        CacheError::Store(err)
    }
}

/// Result alias used throughout the server crate.
pub type CacheResult<T> = Result<T, CacheError>;
