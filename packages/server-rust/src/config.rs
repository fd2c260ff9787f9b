//! Cache configuration.
//!
//! Plain serde-backed structs with production defaults. Every section is
//! `#[serde(default)]`, so a JSON document only needs the fields it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How writes are distributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheMode {
    /// No clustering: every node is the sole owner of everything it holds.
    Local,
    /// Distributed; replication waits for backups.
    DistSync,
    /// Distributed; replication is fire-and-forget.
    DistAsync,
}

impl CacheMode {
    #[must_use]
    pub fn is_clustered(self) -> bool {
        !matches!(self, CacheMode::Local)
    }

    #[must_use]
    pub fn is_synchronous(self) -> bool {
        matches!(self, CacheMode::DistSync)
    }
}

/// Whether writes may run inside transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransactionMode {
    NonTransactional,
    Transactional,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusteringConfig {
    pub mode: CacheMode,
    pub num_owners: u32,
    pub num_segments: u32,
    /// Timeout for synchronous remote invocations.
    pub remote_timeout_ms: u64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::DistSync,
            num_owners: 2,
            num_segments: 256,
            remote_timeout_ms: 15_000,
        }
    }
}

impl ClusteringConfig {
    #[must_use]
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}

/// Write-behind (asynchronous store) settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WriteBehindConfig {
    pub enabled: bool,
    /// Number of distinct keys buffered before writers wait for a flush.
    pub modification_queue_size: usize,
    /// Interval between background flushes.
    pub flush_interval_ms: u64,
}

impl Default for WriteBehindConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            modification_queue_size: 1024,
            flush_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistenceConfig {
    /// Master switch for the persistent store.
    pub enabled: bool,
    /// The store is shared by all nodes; only originators write to it.
    pub shared: bool,
    /// Load owned entries from the store when the node starts.
    pub preload: bool,
    /// Clear the store when the node starts.
    pub purge_on_startup: bool,
    /// Never write to the store; loads still happen.
    pub ignore_modifications: bool,
    pub write_behind: WriteBehindConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransactionConfig {
    pub mode: TransactionMode,
    /// Fuse prepare and commit into a single round.
    pub use_one_phase_commit: bool,
    /// Wait for remote owners to acknowledge the commit round.
    pub sync_commit_phase: bool,
    /// Wait for remote owners to acknowledge the rollback round.
    pub sync_rollback_phase: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            mode: TransactionMode::NonTransactional,
            use_one_phase_commit: false,
            sync_commit_phase: true,
            sync_rollback_phase: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExpirationConfig {
    /// Interval between background purges of expired entries. 0 = disabled.
    pub purge_interval_ms: u64,
}

/// Top-level configuration of one cache on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub clustering: ClusteringConfig,
    pub persistence: PersistenceConfig,
    pub transaction: TransactionConfig,
    pub expiration: ExpirationConfig,
    pub statistics_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            clustering: ClusteringConfig::default(),
            persistence: PersistenceConfig::default(),
            transaction: TransactionConfig::default(),
            expiration: ExpirationConfig::default(),
            statistics_enabled: true,
        }
    }
}

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("clustering.numOwners must be positive")]
    ZeroOwners,
    #[error("clustering.numSegments must be positive")]
    ZeroSegments,
    #[error("clustering.remoteTimeoutMs must be positive")]
    ZeroRemoteTimeout,
    #[error("persistence.writeBehind.modificationQueueSize must be positive")]
    ZeroQueueSize,
    #[error("invalid configuration document: {0}")]
    Parse(String),
}

impl CacheConfig {
    /// Parses a JSON document and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON, or the first
    /// validation failure.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clustering.num_owners == 0 {
            return Err(ConfigError::ZeroOwners);
        }
        if self.clustering.num_segments == 0 {
            return Err(ConfigError::ZeroSegments);
        }
        if self.clustering.remote_timeout_ms == 0 {
            return Err(ConfigError::ZeroRemoteTimeout);
        }
        let wb = &self.persistence.write_behind;
        if wb.enabled && wb.modification_queue_size == 0 {
            return Err(ConfigError::ZeroQueueSize);
        }
        Ok(())
    }

    #[must_use]
    pub fn is_transactional(&self) -> bool {
        self.transaction.mode == TransactionMode::Transactional
    }

    /// Convenience: a local, non-clustered configuration.
    #[must_use]
    pub fn local() -> Self {
        let mut config = Self::default();
        config.clustering.mode = CacheMode::Local;
        config.clustering.num_owners = 1;
        config
    }
}
