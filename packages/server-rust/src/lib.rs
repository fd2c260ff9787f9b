//! `GridCache` Server: owner routing of writes, remote invocation with
//! response filtering, and transactional write-through to a persistent store.
//!
//! A [`CacheNode`] composes the stages. Nodes of one process form a cluster
//! through [`cluster::LocalCluster`]; other deployments plug their own
//! [`cluster::Transport`] in.

pub mod cluster;
pub mod config;
pub mod context;
pub mod distribution;
pub mod error;
pub mod node;
pub mod service;
pub mod storage;
pub mod transaction;

pub use config::{CacheConfig, CacheMode, ConfigError, TransactionMode};
pub use error::{CacheError, CacheResult};
pub use node::{CacheNode, CacheNodeBuilder, TransactionHandle};
pub use storage::{CacheStore, InMemoryStore, PersistentStoreGateway};
