//! A cache node: the public read/write API and the composition of every
//! stage behind it.
//!
//! ```text
//! put/remove/... ──► DistributionCoordinator ──► LocalApplier ──► DataContainer
//!                          │ forward / replicate          └──► PersistentStoreGateway
//!                          ▼
//!                     RpcManager ──► Transport ──► remote CacheNode (CommandHandler)
//!
//! begin() ──► TransactionHandle ──► TransactionCoordinator ──► PersistentStoreGateway
//! ```

mod apply;
mod handler;
mod tx;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use gridcache_core::{
    now_millis, Address, CacheEntry, CacheTopology, CommandOutcome, ConsistentHash,
    ConsistentHashOwnership, Delta, Flags, Key, Metadata, OwnershipResolver, Value, WriteCommand,
    WriteOp, UNSTAMPED_TOPOLOGY_ID,
};
use tracing::{debug, info};

pub use apply::LocalApplier;
pub use tx::TransactionHandle;

use crate::cluster::{CommandHandler, LocalCluster, RpcManager, TopologyManager, Transport};
use crate::config::CacheConfig;
use crate::context::InvocationContext;
use crate::distribution::DistributionCoordinator;
use crate::error::{CacheError, CacheResult};
use crate::service::{BackgroundWorker, ExpiryPurger, MaintenanceTask};
use crate::storage::{
    CacheStore, DataContainer, PersistentStoreGateway, WriteBehindFlusher, WriteBehindStore,
};
use crate::transaction::{
    CacheTransaction, GlobalTransactionId, TransactionCoordinator, TransactionManager,
};

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct CacheNodeBuilder {
    config: CacheConfig,
    address: Option<Address>,
    transport: Option<Arc<dyn Transport>>,
    cluster: Option<Arc<LocalCluster>>,
    store: Option<Arc<dyn CacheStore>>,
    tx_manager: Option<Arc<dyn TransactionManager>>,
    topology: Option<CacheTopology>,
    resolver: Arc<dyn OwnershipResolver>,
}

impl CacheNodeBuilder {
    /// Address of a standalone node. Ignored when a transport is given.
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(Address::new(address.into()));
        self
    }

    /// Uses `transport`. The caller routes incoming commands to
    /// [`CacheNode::handler`].
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Joins an in-process cluster and registers the node's handler with it.
    #[must_use]
    pub fn join(mut self, cluster: &Arc<LocalCluster>, address: impl Into<String>) -> Self {
        let address = Address::new(address.into());
        self.transport = Some(cluster.join(address.clone()));
        self.cluster = Some(Arc::clone(cluster));
        self.address = Some(address);
        self
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn transaction_manager(mut self, manager: Arc<dyn TransactionManager>) -> Self {
        self.tx_manager = Some(manager);
        self
    }

    /// Initial topology. Derived from the transport's membership otherwise.
    #[must_use]
    pub fn topology(mut self, topology: CacheTopology) -> Self {
        self.topology = Some(topology);
        self
    }

    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn OwnershipResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Validates the configuration and wires the node. The node does not
    /// serve requests until [`CacheNode::start`].
    ///
    /// # Errors
    ///
    /// [`CacheError::Config`] for an invalid configuration;
    /// [`CacheError::IllegalState`] if no topology can be derived.
    pub fn build(self) -> CacheResult<CacheNode> {
        self.config.validate()?;
        let config = self.config;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => {
                let address = self.address.unwrap_or_else(|| Address::new("local"));
                LocalCluster::new().join(address)
            }
        };
        let address = transport.address().clone();

        let topology = match self.topology {
            Some(topology) => topology,
            None => {
                let members = transport.members();
                let hash = ConsistentHash::new(
                    &members,
                    config.clustering.num_owners,
                    config.clustering.num_segments,
                )
                .map_err(|e| CacheError::IllegalState(format!("cannot derive topology: {e}")))?;
                CacheTopology::new(1, hash)
            }
        };
        let topology = Arc::new(TopologyManager::new(topology, self.resolver));

        let write_behind = match &self.store {
            Some(store) if config.persistence.write_behind.enabled => Some(Arc::new(WriteBehindStore::new(
                Arc::clone(store),
                config.persistence.write_behind.modification_queue_size,
            ))),
            _ => None,
        };
        let store = match &write_behind {
            Some(wb) => Some(Arc::clone(wb) as Arc<dyn CacheStore>),
            None => self.store,
        };
        let gateway = Arc::new(PersistentStoreGateway::new(
            store,
            &config.persistence,
            config.statistics_enabled,
        ));

        let container = Arc::new(DataContainer::new());
        let rpc = Arc::new(RpcManager::new(
            Arc::clone(&transport),
            config.clustering.remote_timeout(),
        ));
        let distribution = DistributionCoordinator::new(
            config.clustering.mode,
            Arc::clone(&rpc),
            Arc::clone(&topology),
        );
        let applier = LocalApplier::new(
            address.clone(),
            config.clustering.mode,
            Arc::clone(&container),
            Arc::clone(&gateway),
            Arc::clone(&topology),
        );
        let tx_coordinator = TransactionCoordinator::new(Arc::clone(&gateway), self.tx_manager);

        let inner = Arc::new(NodeInner {
            address,
            config,
            container,
            gateway,
            topology,
            rpc,
            distribution,
            applier,
            tx_coordinator,
            remote_txs: DashMap::new(),
            running: AtomicBool::new(false),
            write_behind,
            workers: tokio::sync::Mutex::new(Workers::default()),
        });

        if let Some(cluster) = self.cluster {
            let weak: Weak<NodeInner> = Arc::downgrade(&inner);
            cluster.register(&inner.address, weak);
        }
        debug!(node = %inner.address, mode = ?inner.config.clustering.mode, "cache node built");
        Ok(CacheNode { inner })
    }
}

// ---------------------------------------------------------------------------
// CacheNode
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Workers {
    write_behind: Option<BackgroundWorker<WriteBehindFlusher>>,
    expiry: Option<BackgroundWorker<ExpiryPurger>>,
}

pub(crate) struct NodeInner {
    address: Address,
    config: CacheConfig,
    container: Arc<DataContainer>,
    gateway: Arc<PersistentStoreGateway>,
    topology: Arc<TopologyManager>,
    rpc: Arc<RpcManager>,
    distribution: DistributionCoordinator,
    applier: LocalApplier,
    tx_coordinator: TransactionCoordinator,
    /// Transactions prepared here on behalf of another member.
    remote_txs: DashMap<GlobalTransactionId, CacheTransaction>,
    running: AtomicBool,
    write_behind: Option<Arc<WriteBehindStore>>,
    workers: tokio::sync::Mutex<Workers>,
}

impl NodeInner {
    fn ensure_running(&self) -> CacheResult<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CacheError::IllegalState(format!(
                "cache is not running on {}",
                self.address
            )))
        }
    }

    fn holds_key(&self, key: &str) -> bool {
        self.applier.holds_key(key)
    }

    /// Current entry for `key`: from memory or the store on an owner, from
    /// the owners otherwise.
    async fn read_entry(&self, key: &str, flags: Flags) -> CacheResult<Option<CacheEntry>> {
        if self.holds_key(key) {
            return self.applier.read_owned(key, flags).await;
        }
        Ok(self
            .distribution
            .retrieve_from_remote_source(key, flags, false)
            .await
            .flatten())
    }

    /// Writes the final state of a committed transaction into memory.
    fn apply_committed(&self, tx: &CacheTransaction) {
        if tx.cleared() {
            self.container.clear();
        }
        for (key, state) in tx.final_states() {
            if !self.holds_key(&key) {
                continue;
            }
            match state {
                Some(entry) => {
                    self.container.put(entry);
                }
                None => {
                    self.container.remove(&key);
                }
            }
        }
    }
}

/// Handle to a cache node. Cheap to clone.
#[derive(Clone)]
pub struct CacheNode {
    inner: Arc<NodeInner>,
}

impl CacheNode {
    #[must_use]
    pub fn builder(config: CacheConfig) -> CacheNodeBuilder {
        CacheNodeBuilder {
            config,
            address: None,
            transport: None,
            cluster: None,
            store: None,
            tx_manager: None,
            topology: None,
            resolver: Arc::new(ConsistentHashOwnership),
        }
    }

    #[must_use]
    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Receiver for commands addressed to this node.
    #[must_use]
    pub fn handler(&self) -> Arc<dyn CommandHandler> {
        Arc::clone(&self.inner) as Arc<dyn CommandHandler>
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Prepares the store, preloads owned entries, starts background work,
    /// and begins serving requests.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Store`] if purging or preloading fails.
    pub async fn start(&self) -> CacheResult<()> {
        let inner = &self.inner;
        let persistence = &inner.config.persistence;
        if persistence.purge_on_startup {
            debug!(node = %inner.address, "purging store on startup");
            inner.gateway.purge_all().await?;
        }
        if persistence.preload {
            let holds = |key: &str| inner.holds_key(key);
            let keys = inner.gateway.load_all_keys(&holds).await?;
            let mut loaded = 0usize;
            for key in keys {
                if let Some(entry) = inner.gateway.load(&key, Flags::EMPTY).await? {
                    inner.container.put(entry);
                    loaded += 1;
                }
            }
            info!(node = %inner.address, loaded, "preloaded entries from store");
        }

        let mut workers = inner.workers.lock().await;
        if let Some(wb) = &inner.write_behind {
            workers.write_behind = Some(BackgroundWorker::start(
                WriteBehindFlusher::new(Arc::clone(wb)),
                persistence.write_behind.flush_interval_ms,
            ));
        }
        let purge_interval = inner.config.expiration.purge_interval_ms;
        if purge_interval > 0 {
            workers.expiry = Some(BackgroundWorker::start(
                ExpiryPurger::new(Arc::clone(&inner.container), Arc::clone(&inner.gateway)),
                purge_interval,
            ));
        }
        drop(workers);

        inner.running.store(true, Ordering::Release);
        info!(node = %inner.address, topology_id = inner.topology.topology_id(), "cache node started");
        Ok(())
    }

    /// Stops serving requests and stops background work. Pending
    /// write-behind modifications are flushed. Remote commands are answered
    /// with `CacheNotFound` from now on.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        let mut workers = self.inner.workers.lock().await;
        if let Some(mut worker) = workers.expiry.take() {
            worker.stop().await;
        }
        if let Some(mut worker) = workers.write_behind.take() {
            worker.stop().await;
        }
        info!(node = %self.inner.address, "cache node stopped");
    }

    /// Installs a newer topology. Returns `false` for a stale one.
    pub fn install_topology(&self, topology: CacheTopology) -> bool {
        self.inner.topology.install(topology)
    }

    #[must_use]
    pub fn topology(&self) -> Arc<CacheTopology> {
        self.inner.topology.current()
    }

    #[must_use]
    pub fn topology_id(&self) -> i32 {
        self.inner.topology.topology_id()
    }

    #[must_use]
    pub fn is_owner(&self, key: &str) -> bool {
        self.inner.holds_key(key)
    }

    // -- reads --------------------------------------------------------------

    /// # Errors
    ///
    /// [`CacheError::IllegalState`] if the node is stopped;
    /// [`CacheError::Store`] if loading fails.
    pub async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        Ok(self.get_entry(key).await?.map(|e| e.value))
    }

    /// # Errors
    ///
    /// [`CacheError::IllegalState`] if the node is stopped;
    /// [`CacheError::Store`] if loading fails.
    pub async fn get_entry(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        self.inner.ensure_running()?;
        self.inner.read_entry(key, Flags::EMPTY).await
    }

    /// The entry held in this node's memory, without loading or remote
    /// lookups.
    #[must_use]
    pub fn local_entry(&self, key: &str) -> Option<CacheEntry> {
        self.inner.container.peek(key, now_millis())
    }

    #[must_use]
    pub fn local_size(&self) -> usize {
        self.inner.container.len()
    }

    // -- writes -------------------------------------------------------------

    /// Runs `cmd` through the write path. An unstamped command is stamped
    /// with the current topology id.
    ///
    /// # Errors
    ///
    /// See [`DistributionCoordinator::handle_write`].
    pub async fn execute(&self, mut cmd: WriteCommand) -> CacheResult<CommandOutcome> {
        self.inner.ensure_running()?;
        if cmd.topology_id == UNSTAMPED_TOPOLOGY_ID {
            cmd.topology_id = self.inner.topology.topology_id();
        }
        let mut ctx = InvocationContext::local(self.inner.address.clone());
        self.inner
            .distribution
            .handle_write(&mut ctx, &mut cmd, &self.inner.applier)
            .await
    }

    /// Maps `key` to `value`. Returns the previous value.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn put(&self, key: impl Into<Key>, value: Value) -> CacheResult<Option<Value>> {
        self.put_with(key, value, Metadata::IMMORTAL).await
    }

    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn put_with(&self, key: impl Into<Key>, value: Value, metadata: Metadata) -> CacheResult<Option<Value>> {
        let outcome = self
            .execute(WriteCommand::new(WriteOp::Put {
                key: key.into(),
                value,
                metadata,
                if_absent: false,
            }))
            .await?;
        Ok(outcome.previous)
    }

    /// Maps `key` only if it is absent. Returns the existing value when the
    /// mapping was refused.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn put_if_absent(&self, key: impl Into<Key>, value: Value) -> CacheResult<Option<Value>> {
        let outcome = self
            .execute(WriteCommand::new(WriteOp::Put {
                key: key.into(),
                value,
                metadata: Metadata::IMMORTAL,
                if_absent: true,
            }))
            .await?;
        Ok(outcome.previous)
    }

    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn remove(&self, key: impl Into<Key>) -> CacheResult<Option<Value>> {
        let outcome = self
            .execute(WriteCommand::new(WriteOp::Remove {
                key: key.into(),
                expected: None,
            }))
            .await?;
        Ok(outcome.previous)
    }

    /// Removes `key` only while it maps to `expected`.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn remove_if(&self, key: impl Into<Key>, expected: Value) -> CacheResult<bool> {
        let outcome = self
            .execute(WriteCommand::new(WriteOp::Remove {
                key: key.into(),
                expected: Some(expected),
            }))
            .await?;
        Ok(outcome.successful)
    }

    /// Replaces an existing mapping. Returns the previous value, `None` if
    /// there was nothing to replace.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn replace(&self, key: impl Into<Key>, value: Value) -> CacheResult<Option<Value>> {
        let outcome = self
            .execute(WriteCommand::new(WriteOp::Replace {
                key: key.into(),
                expected: None,
                value,
                metadata: Metadata::IMMORTAL,
            }))
            .await?;
        Ok(outcome.previous)
    }

    /// Replaces the mapping only while it equals `expected`.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn replace_if(&self, key: impl Into<Key>, expected: Value, value: Value) -> CacheResult<bool> {
        let outcome = self
            .execute(WriteCommand::new(WriteOp::Replace {
                key: key.into(),
                expected: Some(expected),
                value,
                metadata: Metadata::IMMORTAL,
            }))
            .await?;
        Ok(outcome.successful)
    }

    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn put_all(&self, entries: Vec<(Key, Value)>) -> CacheResult<()> {
        self.execute(WriteCommand::new(WriteOp::PutAll {
            entries,
            metadata: Metadata::IMMORTAL,
        }))
        .await?;
        Ok(())
    }

    /// Merges `delta` into the map stored under `key`.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn apply_delta(&self, key: impl Into<Key>, delta: Delta) -> CacheResult<()> {
        self.execute(WriteCommand::new(WriteOp::ApplyDelta {
            key: key.into(),
            delta,
        }))
        .await?;
        Ok(())
    }

    /// Removes every entry on every member and clears the store.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn clear(&self) -> CacheResult<()> {
        self.execute(WriteCommand::new(WriteOp::Clear)).await?;
        Ok(())
    }

    // -- transactions -------------------------------------------------------

    /// Starts a transaction.
    ///
    /// # Errors
    ///
    /// [`CacheError::IllegalState`] if the cache is not transactional or not
    /// running.
    pub fn begin(&self) -> CacheResult<TransactionHandle> {
        self.inner.ensure_running()?;
        if !self.inner.config.is_transactional() {
            return Err(CacheError::IllegalState(
                "cache is not configured for transactions".into(),
            ));
        }
        Ok(TransactionHandle::new(Arc::clone(&self.inner)))
    }

    // -- statistics and introspection ---------------------------------------

    /// Number of entries written to the store.
    #[must_use]
    pub fn cache_loader_stores(&self) -> u64 {
        self.inner.gateway.statistics().cache_stores()
    }

    pub fn reset_statistics(&self) {
        self.inner.gateway.statistics().reset();
    }

    /// Transactions prepared in two phases on this node and not yet
    /// completed, with their affected keys.
    #[must_use]
    pub fn preparing_transactions(&self) -> HashMap<GlobalTransactionId, HashSet<Key>> {
        self.inner.tx_coordinator.preparing_transactions()
    }

    #[must_use]
    pub fn transaction_store_counts(&self) -> HashMap<GlobalTransactionId, u64> {
        self.inner.tx_coordinator.transaction_store_counts()
    }

    /// Turns every store interaction into a no-op.
    pub fn disable_store(&self) {
        self.inner.gateway.disable();
    }

    /// Flushes pending write-behind modifications now.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Store`] if the delegate store fails.
    pub async fn flush_write_behind(&self) -> CacheResult<()> {
        match &self.inner.write_behind {
            Some(wb) => wb.flush().await.map_err(CacheError::store),
            None => Ok(()),
        }
    }

    /// Runs an expiry purge now instead of waiting for the next interval.
    ///
    /// # Errors
    ///
    /// Returns an error if the expiry worker is not running.
    pub async fn purge_expired(&self) -> CacheResult<()> {
        let workers = self.inner.workers.lock().await;
        match &workers.expiry {
            Some(worker) => worker
                .submit(MaintenanceTask::PurgeExpired)
                .await
                .map_err(|e| CacheError::IllegalState(e.to_string())),
            None => {
                self.inner.container.purge_expired(now_millis());
                self.inner.gateway.purge_expired().await
            }
        }
    }
}

impl std::fmt::Debug for CacheNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheNode")
            .field("address", &self.inner.address)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
