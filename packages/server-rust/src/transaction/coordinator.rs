//! Transactional path to the persistent store.
//!
//! `prepare` turns the transaction's commands into one modification list and
//! hands it to the store. A one-phase prepare is final; a two-phase prepare
//! registers the transaction until `commit` or `rollback` removes it. Store
//! statistics are counted at one-phase prepare or at two-phase commit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use gridcache_core::{CacheEntry, Key, WriteCommand};
use tracing::{debug, warn};

use super::cache_tx::{CacheTransaction, TxState};
use super::id::GlobalTransactionId;
use super::log::{LogSource, ModificationLog};
use super::manager::{AmbientSuspension, TransactionManager};
use super::registry::TransactionRegistry;
use crate::context::InvocationContext;
use crate::error::{CacheError, CacheResult};
use crate::storage::PersistentStoreGateway;

/// Answers, per key, whether this node holds the key in memory.
pub type HoldsKey<'a> = &'a (dyn Fn(&str) -> bool + Send + Sync);

struct TxLogSource<'a> {
    tx: &'a CacheTransaction,
    ctx: &'a InvocationContext,
    gateway: &'a PersistentStoreGateway,
    holds_key: HoldsKey<'a>,
}

impl LogSource for TxLogSource<'_> {
    fn base_entry(&self, key: &str) -> Option<CacheEntry> {
        self.tx.original(key)
    }

    fn is_proper_writer(&self, key: &str) -> bool {
        self.gateway.is_proper_writer(self.ctx, (self.holds_key)(key))
    }

    fn is_proper_writer_for_clear(&self) -> bool {
        self.gateway.is_proper_writer_for_clear(self.ctx)
    }

    fn is_store_enabled_for(&self, cmd: &WriteCommand) -> bool {
        self.gateway.is_store_enabled_for(cmd.flags)
    }

    fn updated_version(&self, key: &str) -> Option<u64> {
        self.tx.updated_version(key)
    }
}

pub struct TransactionCoordinator {
    gateway: Arc<PersistentStoreGateway>,
    registry: TransactionRegistry,
    tx_manager: Option<Arc<dyn TransactionManager>>,
}

impl TransactionCoordinator {
    #[must_use]
    pub fn new(gateway: Arc<PersistentStoreGateway>, tx_manager: Option<Arc<dyn TransactionManager>>) -> Self {
        Self {
            gateway,
            registry: TransactionRegistry::new(),
            tx_manager,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &TransactionRegistry {
        &self.registry
    }

    /// Prepares `tx` against the store.
    ///
    /// # Errors
    ///
    /// [`CacheError::ProtocolViolation`] if `ctx` is not transactional or the
    /// transaction was already prepared; [`CacheError::Store`] if the store
    /// rejects the prepare, in which case nothing is registered.
    pub async fn prepare(
        &self,
        ctx: &InvocationContext,
        tx: &mut CacheTransaction,
        one_phase: bool,
        holds_key: HoldsKey<'_>,
        now: i64,
    ) -> CacheResult<()> {
        if !ctx.in_tx {
            return Err(CacheError::ProtocolViolation(
                "prepare outside a transaction context".into(),
            ));
        }
        if tx.state() != TxState::Active || self.registry.is_preparing(tx.gtx()) {
            return Err(CacheError::ProtocolViolation(format!(
                "{} is already prepared or completed",
                tx.gtx()
            )));
        }
        tx.set_state(TxState::Preparing);

        if !self.gateway.is_store_enabled() {
            tx.set_state(TxState::Prepared);
            return Ok(());
        }

        let log = {
            let source = TxLogSource {
                tx: &*tx,
                ctx,
                gateway: &self.gateway,
                holds_key,
            };
            ModificationLog::build(
                tx.commands(),
                &source,
                self.gateway.statistics().is_enabled(),
                now,
            )
        };

        if !log.is_empty() {
            debug!(gtx = %tx.gtx(), modifications = log.len(), one_phase, "preparing store");
            if let Err(err) = self.gateway.prepare(log.modifications(), tx.gtx(), one_phase).await {
                tx.set_state(TxState::Active);
                return Err(err);
            }
        }

        let put_count = log.put_count();
        if one_phase {
            self.gateway.statistics().add(put_count);
        } else {
            let counted = self.gateway.statistics().is_enabled().then_some(put_count);
            self.registry.register(tx.gtx(), log.into_affected_keys(), counted);
        }
        tx.set_state(TxState::Prepared);
        Ok(())
    }

    /// Commits a two-phase transaction in the store.
    ///
    /// The ambient transaction, if any, is suspended around the store call.
    /// Registry entries are removed whether or not the store succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Store`] if the store commit fails.
    pub async fn commit(&self, tx: &mut CacheTransaction) -> CacheResult<()> {
        let gtx = tx.gtx().clone();
        let mut result = Ok(());
        if tx.has_modifications() && self.gateway.is_store_enabled() {
            let _suspension = AmbientSuspension::new(self.tx_manager.as_deref());
            result = self.gateway.commit(&gtx).await;
        }
        self.registry.remove_preparing(&gtx);
        let count = self.registry.take_store_count(&gtx);
        if let Err(err) = result {
            warn!(gtx = %gtx, error = %err, "store commit failed");
            return Err(err);
        }
        if let Some(count) = count {
            self.gateway.statistics().add(count);
        }
        tx.set_state(TxState::Committed);
        Ok(())
    }

    /// Rolls back `tx` in the store if it was registered by a two-phase
    /// prepare. Unknown transactions are a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Store`] if the store rollback fails.
    pub async fn rollback(&self, tx: &mut CacheTransaction) -> CacheResult<()> {
        let gtx = tx.gtx().clone();
        let registered = self.registry.remove_preparing(&gtx).is_some();
        self.registry.take_store_count(&gtx);
        tx.set_state(TxState::RolledBack);
        if registered {
            debug!(gtx = %gtx, "rolling back store");
            self.gateway.rollback(&gtx).await?;
        }
        Ok(())
    }

    /// Transactions prepared in two phases and not yet completed, with the
    /// keys they modify.
    #[must_use]
    pub fn preparing_transactions(&self) -> HashMap<GlobalTransactionId, HashSet<Key>> {
        self.registry.preparing_snapshot()
    }

    /// Pending put counts of prepared transactions.
    #[must_use]
    pub fn transaction_store_counts(&self) -> HashMap<GlobalTransactionId, u64> {
        self.registry.store_counts_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use gridcache_core::{Address, Metadata, Modification, Value, WriteOp};
    use parking_lot::Mutex;

    use super::*;
    use crate::config::PersistenceConfig;
    use crate::storage::{CacheStore, InMemoryStore, KeyFilter};
    use crate::transaction::manager::SuspendedTransaction;

    fn gateway(store: Arc<dyn CacheStore>, shared: bool) -> Arc<PersistentStoreGateway> {
        let config = PersistenceConfig {
            enabled: true,
            shared,
            ..PersistenceConfig::default()
        };
        Arc::new(PersistentStoreGateway::new(Some(store), &config, true))
    }

    fn put(key: &str, v: i64) -> WriteCommand {
        WriteCommand::new(WriteOp::Put {
            key: key.into(),
            value: Value::Int(v),
            metadata: Metadata::IMMORTAL,
            if_absent: false,
        })
    }

    fn tx_with(commands: &[WriteCommand]) -> CacheTransaction {
        let mut tx = CacheTransaction::new(GlobalTransactionId::new(Address::new("n1")));
        for cmd in commands {
            for key in cmd.keys() {
                tx.record_original(key, None);
            }
            tx.apply(cmd.clone(), 0);
        }
        tx
    }

    fn ctx() -> InvocationContext {
        InvocationContext::local(Address::new("n1")).transactional()
    }

    fn all(_: &str) -> bool {
        true
    }

    #[tokio::test]
    async fn two_phase_counts_at_commit() {
        let store = Arc::new(InMemoryStore::new());
        let gw = gateway(store.clone(), false);
        let coordinator = TransactionCoordinator::new(gw.clone(), None);
        let mut tx = tx_with(&[put("k1", 1), put("k2", 2)]);

        coordinator.prepare(&ctx(), &mut tx, false, &all, 0).await.unwrap();
        assert_eq!(gw.statistics().cache_stores(), 0);
        assert!(coordinator.preparing_transactions().contains_key(tx.gtx()));
        assert_eq!(coordinator.transaction_store_counts().get(tx.gtx()), Some(&2));
        assert!(store.get("k1").is_none());

        coordinator.commit(&mut tx).await.unwrap();
        assert_eq!(gw.statistics().cache_stores(), 2);
        assert!(coordinator.registry().is_empty());
        assert!(store.get("k1").is_some());
        assert_eq!(tx.state(), TxState::Committed);
    }

    #[tokio::test]
    async fn one_phase_counts_at_prepare() {
        let store = Arc::new(InMemoryStore::new());
        let gw = gateway(store.clone(), false);
        let coordinator = TransactionCoordinator::new(gw.clone(), None);
        let mut tx = tx_with(&[put("k1", 1)]);

        coordinator.prepare(&ctx(), &mut tx, true, &all, 0).await.unwrap();
        assert_eq!(gw.statistics().cache_stores(), 1);
        assert!(coordinator.registry().is_empty());
        assert!(store.get("k1").is_some());
    }

    #[tokio::test]
    async fn rollback_discards_staged_writes() {
        let store = Arc::new(InMemoryStore::new());
        let gw = gateway(store.clone(), false);
        let coordinator = TransactionCoordinator::new(gw.clone(), None);
        let mut tx = tx_with(&[put("k1", 1)]);

        coordinator.prepare(&ctx(), &mut tx, false, &all, 0).await.unwrap();
        coordinator.rollback(&mut tx).await.unwrap();
        assert!(coordinator.registry().is_empty());
        assert!(store.get("k1").is_none());
        assert_eq!(store.staged_transactions(), 0);
        assert_eq!(gw.statistics().cache_stores(), 0);
    }

    #[tokio::test]
    async fn unknown_transactions_are_no_ops() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = TransactionCoordinator::new(gateway(store.clone(), false), None);
        let mut tx = tx_with(&[]);
        coordinator.commit(&mut tx).await.unwrap();
        let mut tx = tx_with(&[put("k", 1)]);
        coordinator.rollback(&mut tx).await.unwrap();
        assert!(store.journal().is_empty());
    }

    #[tokio::test]
    async fn prepare_requires_transaction_context() {
        let coordinator =
            TransactionCoordinator::new(gateway(Arc::new(InMemoryStore::new()), false), None);
        let mut tx = tx_with(&[put("k", 1)]);
        let err = coordinator
            .prepare(&InvocationContext::local(Address::new("n1")), &mut tx, false, &all, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn double_prepare_is_rejected() {
        let coordinator =
            TransactionCoordinator::new(gateway(Arc::new(InMemoryStore::new()), false), None);
        let mut tx = tx_with(&[put("k", 1)]);
        coordinator.prepare(&ctx(), &mut tx, false, &all, 0).await.unwrap();
        let err = coordinator.prepare(&ctx(), &mut tx, false, &all, 0).await.unwrap_err();
        assert!(matches!(err, CacheError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn replica_of_shared_store_writes_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = TransactionCoordinator::new(gateway(store.clone(), true), None);
        let mut tx = tx_with(&[put("k", 1)]);
        let remote = InvocationContext::remote(Address::new("n2")).transactional();
        coordinator.prepare(&remote, &mut tx, false, &all, 0).await.unwrap();
        coordinator.commit(&mut tx).await.unwrap();
        assert!(store.get("k").is_none());
    }

    struct FailingCommit {
        inner: InMemoryStore,
    }

    #[async_trait]
    impl CacheStore for FailingCommit {
        async fn store(&self, entry: &CacheEntry) -> anyhow::Result<()> {
            self.inner.store(entry).await
        }
        async fn remove(&self, key: &str) -> anyhow::Result<bool> {
            self.inner.remove(key).await
        }
        async fn clear(&self) -> anyhow::Result<()> {
            self.inner.clear().await
        }
        async fn prepare(
            &self,
            modifications: &[Modification],
            gtx: &GlobalTransactionId,
            one_phase: bool,
        ) -> anyhow::Result<()> {
            self.inner.prepare(modifications, gtx, one_phase).await
        }
        async fn commit(&self, _gtx: &GlobalTransactionId) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
        async fn rollback(&self, gtx: &GlobalTransactionId) -> anyhow::Result<()> {
            self.inner.rollback(gtx).await
        }
        async fn load_all_keys(
            &self,
            filter: KeyFilter<'_>,
        ) -> anyhow::Result<HashSet<String>> {
            self.inner.load_all_keys(filter).await
        }
        async fn purge_expired(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn contains_key(&self, key: &str) -> anyhow::Result<bool> {
            self.inner.contains_key(key).await
        }
        async fn load(&self, key: &str) -> anyhow::Result<Option<CacheEntry>> {
            self.inner.load(key).await
        }
    }

    #[derive(Default)]
    struct Ambient {
        current: Mutex<Option<u8>>,
        suspended_during_commit: Mutex<bool>,
    }

    impl TransactionManager for Ambient {
        fn suspend(&self) -> Option<SuspendedTransaction> {
            let taken = self.current.lock().take();
            *self.suspended_during_commit.lock() = taken.is_some();
            taken.map(SuspendedTransaction::new)
        }

        fn resume(&self, tx: SuspendedTransaction) {
            if let Ok(v) = tx.downcast::<u8>() {
                *self.current.lock() = Some(v);
            }
        }
    }

    #[tokio::test]
    async fn failed_commit_still_cleans_up_and_resumes() {
        let store: Arc<dyn CacheStore> = Arc::new(FailingCommit {
            inner: InMemoryStore::new(),
        });
        let gw = gateway(store, false);
        let ambient = Arc::new(Ambient::default());
        *ambient.current.lock() = Some(9);
        let coordinator = TransactionCoordinator::new(gw.clone(), Some(ambient.clone()));
        let mut tx = tx_with(&[put("k", 1)]);

        coordinator.prepare(&ctx(), &mut tx, false, &all, 0).await.unwrap();
        let err = coordinator.commit(&mut tx).await.unwrap_err();
        assert!(matches!(err, CacheError::Store(_)));
        assert!(coordinator.registry().is_empty());
        assert_eq!(gw.statistics().cache_stores(), 0);
        assert!(*ambient.suspended_during_commit.lock());
        assert_eq!(*ambient.current.lock(), Some(9));
    }
}
