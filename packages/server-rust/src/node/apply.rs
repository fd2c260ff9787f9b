//! Applying a write on this node: the data container plus write-through.

use std::sync::Arc;

use async_trait::async_trait;
use gridcache_core::{
    evaluate, now_millis, Address, CacheEntry, CommandOutcome, Flags, KeyEffect, WriteCommand,
    WriteOp,
};
use tracing::trace;

use crate::cluster::TopologyManager;
use crate::config::CacheMode;
use crate::context::InvocationContext;
use crate::distribution::WriteStage;
use crate::error::CacheResult;
use crate::storage::{DataContainer, PersistentStoreGateway};

/// Last stage of the write pipeline.
///
/// Only owners keep entries in memory; a non-owner evaluates the command
/// against the entry fetched from a remote owner and lets the gateway decide
/// whether it persists anything.
pub struct LocalApplier {
    address: Address,
    mode: CacheMode,
    container: Arc<DataContainer>,
    gateway: Arc<PersistentStoreGateway>,
    topology: Arc<TopologyManager>,
}

impl LocalApplier {
    #[must_use]
    pub fn new(
        address: Address,
        mode: CacheMode,
        container: Arc<DataContainer>,
        gateway: Arc<PersistentStoreGateway>,
        topology: Arc<TopologyManager>,
    ) -> Self {
        Self {
            address,
            mode,
            container,
            gateway,
            topology,
        }
    }

    /// Whether this node keeps `key` in memory.
    #[must_use]
    pub fn holds_key(&self, key: &str) -> bool {
        !self.mode.is_clustered() || self.topology.is_owner(&self.address, key)
    }

    fn is_primary(&self, key: &str) -> bool {
        !self.mode.is_clustered() || self.topology.primary_owner(key) == self.address
    }

    /// Reads `key` from memory, falling back to the store on a miss. Loaded
    /// entries are kept in memory.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Store`](crate::error::CacheError::Store) if the
    /// load fails.
    pub async fn read_owned(&self, key: &str, flags: Flags) -> CacheResult<Option<CacheEntry>> {
        let now = now_millis();
        if let Some(entry) = self.container.get(key, now) {
            return Ok(Some(entry));
        }
        match self.gateway.load(key, flags).await? {
            Some(entry) if !entry.is_expired(now) => {
                trace!(key, "loaded entry from store");
                self.container.put(entry.clone());
                Ok(Some(entry))
            }
            _ => Ok(None),
        }
    }

    async fn current_entry(
        &self,
        ctx: &InvocationContext,
        key: &str,
        holds: bool,
        flags: Flags,
    ) -> CacheResult<Option<CacheEntry>> {
        if holds {
            return self.read_owned(key, flags).await;
        }
        Ok(ctx.lookup(key).flatten().cloned())
    }

    async fn apply_put_all(&self, ctx: &InvocationContext, cmd: &mut WriteCommand) -> CacheResult<CommandOutcome> {
        let now = now_millis();
        let mut written = Vec::new();
        for key in cmd.keys() {
            let holds = self.holds_key(key);
            let eval = evaluate(&cmd.op, key, None, true, now);
            if let KeyEffect::Write(entry) = eval.effect {
                if holds {
                    self.container.put(entry.clone());
                }
                written.push((entry, holds));
            }
        }
        cmd.set_successful(true);
        self.gateway.after_put_all(ctx, cmd, &written).await?;
        Ok(CommandOutcome::applied(None))
    }
}

#[async_trait]
impl WriteStage for LocalApplier {
    async fn apply(&self, ctx: &InvocationContext, cmd: &mut WriteCommand) -> CacheResult<CommandOutcome> {
        match cmd.op {
            WriteOp::Clear => {
                self.container.clear();
                cmd.set_successful(true);
                self.gateway.clear(ctx, cmd).await?;
                return Ok(CommandOutcome::applied(None));
            }
            WriteOp::PutAll { .. } => return self.apply_put_all(ctx, cmd).await,
            _ => {}
        }
        let Some(key) = cmd.key().map(str::to_string) else {
            return Ok(CommandOutcome::applied(None));
        };

        let holds = self.holds_key(&key);
        let force = !ctx.origin_local && !self.is_primary(&key);
        let current = self.current_entry(ctx, &key, holds, cmd.flags).await?;
        let eval = evaluate(&cmd.op, &key, current.as_ref(), force, now_millis());
        cmd.set_successful(eval.outcome.successful);
        trace!(
            key = %key,
            command = cmd.name(),
            successful = eval.outcome.successful,
            holds,
            "applied locally"
        );

        match eval.effect {
            KeyEffect::Write(entry) => {
                if holds {
                    self.container.put(entry.clone());
                }
                self.gateway.after_put(ctx, cmd, &entry, holds).await?;
            }
            KeyEffect::Remove => {
                if holds {
                    self.container.remove(&key);
                }
                self.gateway.after_remove(ctx, cmd, &key, holds).await?;
            }
            KeyEffect::Unchanged => {
                if matches!(cmd.op, WriteOp::Remove { .. }) {
                    self.gateway.after_remove(ctx, cmd, &key, holds).await?;
                }
            }
        }
        Ok(eval.outcome)
    }
}

#[cfg(test)]
mod tests {
    use gridcache_core::{CacheTopology, ConsistentHash, ConsistentHashOwnership, Metadata, Value};

    use super::*;
    use crate::config::PersistenceConfig;
    use crate::storage::{CacheStore, InMemoryStore};

    fn applier(store: Arc<InMemoryStore>, shared: bool) -> (LocalApplier, Arc<DataContainer>, Arc<PersistentStoreGateway>) {
        let me = Address::new("n1");
        let hash = ConsistentHash::new(&[me.clone()], 1, 4).unwrap();
        let topology = Arc::new(TopologyManager::new(
            CacheTopology::new(1, hash),
            Arc::new(ConsistentHashOwnership),
        ));
        let config = PersistenceConfig {
            enabled: true,
            shared,
            ..PersistenceConfig::default()
        };
        let gateway = Arc::new(PersistentStoreGateway::new(Some(store), &config, true));
        let container = Arc::new(DataContainer::new());
        (
            LocalApplier::new(me, CacheMode::Local, container.clone(), gateway.clone(), topology),
            container,
            gateway,
        )
    }

    fn ctx() -> InvocationContext {
        InvocationContext::local(Address::new("n1"))
    }

    #[tokio::test]
    async fn put_writes_memory_and_store() {
        let store = Arc::new(InMemoryStore::new());
        let (applier, container, gateway) = applier(store.clone(), false);
        let mut cmd = WriteCommand::new(WriteOp::Put {
            key: "a".into(),
            value: Value::Int(1),
            metadata: Metadata::IMMORTAL,
            if_absent: false,
        });
        let outcome = applier.apply(&ctx(), &mut cmd).await.unwrap();
        assert!(outcome.successful);
        assert_eq!(container.len(), 1);
        assert!(store.get("a").is_some());
        assert_eq!(gateway.statistics().cache_stores(), 1);
    }

    #[tokio::test]
    async fn miss_loads_from_store() {
        let store = Arc::new(InMemoryStore::new());
        store
            .store(&CacheEntry::new("a", Value::Int(5), Metadata::IMMORTAL))
            .await
            .unwrap();
        let (applier, container, _) = applier(store, false);
        let mut cmd = WriteCommand::new(WriteOp::Replace {
            key: "a".into(),
            expected: Some(Value::Int(5)),
            value: Value::Int(6),
            metadata: Metadata::IMMORTAL,
        });
        let outcome = applier.apply(&ctx(), &mut cmd).await.unwrap();
        assert!(outcome.successful);
        assert_eq!(outcome.previous, Some(Value::Int(5)));
        assert_eq!(container.peek("a", now_millis()).unwrap().value, Value::Int(6));
    }

    #[tokio::test]
    async fn rejected_condition_touches_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let (applier, container, gateway) = applier(store.clone(), false);
        let mut cmd = WriteCommand::new(WriteOp::Remove {
            key: "a".into(),
            expected: Some(Value::Int(1)),
        });
        let outcome = applier.apply(&ctx(), &mut cmd).await.unwrap();
        assert!(!outcome.successful);
        assert!(!cmd.is_successful());
        assert!(container.is_empty());
        assert!(store.journal().is_empty());
        assert_eq!(gateway.statistics().cache_stores(), 0);
    }

    #[tokio::test]
    async fn put_all_and_clear() {
        let store = Arc::new(InMemoryStore::new());
        let (applier, container, gateway) = applier(store.clone(), false);
        let mut cmd = WriteCommand::new(WriteOp::PutAll {
            entries: vec![("x".into(), Value::Int(1)), ("y".into(), Value::Int(2))],
            metadata: Metadata::IMMORTAL,
        });
        applier.apply(&ctx(), &mut cmd).await.unwrap();
        assert_eq!(container.len(), 2);
        assert_eq!(store.len(), 2);
        assert_eq!(gateway.statistics().cache_stores(), 2);

        applier
            .apply(&ctx(), &mut WriteCommand::new(WriteOp::Clear))
            .await
            .unwrap();
        assert!(container.is_empty());
        assert!(store.is_empty());
    }
}
