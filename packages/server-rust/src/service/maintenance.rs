//! Periodic purge of expired entries from memory and the store.

use std::sync::Arc;

use async_trait::async_trait;
use gridcache_core::now_millis;
use tracing::{debug, warn};

use super::worker::BackgroundRunnable;
use crate::storage::{DataContainer, PersistentStoreGateway};

#[derive(Debug)]
pub enum MaintenanceTask {
    PurgeExpired,
}

pub struct ExpiryPurger {
    container: Arc<DataContainer>,
    gateway: Arc<PersistentStoreGateway>,
}

impl ExpiryPurger {
    #[must_use]
    pub fn new(container: Arc<DataContainer>, gateway: Arc<PersistentStoreGateway>) -> Self {
        Self { container, gateway }
    }

    async fn purge(&self) {
        let removed = self.container.purge_expired(now_millis());
        if removed > 0 {
            debug!(removed, "purged expired entries from memory");
        }
        if let Err(err) = self.gateway.purge_expired().await {
            warn!(error = %err, "store purge of expired entries failed");
        }
    }
}

#[async_trait]
impl BackgroundRunnable for ExpiryPurger {
    type Task = MaintenanceTask;

    fn name(&self) -> &'static str {
        "expiry"
    }

    async fn run(&mut self, task: MaintenanceTask) {
        match task {
            MaintenanceTask::PurgeExpired => self.purge().await,
        }
    }

    async fn on_tick(&mut self) {
        self.purge().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gridcache_core::{CacheEntry, Metadata, Value};

    use super::*;
    use crate::config::PersistenceConfig;
    use crate::service::worker::BackgroundWorker;
    use crate::storage::{CacheStore, InMemoryStore};

    #[tokio::test]
    async fn purges_memory_and_store_on_request() {
        let store = Arc::new(InMemoryStore::new());
        let config = PersistenceConfig {
            enabled: true,
            ..PersistenceConfig::default()
        };
        let gateway = Arc::new(PersistentStoreGateway::new(Some(store.clone()), &config, false));
        let container = Arc::new(DataContainer::new());

        let stale = CacheEntry::new_at("old", Value::Int(1), Metadata::IMMORTAL.with_lifespan(1), 0);
        let live = CacheEntry::new("live", Value::Int(2), Metadata::IMMORTAL);
        container.put(stale.clone());
        container.put(live.clone());
        store.store(&stale).await.unwrap();
        store.store(&live).await.unwrap();

        let mut worker = BackgroundWorker::start(ExpiryPurger::new(container.clone(), gateway), 60_000);
        worker.submit(MaintenanceTask::PurgeExpired).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.stop().await;

        assert_eq!(container.len(), 1);
        assert!(store.get("old").is_none());
        assert!(store.get("live").is_some());
    }
}
