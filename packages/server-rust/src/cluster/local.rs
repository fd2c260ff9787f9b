//! In-process cluster.
//!
//! Members live in the same process and exchange MsgPack-encoded commands
//! through a shared registry. Individual members can be slowed down,
//! silenced, or removed from the membership view, which is how multi-node
//! failure scenarios are reproduced without sockets.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use gridcache_core::Address;
use parking_lot::RwLock;
use tracing::trace;

use super::command::RemoteCommand;
use super::response::Response;
use super::transport::{CommandHandler, Transport};
use crate::error::CacheError;

#[derive(Clone)]
struct Slot {
    handler: Option<Weak<dyn CommandHandler>>,
    delay: Duration,
    silent: bool,
}

/// Shared registry of in-process members.
#[derive(Default)]
pub struct LocalCluster {
    members: RwLock<Vec<Address>>,
    slots: RwLock<HashMap<Address, Slot>>,
}

impl LocalCluster {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds `address` to the membership view and returns its transport.
    pub fn join(self: &Arc<Self>, address: Address) -> Arc<LocalTransport> {
        {
            let mut members = self.members.write();
            if !members.contains(&address) {
                members.push(address.clone());
            }
        }
        self.slots.write().entry(address.clone()).or_insert(Slot {
            handler: None,
            delay: Duration::ZERO,
            silent: false,
        });
        Arc::new(LocalTransport {
            address,
            cluster: Arc::clone(self),
        })
    }

    /// Routes commands addressed to `address` to `handler`.
    pub fn register(&self, address: &Address, handler: Weak<dyn CommandHandler>) {
        if let Some(slot) = self.slots.write().get_mut(address) {
            slot.handler = Some(handler);
        }
    }

    /// Removes `address` from the membership view. Its slot stays, so
    /// commands already addressed to it still fail cleanly.
    pub fn leave(&self, address: &Address) {
        self.members.write().retain(|m| m != address);
    }

    #[must_use]
    pub fn members(&self) -> Vec<Address> {
        self.members.read().clone()
    }

    /// Delays every response from `address`.
    pub fn set_delay(&self, address: &Address, delay: Duration) {
        if let Some(slot) = self.slots.write().get_mut(address) {
            slot.delay = delay;
        }
    }

    /// A silent member stays in the view but never answers.
    pub fn set_silent(&self, address: &Address, silent: bool) {
        if let Some(slot) = self.slots.write().get_mut(address) {
            slot.silent = silent;
        }
    }

    fn slot(&self, address: &Address) -> Option<Slot> {
        self.slots.read().get(address).cloned()
    }
}

/// One member's view of a [`LocalCluster`].
pub struct LocalTransport {
    address: Address,
    cluster: Arc<LocalCluster>,
}

impl LocalTransport {
    #[must_use]
    pub fn cluster(&self) -> &Arc<LocalCluster> {
        &self.cluster
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, CacheError> {
    rmp_serde::to_vec_named(value).map_err(|e| CacheError::Codec(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, CacheError> {
    rmp_serde::from_slice(bytes).map_err(|e| CacheError::Codec(e.to_string()))
}

#[async_trait]
impl Transport for LocalTransport {
    fn address(&self) -> &Address {
        &self.address
    }

    fn members(&self) -> Vec<Address> {
        self.cluster.members()
    }

    async fn send(&self, target: &Address, command: RemoteCommand) -> anyhow::Result<Response> {
        let slot = self
            .cluster
            .slot(target)
            .ok_or_else(|| anyhow::anyhow!("unknown member {target}"))?;
        if slot.silent {
            trace!(%target, "member is silent");
            return std::future::pending().await;
        }
        let handler = slot
            .handler
            .and_then(|h| h.upgrade())
            .ok_or_else(|| anyhow::anyhow!("member {target} has no cache running"))?;

        let wire = encode(&command)?;
        if !slot.delay.is_zero() {
            tokio::time::sleep(slot.delay).await;
        }
        let command: RemoteCommand = decode(&wire)?;
        let response = handler.handle(self.address.clone(), command).await;
        let wire = encode(&response)?;
        Ok(decode(&wire)?)
    }
}
