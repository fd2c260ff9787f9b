//! Serving commands sent by other members.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use gridcache_core::{now_millis, Address, CacheEntry, Flags, Key, WriteCommand};
use tracing::{debug, trace};

use super::NodeInner;
use crate::cluster::{CommandHandler, RemoteCommand, Response, ResponseValue};
use crate::context::InvocationContext;
use crate::error::CacheResult;
use crate::transaction::{CacheTransaction, GlobalTransactionId};

impl NodeInner {
    async fn serve_write(&self, origin: Address, mut cmd: WriteCommand) -> CacheResult<ResponseValue> {
        let mut ctx = InvocationContext::remote(origin);
        let outcome = self
            .distribution
            .handle_write(&mut ctx, &mut cmd, &self.applier)
            .await?;
        Ok(ResponseValue::Outcome(outcome))
    }

    async fn serve_get(&self, key: &str, flags: Flags) -> CacheResult<ResponseValue> {
        let entry = self.applier.read_owned(key, flags).await?;
        Ok(entry.map_or(ResponseValue::Null, ResponseValue::Entry))
    }

    async fn serve_prepare(
        &self,
        origin: Address,
        gtx: GlobalTransactionId,
        commands: Vec<WriteCommand>,
        versions: BTreeMap<Key, u64>,
        one_phase: bool,
    ) -> CacheResult<ResponseValue> {
        let mut base: HashMap<Key, Option<CacheEntry>> = HashMap::new();
        for cmd in &commands {
            for key in cmd.keys() {
                if !base.contains_key(key) && self.holds_key(key) {
                    let entry = self.applier.read_owned(key, Flags::EMPTY).await?;
                    base.insert(key.to_string(), entry);
                }
            }
        }

        let now = now_millis();
        let mut tx = CacheTransaction::replay(
            gtx,
            commands,
            versions,
            |key| base.get(key).cloned().flatten(),
            now,
        );
        let ctx = InvocationContext::remote(origin).transactional();
        let holds = |key: &str| self.holds_key(key);
        self.tx_coordinator
            .prepare(&ctx, &mut tx, one_phase, &holds, now)
            .await?;

        if one_phase {
            self.apply_committed(&tx);
        } else {
            self.remote_txs.insert(tx.gtx().clone(), tx);
        }
        Ok(ResponseValue::Null)
    }

    async fn serve_commit(&self, gtx: &GlobalTransactionId) -> CacheResult<ResponseValue> {
        let Some((_, mut tx)) = self.remote_txs.remove(gtx) else {
            trace!(gtx = %gtx, "commit for unknown transaction");
            return Ok(ResponseValue::Null);
        };
        self.apply_committed(&tx);
        self.tx_coordinator.commit(&mut tx).await?;
        Ok(ResponseValue::Null)
    }

    async fn serve_rollback(&self, gtx: &GlobalTransactionId) -> CacheResult<ResponseValue> {
        let Some((_, mut tx)) = self.remote_txs.remove(gtx) else {
            trace!(gtx = %gtx, "rollback for unknown transaction");
            return Ok(ResponseValue::Null);
        };
        self.tx_coordinator.rollback(&mut tx).await?;
        Ok(ResponseValue::Null)
    }
}

#[async_trait]
impl CommandHandler for NodeInner {
    async fn handle(&self, origin: Address, command: RemoteCommand) -> Response {
        if !self.running.load(Ordering::Acquire) {
            trace!(command = command.name(), %origin, "cache not running");
            return Response::CacheNotFound;
        }
        let name = command.name();
        let result = match command {
            RemoteCommand::Write(cmd) => self.serve_write(origin.clone(), cmd).await,
            RemoteCommand::ClusteredGet { key, flags, .. } => self.serve_get(&key, flags).await,
            RemoteCommand::TxPrepare {
                gtx,
                commands,
                versions,
                one_phase,
            } => {
                self.serve_prepare(origin.clone(), gtx, commands, versions, one_phase)
                    .await
            }
            RemoteCommand::TxCommit { gtx } => self.serve_commit(&gtx).await,
            RemoteCommand::TxRollback { gtx } => self.serve_rollback(&gtx).await,
        };
        match result {
            Ok(value) => Response::Successful(value),
            Err(err) => {
                debug!(command = name, %origin, error = %err, "remote command failed");
                Response::exception(&err)
            }
        }
    }
}
