//! Transactions started on this node.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use gridcache_core::{
    now_millis, Address, CommandOutcome, Delta, Flags, Key, Metadata, Value, WriteCommand, WriteOp,
};
use tracing::{debug, trace, warn};

use super::NodeInner;
use crate::cluster::{RemoteCommand, Response, ResponseMode};
use crate::context::InvocationContext;
use crate::error::{CacheError, CacheResult};
use crate::transaction::{CacheTransaction, GlobalTransactionId, TxState};

/// An open transaction. Writes are buffered until [`commit`](Self::commit);
/// dropping the handle without committing discards them.
pub struct TransactionHandle {
    inner: Arc<NodeInner>,
    tx: CacheTransaction,
}

impl TransactionHandle {
    pub(crate) fn new(inner: Arc<NodeInner>) -> Self {
        let gtx = GlobalTransactionId::new(inner.address.clone());
        debug!(gtx = %gtx, "transaction started");
        Self {
            inner,
            tx: CacheTransaction::new(gtx),
        }
    }

    #[must_use]
    pub fn gtx(&self) -> &GlobalTransactionId {
        self.tx.gtx()
    }

    #[must_use]
    pub fn state(&self) -> TxState {
        self.tx.state()
    }

    fn ensure_active(&self) -> CacheResult<()> {
        self.inner.ensure_running()?;
        if self.tx.state() == TxState::Active {
            Ok(())
        } else {
            Err(CacheError::IllegalState(format!(
                "{} is {:?}",
                self.tx.gtx(),
                self.tx.state()
            )))
        }
    }

    /// Reads `key` as this transaction sees it.
    ///
    /// # Errors
    ///
    /// [`CacheError::IllegalState`] once the transaction completed;
    /// [`CacheError::Store`] if loading fails.
    pub async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        self.ensure_active()?;
        if let Some(state) = self.tx.lookup(key) {
            return Ok(state.map(|e| e.value.clone()));
        }
        Ok(self
            .inner
            .read_entry(key, Flags::EMPTY)
            .await?
            .map(|e| e.value))
    }

    /// Evaluates `cmd` against the transaction's view, fetching the
    /// committed value of every key seen for the first time.
    ///
    /// # Errors
    ///
    /// [`CacheError::IllegalState`] once the transaction completed;
    /// [`CacheError::Store`] if loading an original value fails.
    pub async fn execute(&mut self, cmd: WriteCommand) -> CacheResult<CommandOutcome> {
        self.ensure_active()?;
        let missing: Vec<Key> = cmd
            .keys()
            .into_iter()
            .filter(|key| self.tx.needs_original(key))
            .map(str::to_string)
            .collect();
        for key in missing {
            let entry = self.inner.read_entry(&key, cmd.flags).await?;
            self.tx.record_original(&key, entry);
        }
        let outcome = self.tx.apply(cmd, now_millis());
        Ok(outcome)
    }

    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn put(&mut self, key: impl Into<Key>, value: Value) -> CacheResult<Option<Value>> {
        let outcome = self
            .execute(WriteCommand::new(WriteOp::Put {
                key: key.into(),
                value,
                metadata: Metadata::IMMORTAL,
                if_absent: false,
            }))
            .await?;
        Ok(outcome.previous)
    }

    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn put_if_absent(&mut self, key: impl Into<Key>, value: Value) -> CacheResult<Option<Value>> {
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
    pub async fn remove(&mut self, key: impl Into<Key>) -> CacheResult<Option<Value>> {
        let outcome = self
            .execute(WriteCommand::new(WriteOp::Remove {
                key: key.into(),
                expected: None,
            }))
            .await?;
        Ok(outcome.previous)
    }

    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn replace(&mut self, key: impl Into<Key>, value: Value) -> CacheResult<Option<Value>> {
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

    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn put_all(&mut self, entries: Vec<(Key, Value)>) -> CacheResult<()> {
        self.execute(WriteCommand::new(WriteOp::PutAll {
            entries,
            metadata: Metadata::IMMORTAL,
        }))
        .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn apply_delta(&mut self, key: impl Into<Key>, delta: Delta) -> CacheResult<()> {
        self.execute(WriteCommand::new(WriteOp::ApplyDelta {
            key: key.into(),
            delta,
        }))
        .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn clear(&mut self) -> CacheResult<()> {
        self.execute(WriteCommand::new(WriteOp::Clear)).await?;
        Ok(())
    }

    /// Remote members that take part in the transaction.
    fn participants(&self) -> Vec<Address> {
        let inner = &self.inner;
        if !inner.config.clustering.mode.is_clustered() {
            return Vec::new();
        }
        let me = &inner.address;
        if self.tx.cleared() {
            return inner.rpc.members().into_iter().filter(|m| m != me).collect();
        }
        let mut members = BTreeSet::new();
        for key in self.tx.written_keys() {
            for owner in inner.topology.owners(key) {
                if &owner != me {
                    members.insert(owner);
                }
            }
        }
        members.into_iter().collect()
    }

    /// Prepares the transaction on every participant and on this node, then
    /// commits it. One-phase commit, where the prepare round is final, is
    /// only used when no other member takes part.
    ///
    /// # Errors
    ///
    /// Any prepare failure rolls the transaction back everywhere and is
    /// returned. Once prepared, the commit round always reaches every
    /// participant; a local store failure is returned afterwards.
    pub async fn commit(mut self) -> CacheResult<()> {
        self.ensure_active()?;
        if !self.tx.has_modifications() {
            self.tx.set_state(TxState::Committed);
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        self.tx.assign_versions();

        let participants = self.participants();
        let one_phase = inner.config.transaction.use_one_phase_commit && participants.is_empty();
        if one_phase != inner.config.transaction.use_one_phase_commit {
            trace!(gtx = %self.tx.gtx(), participants = participants.len(), "committing in two phases");
        }
        let prepare = RemoteCommand::TxPrepare {
            gtx: self.tx.gtx().clone(),
            commands: self.tx.commands().to_vec(),
            versions: self.tx.versions().clone(),
            one_phase,
        };
        if let Err(err) = self.invoke_all(&participants, &prepare, true).await {
            warn!(gtx = %self.tx.gtx(), error = %err, "remote prepare failed, rolling back");
            self.rollback_everywhere(&participants).await;
            return Err(err);
        }

        let ctx = InvocationContext::local(inner.address.clone()).transactional();
        let holds = |key: &str| inner.holds_key(key);
        if let Err(err) = inner
            .tx_coordinator
            .prepare(&ctx, &mut self.tx, one_phase, &holds, now_millis())
            .await
        {
            warn!(gtx = %self.tx.gtx(), error = %err, "local prepare failed, rolling back");
            self.rollback_everywhere(&participants).await;
            return Err(err);
        }

        inner.apply_committed(&self.tx);
        if one_phase {
            self.tx.set_state(TxState::Committed);
            debug!(gtx = %self.tx.gtx(), "transaction committed in one phase");
            return Ok(());
        }

        let local = inner.tx_coordinator.commit(&mut self.tx).await;
        let commit = RemoteCommand::TxCommit {
            gtx: self.tx.gtx().clone(),
        };
        let sync = inner.config.transaction.sync_commit_phase;
        let remote = self.invoke_all(&participants, &commit, sync).await;
        local?;
        remote?;
        debug!(gtx = %self.tx.gtx(), participants = participants.len(), "transaction committed");
        Ok(())
    }

    /// Discards the transaction's writes.
    ///
    /// # Errors
    ///
    /// [`CacheError::Store`] if the store rejects the rollback.
    pub async fn rollback(mut self) -> CacheResult<()> {
        if self.tx.state().is_completed() {
            return Ok(());
        }
        debug!(gtx = %self.tx.gtx(), "transaction rolled back");
        self.inner.tx_coordinator.rollback(&mut self.tx).await
    }

    async fn rollback_everywhere(&mut self, participants: &[Address]) {
        if let Err(err) = self.inner.tx_coordinator.rollback(&mut self.tx).await {
            warn!(gtx = %self.tx.gtx(), error = %err, "local rollback failed");
        }
        let rollback = RemoteCommand::TxRollback {
            gtx: self.tx.gtx().clone(),
        };
        let sync = self.inner.config.transaction.sync_rollback_phase;
        if let Err(err) = self.invoke_all(participants, &rollback, sync).await {
            warn!(gtx = %self.tx.gtx(), error = %err, "remote rollback failed");
        }
    }

    /// Sends `command` to `participants`. When `sync`, every live
    /// participant must answer; members that stopped running the cache are
    /// skipped.
    async fn invoke_all(&self, participants: &[Address], command: &RemoteCommand, sync: bool) -> CacheResult<()> {
        if participants.is_empty() {
            return Ok(());
        }
        let rpc = &self.inner.rpc;
        let mode = if sync {
            ResponseMode::WaitForAll
        } else {
            ResponseMode::Async
        };
        let responses = rpc
            .invoke_remotely(participants, command, rpc.options(mode))
            .await;
        if !sync {
            return Ok(());
        }
        check_participants(participants, &rpc.members(), responses)
    }
}

fn check_participants(
    participants: &[Address],
    live: &[Address],
    mut responses: HashMap<Address, Response>,
) -> CacheResult<()> {
    for member in participants.iter().filter(|m| live.contains(m)) {
        match responses.remove(member) {
            Some(Response::Successful(_)) => {}
            Some(Response::CacheNotFound) => trace!(%member, "participant no longer runs the cache"),
            Some(Response::Exception(ex)) => return Err(ex.into_error(member)),
            None => {
                return Err(CacheError::RemoteFailure {
                    member: member.clone(),
                    message: "no response".into(),
                })
            }
        }
    }
    Ok(())
}

impl std::fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("gtx", self.tx.gtx())
            .field("state", &self.tx.state())
            .finish_non_exhaustive()
    }
}
