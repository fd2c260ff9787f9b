//! Non-transactional write path and remote read path.
//!
//! The primary owner of a key decides the outcome of every write to it.
//! A write that starts elsewhere is applied locally and forwarded to the
//! primary, whose answer is authoritative; the primary replicates to the
//! remaining owners. Commands stamped with an outdated topology id are
//! fenced before anything is applied.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gridcache_core::{
    Address, CacheEntry, CommandOutcome, Flag, Flags, WriteCommand, UNSTAMPED_TOPOLOGY_ID,
};
use tracing::{debug, trace, warn};

use super::recipients::Recipients;
use crate::cluster::{
    OwnerValidityFilter, RemoteCommand, Response, ResponseMode, ResponseValue, RpcManager,
    TopologyManager,
};
use crate::config::CacheMode;
use crate::context::InvocationContext;
use crate::error::{CacheError, CacheResult};

/// The next stage of the write pipeline: applies a command on this node.
#[async_trait]
pub trait WriteStage: Send + Sync {
    async fn apply(&self, ctx: &InvocationContext, cmd: &mut WriteCommand) -> CacheResult<CommandOutcome>;
}

pub struct DistributionCoordinator {
    mode: CacheMode,
    rpc: Arc<RpcManager>,
    topology: Arc<TopologyManager>,
}

impl DistributionCoordinator {
    #[must_use]
    pub fn new(mode: CacheMode, rpc: Arc<RpcManager>, topology: Arc<TopologyManager>) -> Self {
        Self { mode, rpc, topology }
    }

    #[must_use]
    pub fn address(&self) -> &Address {
        self.rpc.address()
    }

    /// Whether replication of `cmd` waits for the recipients.
    #[must_use]
    pub fn is_synchronous(&self, cmd: &WriteCommand) -> bool {
        if cmd.has_flag(Flag::ForceSynchronous) {
            true
        } else if cmd.has_flag(Flag::ForceAsynchronous) {
            false
        } else {
            self.mode.is_synchronous()
        }
    }

    fn is_local_mode_forced(&self, cmd: &WriteCommand) -> bool {
        !self.mode.is_clustered() || cmd.has_flag(Flag::CacheModeLocal)
    }

    /// Runs a non-transactional write through the distribution protocol,
    /// calling `next` wherever the command is applied on this node.
    ///
    /// # Errors
    ///
    /// [`CacheError::TopologyMismatch`] when a synchronous command carries an
    /// outdated topology id, [`CacheError::CacheNotFoundAtPrimary`] when the
    /// primary no longer runs the cache, [`CacheError::ProtocolViolation`]
    /// for a transactional context, plus whatever `next` or a remote owner
    /// raises.
    pub async fn handle_write(
        &self,
        ctx: &mut InvocationContext,
        cmd: &mut WriteCommand,
        next: &dyn WriteStage,
    ) -> CacheResult<CommandOutcome> {
        if ctx.in_tx {
            return Err(CacheError::ProtocolViolation(format!(
                "non-transactional {} issued inside a transaction",
                cmd.name()
            )));
        }
        if self.is_local_mode_forced(cmd) {
            return next.apply(ctx, cmd).await;
        }

        let topology = self.topology.current();
        let sync = self.is_synchronous(cmd);
        let current_id = topology.topology_id();
        if sync && cmd.topology_id != UNSTAMPED_TOPOLOGY_ID && cmd.topology_id != current_id {
            debug!(
                command = cmd.name(),
                expected = cmd.topology_id,
                current = current_id,
                "fencing command stamped with an outdated topology"
            );
            return Err(CacheError::TopologyMismatch {
                expected: cmd.topology_id,
                current: current_id,
            });
        }

        if ctx.origin_local {
            self.remote_get_before_write(ctx, cmd).await?;
        }

        let recipients = Recipients::for_command(cmd, topology, Arc::clone(self.topology.resolver()));
        if recipients.single_key().is_some() {
            self.handle_single_key(ctx, cmd, next, &recipients, sync).await
        } else {
            self.handle_multi_key(ctx, cmd, next, &recipients, sync).await
        }
    }

    /// Runs a single-key write. The primary owner decides the outcome and
    /// replicates; a non-owner only forwards.
    ///
    /// When a synchronous forward gets no answer from the primary, the
    /// outcome carries no previous value and counts as successful for
    /// unconditional commands. The write may never have reached the primary
    /// in that case.
    async fn handle_single_key(
        &self,
        ctx: &InvocationContext,
        cmd: &mut WriteCommand,
        next: &dyn WriteStage,
        recipients: &Recipients,
        sync: bool,
    ) -> CacheResult<CommandOutcome> {
        let me = self.rpc.address().clone();
        let Some(primary) = recipients.primary() else {
            return next.apply(ctx, cmd).await;
        };
        let is_primary = primary == me;

        if !ctx.origin_local {
            let outcome = next.apply(ctx, cmd).await?;
            if is_primary && !(cmd.is_conditional() && !outcome.successful) {
                self.replicate(cmd, recipients.others(&me), sync).await?;
            }
            return Ok(outcome);
        }

        if is_primary {
            trace!(command = cmd.name(), "applying as primary owner");
            let outcome = next.apply(ctx, cmd).await?;
            if cmd.is_conditional() && !outcome.successful {
                trace!(command = cmd.name(), "condition failed on primary, not replicating");
                return Ok(outcome);
            }
            if recipients.is_single_owner() {
                return Ok(outcome);
            }
            self.replicate(cmd, recipients.others(&me), sync).await?;
            return Ok(outcome);
        }

        let local = next.apply(ctx, cmd).await?;
        let sync_forwarding = sync || !cmd.has_flag(Flag::IgnoreReturnValues);
        trace!(command = cmd.name(), %primary, sync_forwarding, "forwarding to primary owner");
        let options = self.rpc.default_options(sync_forwarding);
        let mut responses = self
            .rpc
            .invoke_remotely(&[primary.clone()], &RemoteCommand::Write(cmd.clone()), options)
            .await;
        if !sync_forwarding {
            return Ok(local);
        }

        let outcome = match responses.remove(&primary) {
            None => {
                warn!(command = cmd.name(), %primary, "no response from primary owner");
                CommandOutcome {
                    successful: !cmd.is_conditional(),
                    previous: None,
                }
            }
            Some(Response::Successful(ResponseValue::Outcome(outcome))) => outcome,
            Some(Response::Successful(_)) => CommandOutcome::applied(None),
            Some(Response::CacheNotFound) => {
                return Err(CacheError::CacheNotFoundAtPrimary { primary });
            }
            Some(Response::Exception(ex)) => return Err(ex.into_error(&primary)),
        };
        cmd.set_successful(outcome.successful);
        Ok(outcome)
    }

    /// `PutAll` goes to the owners of every key, `Clear` to every member.
    /// Only the originator sends it on.
    async fn handle_multi_key(
        &self,
        ctx: &InvocationContext,
        cmd: &mut WriteCommand,
        next: &dyn WriteStage,
        recipients: &Recipients,
        sync: bool,
    ) -> CacheResult<CommandOutcome> {
        let outcome = next.apply(ctx, cmd).await?;
        if !ctx.origin_local {
            return Ok(outcome);
        }
        let me = self.rpc.address().clone();
        let targets = if recipients.is_broadcast() {
            self.rpc.members().into_iter().filter(|m| *m != me).collect()
        } else {
            recipients.others(&me)
        };
        self.replicate(cmd, targets, sync).await?;
        Ok(outcome)
    }

    async fn replicate(&self, cmd: &WriteCommand, targets: Vec<Address>, sync: bool) -> CacheResult<()> {
        if targets.is_empty() {
            return Ok(());
        }
        trace!(command = cmd.name(), recipients = targets.len(), sync, "replicating");
        let responses = self
            .rpc
            .invoke_remotely(&targets, &RemoteCommand::Write(cmd.clone()), self.rpc.default_options(sync))
            .await;
        check_responses(responses)
    }

    /// Fetches the current value of every key `cmd` needs and this node does
    /// not own, and records it in `ctx`.
    async fn remote_get_before_write(&self, ctx: &mut InvocationContext, cmd: &WriteCommand) -> CacheResult<()> {
        if !cmd.needs_previous_value() || cmd.has_flag(Flag::SkipRemoteLookup) {
            return Ok(());
        }
        let me = self.rpc.address().clone();
        for key in cmd.keys() {
            if ctx.lookup(key).is_some() || self.topology.is_owner(&me, key) {
                continue;
            }
            trace!(key, "fetching previous value from remote owner");
            let fetched = self.retrieve_from_remote_source(key, cmd.flags, true).await;
            ctx.record_lookup(key, fetched.flatten());
        }
        Ok(())
    }

    /// Reads `key` from its owners, stopping at the first successful answer
    /// from a member that is still an owner.
    ///
    /// `None` when no owner answered successfully; `Some(None)` when an
    /// owner answered that it has no entry.
    pub async fn retrieve_from_remote_source(
        &self,
        key: &str,
        flags: Flags,
        write: bool,
    ) -> Option<Option<CacheEntry>> {
        let me = self.rpc.address().clone();
        let targets = self.topology.owners(key);
        let filter = OwnerValidityFilter::new(key, &targets, &me, Arc::clone(&self.topology));
        let options = self
            .rpc
            .options(ResponseMode::WaitForValid)
            .with_filter(Box::new(filter));
        let command = RemoteCommand::ClusteredGet {
            key: key.to_string(),
            flags,
            write,
        };
        let responses = self.rpc.invoke_remotely(&targets, &command, options).await;

        for (member, response) in responses {
            match response {
                Response::Successful(ResponseValue::Entry(entry)) => {
                    trace!(key, %member, "remote owner returned entry");
                    return Some(Some(entry));
                }
                Response::Successful(_) => {
                    trace!(key, %member, "remote owner has no entry");
                    return Some(None);
                }
                Response::Exception(ex) => {
                    debug!(key, %member, error = %ex.message, "remote get failed");
                }
                Response::CacheNotFound => {}
            }
        }
        trace!(key, "no owner answered the remote get");
        None
    }
}

/// Surfaces the first exception among replication responses. Members that
/// did not answer or no longer run the cache are tolerated.
fn check_responses(responses: HashMap<Address, Response>) -> CacheResult<()> {
    for (member, response) in responses {
        match response {
            Response::Exception(ex) => return Err(ex.into_error(&member)),
            Response::CacheNotFound => trace!(%member, "recipient no longer runs the cache"),
            Response::Successful(_) => {}
        }
    }
    Ok(())
}
