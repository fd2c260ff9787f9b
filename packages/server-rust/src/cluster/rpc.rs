//! Remote invocation.
//!
//! [`RpcManager::invoke_remotely`] fans a command out to a set of members and
//! collects their responses under a [`ResponseMode`]. Targets that time out or
//! cannot be reached are simply missing from the result map: callers must
//! treat a partial map as normal.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use gridcache_core::Address;
use tracing::{debug, trace, warn};

use super::command::RemoteCommand;
use super::filter::{FirstSuccessfulFilter, ResponseFilter};
use super::response::Response;
use super::transport::Transport;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Wait until every target answered or the timeout elapsed.
    WaitForAll,
    /// Wait until the filter is satisfied, every target answered, or the
    /// timeout elapsed.
    WaitForValid,
    /// Fire and forget; the result map is always empty.
    Async,
}

pub struct RpcOptions {
    pub mode: ResponseMode,
    pub timeout: Duration,
    pub filter: Option<Box<dyn ResponseFilter>>,
}

impl RpcOptions {
    #[must_use]
    pub fn new(mode: ResponseMode, timeout: Duration) -> Self {
        Self {
            mode,
            timeout,
            filter: None,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Box<dyn ResponseFilter>) -> Self {
        self.filter = Some(filter);
        self
    }
}

impl std::fmt::Debug for RpcOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcOptions")
            .field("mode", &self.mode)
            .field("timeout", &self.timeout)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// RpcManager
// ---------------------------------------------------------------------------

pub struct RpcManager {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl RpcManager {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    #[must_use]
    pub fn address(&self) -> &Address {
        self.transport.address()
    }

    #[must_use]
    pub fn members(&self) -> Vec<Address> {
        self.transport.members()
    }

    /// `WaitForAll` when `sync`, `Async` otherwise, with the configured
    /// remote timeout.
    #[must_use]
    pub fn default_options(&self, sync: bool) -> RpcOptions {
        let mode = if sync {
            ResponseMode::WaitForAll
        } else {
            ResponseMode::Async
        };
        RpcOptions::new(mode, self.timeout)
    }

    #[must_use]
    pub fn options(&self, mode: ResponseMode) -> RpcOptions {
        RpcOptions::new(mode, self.timeout)
    }

    /// Sends `command` to `targets` and collects responses.
    ///
    /// Targets are first intersected with the live membership and this
    /// member is removed, so nobody who left is waited on.
    pub async fn invoke_remotely(
        &self,
        targets: &[Address],
        command: &RemoteCommand,
        options: RpcOptions,
    ) -> HashMap<Address, Response> {
        let live: HashSet<Address> = self.transport.members().into_iter().collect();
        let me = self.transport.address();
        let mut seen = HashSet::new();
        let targets: Vec<Address> = targets
            .iter()
            .filter(|t| *t != me && live.contains(*t) && seen.insert((*t).clone()))
            .cloned()
            .collect();

        if targets.is_empty() {
            trace!(command = command.name(), "no remote targets");
            return HashMap::new();
        }

        match options.mode {
            ResponseMode::Async => {
                for target in targets {
                    let transport = Arc::clone(&self.transport);
                    let command = command.clone();
                    tokio::spawn(async move {
                        if let Err(e) = transport.send(&target, command).await {
                            warn!(%target, error = %e, "asynchronous send failed");
                        }
                    });
                }
                HashMap::new()
            }
            ResponseMode::WaitForAll | ResponseMode::WaitForValid => {
                let filter = match (options.mode, options.filter) {
                    (_, Some(filter)) => Some(filter),
                    (ResponseMode::WaitForValid, None) => {
                        Some(Box::new(FirstSuccessfulFilter::default()) as Box<dyn ResponseFilter>)
                    }
                    _ => None,
                };
                self.collect(targets, command, options.timeout, filter).await
            }
        }
    }

    async fn collect(
        &self,
        targets: Vec<Address>,
        command: &RemoteCommand,
        timeout: Duration,
        mut filter: Option<Box<dyn ResponseFilter>>,
    ) -> HashMap<Address, Response> {
        let mut pending: FuturesUnordered<_> = targets
            .into_iter()
            .map(|target| {
                let transport = Arc::clone(&self.transport);
                let command = command.clone();
                async move {
                    let result = transport.send(&target, command).await;
                    (target, result)
                }
            })
            .collect();

        let deadline = tokio::time::Instant::now() + timeout;
        let mut responses = HashMap::new();
        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Err(_) => {
                    debug!(
                        command = command.name(),
                        missing = pending.len(),
                        "remote invocation timed out"
                    );
                    break;
                }
                Ok(None) => break,
                Ok(Some((target, Err(e)))) => {
                    debug!(%target, error = %e, "no response");
                }
                Ok(Some((target, Ok(response)))) => match filter.as_mut() {
                    Some(f) => {
                        if f.is_acceptable(&response, &target) {
                            responses.insert(target, response);
                        }
                        if !f.needs_more_responses() {
                            break;
                        }
                    }
                    None => {
                        responses.insert(target, response);
                    }
                },
            }
        }
        responses
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::cluster::response::ResponseValue;

    /// Answers every command after a per-target delay; targets without a
    /// delay entry never answer.
    struct ScriptedTransport {
        address: Address,
        members: Vec<Address>,
        delays: HashMap<Address, Duration>,
        sent: Mutex<Vec<Address>>,
    }

    impl ScriptedTransport {
        fn new(members: &[&str], delays: &[(&str, u64)]) -> Self {
            Self {
                address: Address::new("self"),
                members: members.iter().map(|m| Address::new(*m)).collect(),
                delays: delays
                    .iter()
                    .map(|(m, d)| (Address::new(*m), Duration::from_millis(*d)))
                    .collect(),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn address(&self) -> &Address {
            &self.address
        }

        fn members(&self) -> Vec<Address> {
            self.members.clone()
        }

        async fn send(&self, target: &Address, _command: RemoteCommand) -> anyhow::Result<Response> {
            self.sent.lock().push(target.clone());
            match self.delays.get(target) {
                Some(delay) => {
                    tokio::time::sleep(*delay).await;
                    Ok(Response::Successful(ResponseValue::Null))
                }
                None => std::future::pending().await,
            }
        }
    }

    fn clear() -> RemoteCommand {
        RemoteCommand::Write(gridcache_core::WriteCommand::new(gridcache_core::WriteOp::Clear))
    }

    fn addrs(names: &[&str]) -> Vec<Address> {
        names.iter().map(|n| Address::new(*n)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_all_tolerates_silent_targets() {
        let transport = Arc::new(ScriptedTransport::new(
            &["self", "a", "b", "c"],
            &[("a", 10), ("b", 20)],
        ));
        let rpc = RpcManager::new(transport, Duration::from_millis(100));
        let responses = rpc
            .invoke_remotely(&addrs(&["a", "b", "c"]), &clear(), rpc.options(ResponseMode::WaitForAll))
            .await;
        assert_eq!(responses.len(), 2);
        assert!(responses.contains_key(&Address::new("a")));
        assert!(!responses.contains_key(&Address::new("c")));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_valid_returns_first_success() {
        let transport = Arc::new(ScriptedTransport::new(
            &["self", "fast", "slow"],
            &[("fast", 5), ("slow", 50)],
        ));
        let rpc = RpcManager::new(transport, Duration::from_millis(1000));
        let start = tokio::time::Instant::now();
        let responses = rpc
            .invoke_remotely(&addrs(&["slow", "fast"]), &clear(), rpc.options(ResponseMode::WaitForValid))
            .await;
        assert_eq!(responses.len(), 1);
        assert!(responses.contains_key(&Address::new("fast")));
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn targets_are_intersected_with_members_and_exclude_self() {
        let transport = Arc::new(ScriptedTransport::new(&["self", "a"], &[("a", 0), ("gone", 0)]));
        let rpc = RpcManager::new(Arc::clone(&transport) as Arc<dyn Transport>, Duration::from_millis(100));
        let responses = rpc
            .invoke_remotely(&addrs(&["self", "a", "a", "gone"]), &clear(), rpc.default_options(true))
            .await;
        assert_eq!(responses.len(), 1);
        assert_eq!(*transport.sent.lock(), vec![Address::new("a")]);
    }

    #[tokio::test]
    async fn async_mode_returns_empty_map() {
        let transport = Arc::new(ScriptedTransport::new(&["self", "a"], &[("a", 0)]));
        let rpc = RpcManager::new(transport, Duration::from_millis(100));
        let responses = rpc
            .invoke_remotely(&addrs(&["a"]), &clear(), rpc.default_options(false))
            .await;
        assert!(responses.is_empty());
    }
}
