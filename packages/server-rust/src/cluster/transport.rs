//! Transport boundary.
//!
//! Message delivery and membership are external collaborators. The cache
//! consumes them through [`Transport`] and serves incoming commands through
//! [`CommandHandler`].

use async_trait::async_trait;
use gridcache_core::Address;

use super::command::RemoteCommand;
use super::response::Response;

/// Point-to-point delivery plus a membership view.
///
/// Used as `Arc<dyn Transport>`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// This member's address.
    fn address(&self) -> &Address;

    /// Current live members, including this one.
    fn members(&self) -> Vec<Address>;

    /// Sends `command` to `target` and waits for its response.
    ///
    /// An error means the command could not be delivered or answered; the
    /// invoker treats it like a missing response.
    async fn send(&self, target: &Address, command: RemoteCommand) -> anyhow::Result<Response>;
}

/// Receiver side of the transport.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, origin: Address, command: RemoteCommand) -> Response;
}
