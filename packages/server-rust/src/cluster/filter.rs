//! Response filters for [`ResponseMode::WaitForValid`](super::rpc::ResponseMode).
//!
//! A filter sees responses in arrival order. Rejected responses are dropped
//! from the result map; the invocation ends as soon as the filter stops
//! asking for more.

use std::collections::HashSet;
use std::sync::Arc;

use gridcache_core::{Address, Key};
use tracing::trace;

use super::response::Response;
use super::topology::TopologyManager;

pub trait ResponseFilter: Send {
    /// Whether `response` from `sender` should be kept.
    fn is_acceptable(&mut self, response: &Response, sender: &Address) -> bool;

    /// Whether the invocation should keep waiting.
    fn needs_more_responses(&self) -> bool;
}

/// Accepts everything and stops at the first successful response.
#[derive(Debug, Default)]
pub struct FirstSuccessfulFilter {
    done: bool,
}

impl ResponseFilter for FirstSuccessfulFilter {
    fn is_acceptable(&mut self, response: &Response, _sender: &Address) -> bool {
        if response.is_successful() {
            self.done = true;
        }
        true
    }

    fn needs_more_responses(&self) -> bool {
        !self.done
    }
}

/// Filter for remote reads.
///
/// Only keeps responses from members that are still owners of the key when
/// the response arrives, and stops at the first successful one.
pub struct OwnerValidityFilter {
    key: Key,
    pending: HashSet<Address>,
    topology: Arc<TopologyManager>,
    received_valid: bool,
}

impl OwnerValidityFilter {
    #[must_use]
    pub fn new(key: impl Into<Key>, targets: &[Address], self_address: &Address, topology: Arc<TopologyManager>) -> Self {
        let pending = targets
            .iter()
            .filter(|t| *t != self_address)
            .cloned()
            .collect();
        Self {
            key: key.into(),
            pending,
            topology,
            received_valid: false,
        }
    }
}

impl ResponseFilter for OwnerValidityFilter {
    fn is_acceptable(&mut self, response: &Response, sender: &Address) -> bool {
        self.pending.remove(sender);
        if !self.topology.is_owner(sender, &self.key) {
            trace!(key = %self.key, %sender, "ignoring response from a member that is no longer an owner");
            return false;
        }
        match response {
            Response::Successful(_) => {
                self.received_valid = true;
                true
            }
            Response::Exception(_) => true,
            Response::CacheNotFound => false,
        }
    }

    fn needs_more_responses(&self) -> bool {
        !self.received_valid && !self.pending.is_empty()
    }
}
