//! Responses to remote commands.

use gridcache_core::{Address, CacheEntry, CommandOutcome};
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Payload of a successful response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseValue {
    /// The command ran but produced nothing (e.g. an owner without the key).
    Null,
    Outcome(CommandOutcome),
    Entry(CacheEntry),
}

/// Classification of a remote failure, so the originator can re-raise the
/// right [`CacheError`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemoteErrorKind {
    TopologyMismatch { expected: i32, current: i32 },
    Store,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteException {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl From<&CacheError> for RemoteException {
    fn from(err: &CacheError) -> Self {
        let kind = match err {
            CacheError::TopologyMismatch { expected, current } => {
                RemoteErrorKind::TopologyMismatch {
                    expected: *expected,
                    current: *current,
                }
            }
            CacheError::Store(_) => RemoteErrorKind::Store,
            _ => RemoteErrorKind::Other,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl RemoteException {
    /// Re-raises the exception on the originator.
    #[must_use]
    pub fn into_error(self, member: &Address) -> CacheError {
        match self.kind {
            RemoteErrorKind::TopologyMismatch { expected, current } => {
                CacheError::TopologyMismatch { expected, current }
            }
            RemoteErrorKind::Store => CacheError::Store(anyhow::anyhow!(self.message)),
            RemoteErrorKind::Other => CacheError::RemoteFailure {
                member: member.clone(),
                message: self.message,
            },
        }
    }
}

/// What a member answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Response {
    Successful(ResponseValue),
    /// The member does not (or no longer) run the cache.
    CacheNotFound,
    Exception(RemoteException),
}

impl Response {
    #[must_use]
    pub fn is_successful(&self) -> bool {
        matches!(self, Response::Successful(_))
    }

    #[must_use]
    pub fn exception(err: &CacheError) -> Self {
        Response::Exception(RemoteException::from(err))
    }
}
