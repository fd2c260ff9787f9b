//! Cluster boundary: remote commands and responses, the transport seam,
//! remote invocation with response filtering, and the installed topology.

pub mod command;
pub mod filter;
pub mod local;
pub mod response;
pub mod rpc;
pub mod topology;
pub mod transport;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use command::RemoteCommand;
pub use filter::{FirstSuccessfulFilter, OwnerValidityFilter, ResponseFilter};
pub use local::{LocalCluster, LocalTransport};
pub use response::{RemoteErrorKind, RemoteException, Response, ResponseValue};
pub use rpc::{ResponseMode, RpcManager, RpcOptions};
pub use topology::TopologyManager;
pub use transport::{CommandHandler, Transport};
