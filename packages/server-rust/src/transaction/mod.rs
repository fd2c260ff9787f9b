//! Transactions: local transaction state, the global id, conversion to
//! store modifications, and the prepare/commit/rollback coordinator.

pub mod cache_tx;
pub mod coordinator;
pub mod id;
pub mod log;
pub mod manager;
pub mod registry;

pub use cache_tx::{CacheTransaction, TxState};
pub use coordinator::{HoldsKey, TransactionCoordinator};
pub use id::GlobalTransactionId;
pub use log::{LogSource, ModificationLog};
pub use manager::{AmbientSuspension, SuspendedTransaction, TransactionManager};
pub use registry::TransactionRegistry;
