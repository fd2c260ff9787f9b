//! Distribution: owner routing of non-transactional writes and remote reads.

pub mod coordinator;
pub mod recipients;

pub use coordinator::{DistributionCoordinator, WriteStage};
pub use recipients::Recipients;
