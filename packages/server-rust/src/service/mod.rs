//! Background services run by a cache node.

pub mod maintenance;
pub mod worker;

pub use maintenance::{ExpiryPurger, MaintenanceTask};
pub use worker::{BackgroundRunnable, BackgroundWorker};
