//! Storage: the local data container, the persistent store SPI with its
//! in-memory and write-behind implementations, and the gateway that decides
//! when in-memory mutations reach the store.

pub mod container;
pub mod gateway;
pub mod memory;
pub mod stats;
pub mod store;
pub mod write_behind;

pub use container::DataContainer;
pub use gateway::PersistentStoreGateway;
pub use memory::InMemoryStore;
pub use stats::StoreStatistics;
pub use store::{CacheStore, KeyFilter};
pub use write_behind::{WriteBehindFlusher, WriteBehindStore, WriteBehindTask};
