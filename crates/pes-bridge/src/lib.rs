//! Partition bridges for the Partitioned Event Store.
//!
//! A [`PartitionBridge`] binds one [`PartitionChain`](pes_chain::PartitionChain)
//! to a [`LogBackend`]: writes are encoded and appended to the backend, and a
//! feeder task replays whatever the backend assigns offsets to back into the
//! chain, in offset order. Sync markers seen on the way finish their tokens
//! in the [`SyncManager`](pes_sync::SyncManager).
//!
//! Two backends ship with the crate:
//! - [`MemoryLog`]: ordered in-memory log for tests and ephemeral stores
//! - [`FileLog`]: one length/CRC framed segment file per partition

pub mod backend;
pub mod bridge;
pub mod builder;
pub mod config;
pub mod error;
pub mod file;
pub mod memory;

pub use backend::{LogBackend, LogItem, Subscription};
pub use bridge::PartitionBridge;
pub use builder::BridgeBuilder;
pub use config::{BackendConfig, BridgeConfig};
pub use error::{BridgeError, BridgeResult};
pub use file::FileLog;
pub use memory::MemoryLog;
