//! Sync barrier for the Partitioned Event Store.
//!
//! A writer registers a [`SyncToken`](pes_types::SyncToken), appends a
//! marker carrying it to the partition it wrote, and waits. When the feed
//! replays the marker the token is finished and the waiter wakes: everything
//! the writer appended before the marker is now visible to readers of that
//! partition.

pub mod config;
pub mod manager;

pub use config::SyncConfig;
pub use manager::SyncManager;
