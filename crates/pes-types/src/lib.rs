//! Foundation types for the Partitioned Event Store (PES).
//!
//! Every other PES crate depends on `pes-types`.
//!
//! # Key Types
//!
//! - [`EntryId`] / [`EntityId`]: UUID v7 identifiers for log entries and the entities they describe
//! - [`PartitionKey`]: `(topic, index)` pair naming one independently-ordered log
//! - [`SyncToken`]: random correlation id for the write-visibility barrier
//! - [`KeyHash`]: BLAKE3 digest identifying a public key
//! - [`TemporalAnchor`] / [`HybridLogicalClock`]: causal timestamps used for merge tie-breaks

pub mod clock;
pub mod error;
pub mod ids;
pub mod key;
pub mod partition;
pub mod sync;
pub mod temporal;

pub use clock::HybridLogicalClock;
pub use error::TypeError;
pub use ids::{EntityId, EntryId};
pub use key::KeyHash;
pub use partition::PartitionKey;
pub use sync::SyncToken;
pub use temporal::TemporalAnchor;
