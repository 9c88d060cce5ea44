//! Layered I/O pipeline for the Partitioned Event Store.
//!
//! Every layer implements [`IoLayer`] and delegates to the next one. A
//! [`Store`] assembles the fixed chain:
//!
//! - [`CacheLayer`]: bounded, rights-aware object cache; invalidated by merges
//! - [`AccessLogLayer`]: audit trail of every call and its decision
//! - [`BackendIo`]: signs writes, appends them through partition bridges,
//!   waits on sync markers and reads materialized state
//!
//! Callers identify themselves with a [`RequestContext`], which also holds
//! their deferred-write queue.

pub mod access;
pub mod backend;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod layer;
pub mod store;

pub use access::{AccessDecision, AccessLog, AccessLogLayer, AccessRecord};
pub use backend::BackendIo;
pub use cache::{CacheLayer, ObjectCache};
pub use config::{IoConfig, StoreConfig};
pub use context::{DeferredWrite, EntityDraft, RequestContext};
pub use error::{IoError, IoResult};
pub use layer::IoLayer;
pub use store::Store;
