//! Partition chains for the Partitioned Event Store (PES).
//!
//! This crate is the heart of PES. It provides:
//! - `LogEntry` / `LogRecord` types and their versioned wire codec
//! - The rights engine: signature verification and write-key gatekeeping
//! - The merge engine: deterministic tie-breaks and pluggable three-way merges
//! - `PartitionChain`: the ordered history of one partition and the
//!   materialized objects replayed from it

pub mod chain;
pub mod codec;
pub mod config;
pub mod entry;
pub mod error;
pub mod merge;
pub mod object;
pub mod rights;

pub use chain::{
    AppendOutcome, ChainView, Disposition, History, MergeListener, PartitionChain,
    QuarantineReason, QuarantinedEntry,
};
pub use codec::RecordCodec;
pub use config::ChainConfig;
pub use entry::{EntryMeta, Fields, LogEntry, LogRecord, NewEntry, PublicKeyRecord, RightsSet};
pub use error::{ChainError, ChainResult, RightsError};
pub use merge::{
    FailOnConflictStrategy, FieldUnionStrategy, LastWriterWinsStrategy, MergeConflict, MergePolicy,
    MergeSide, MergeStrategy,
};
pub use object::MaterializedObject;
pub use rights::{
    AuthorityDirectory, EntityView, RightsEngine, RightsRegistry, RightsRules, StaticAuthorities,
    WriteIntent,
};
