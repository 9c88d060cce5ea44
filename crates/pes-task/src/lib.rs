//! Subscription tasks for the Partitioned Event Store.
//!
//! A [`TaskContext`] is bound to one partition chain. Each [`Task`] in it
//! filters newly merged heads by entity type (and, optionally, by what a
//! caller's keychain may read) and hands them to a [`TaskCallback`] on its
//! own worker, in log order.

pub mod context;
pub mod error;
pub mod task;

pub use context::TaskContext;
pub use error::{TaskError, TaskResult};
pub use task::{CallbackResult, Task, TaskCallback};
