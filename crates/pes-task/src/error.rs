use pes_chain::ChainError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    /// Task workers are spawned onto the ambient tokio runtime.
    #[error("no tokio runtime available to run task workers")]
    NoRuntime,

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
}

pub type TaskResult<T> = Result<T, TaskError>;
