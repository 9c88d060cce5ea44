use pes_bridge::BridgeError;
use pes_chain::ChainError;
use pes_task::TaskError;

/// Errors surfaced by the I/O pipeline.
///
/// Validation failures are not errors here: write operations report them
/// as `Ok(false)`.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("task error: {0}")]
    Task(#[from] TaskError),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IoError {
    /// Corruption of a partition log, from either layer.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Bridge(e) => e.is_fatal(),
            Self::Chain(e) => matches!(e, ChainError::Corruption { .. }),
            _ => false,
        }
    }
}

pub type IoResult<T> = Result<T, IoError>;
