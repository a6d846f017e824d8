use crate::types::Stage;
use sparse_embedding_kernels::KernelError;
use thiserror::Error;

/// Error type for every embedding operation.
///
/// None of these are retried internally; the training loop is expected to abort.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// Invalid parameters detected at construction time.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// A shard ran out of rows. There is no eviction, so the table must be re-sized.
    #[error("Capacity exceeded: shard holds at most {capacity} keys")]
    CapacityExceeded { capacity: usize },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A stage was invoked where it is not allowed.
    #[error("Illegal call to stage {stage}: {reason}")]
    IllegalCall { stage: Stage, reason: String },
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),
}

impl EmbeddingError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn illegal(stage: Stage, reason: impl Into<String>) -> Self {
        Self::IllegalCall {
            stage,
            reason: reason.into(),
        }
    }

    pub(crate) fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, EmbeddingError>;
