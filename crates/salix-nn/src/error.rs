//! Error types for salix-nn.

use thiserror::Error;

/// Salix-nn error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Normalization or batching error.
    #[error(transparent)]
    Core(#[from] salix_core::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Dimension mismatch.
    #[error("dimension mismatch for {what}: expected {expected}, got {got}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Loss, scores, gradients or parameters became NaN or infinite.
    #[error("non-finite {what} at epoch {epoch}, batch {batch} (loss {loss})")]
    NumericDivergence {
        what: &'static str,
        epoch: usize,
        batch: usize,
        loss: f32,
    },

    /// Checkpoint could not be written or restored.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

impl Error {
    /// True for the signal raised when every document of a batch was skipped.
    pub fn is_empty_batch(&self) -> bool {
        matches!(self, Error::Core(salix_core::Error::EmptyBatch))
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
