//! Error types for salix-core.

use crate::batch::Field;
use thiserror::Error;

/// Salix-core error type.
///
/// Problems confined to a single document are not errors: the normalizer
/// reports them as [`crate::Normalized::Skipped`].
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Dimension mismatch.
    #[error("dimension mismatch for {what}: expected {expected}, got {got}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// Every document handed to the assembler was skipped.
    #[error("empty batch: no document has a kept entity or event")]
    EmptyBatch,

    /// The batch does not carry the requested array.
    #[error("batch has no array for {0}")]
    MissingArray(Field),

    /// The batch array has a different rank or dtype than requested.
    #[error("array {field} is not {expected}")]
    ArrayType {
        field: Field,
        expected: &'static str,
    },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
