//! `salix` scores entities and events in a document by predicted salience.
//!
//! This crate re-exports the two libraries that do the work:
//!
//! - [`salix_core`]: record normalization, ragged batch assembly,
//!   vocabularies and corpus hashing. No tensor backend.
//! - [`salix_nn`]: embedding store, kernel-pooling and propagation
//!   scorers, training loop and prediction on candle.
//!
//! ```text
//! JSON line ─▶ RecordNormalizer ─▶ BatchAssembler ─▶ SalienceModel ─▶ scores
//!                                                        │
//!                                         Trainer (loss) ┴ Predictor (ranked output)
//! ```

pub use salix_core;
pub use salix_nn;

pub use salix_core::{
    Batch, BatchAssembler, InputGroup, NormalizedDocument, NormalizerConfig, RecordNormalizer,
};
pub use salix_nn::{
    LossKind, ModelConfig, ModelKind, Predictor, SalienceModel, Trainer, TrainingConfig,
};
