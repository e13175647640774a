//! Salience models, training and prediction on candle.
//!
//! `salix-nn` takes the padded host batches of `salix-core`, moves them to a
//! candle device and scores every node of every document. It owns the
//! embedding table, the relational scorers, the ranking losses and the
//! training loop.
//!
//! # Modules
//!
//! - [`embedding`]: shared id → vector table, trainable or frozen
//! - [`kernel`]: masked cosine similarity and kernel pooling
//! - [`propagation`]: cosine-affinity transition matrix and K-hop diffusion
//! - [`conv`]: residual one-hop graph convolution
//! - [`event`]: event composition strategies for the joint scorer
//! - [`combiner`]: relational signals + explicit features → one score
//! - [`model`]: [`SalienceModel`] and its configuration
//! - [`loss`]: hinge and pairwise within-document losses
//! - [`training`]: [`Trainer`] with validation and early stopping
//! - [`predict`]: per-document inference and the evaluator hand-off
//! - [`checkpoint`]: safetensors save/restore
//!
//! # Example: Train and Score
//!
//! ```rust,ignore
//! use salix_core::{NormalizerConfig, RecordNormalizer};
//! use salix_nn::{ModelConfig, ModelKind, SalienceModel, Trainer, TrainingConfig};
//! use candle_core::Device;
//!
//! let input = NormalizerConfig::default();
//! let docs = RecordNormalizer::new(input.clone())?.normalize_lines(&lines);
//!
//! let config = ModelConfig::default()
//!     .with_kind(ModelKind::KernelPooling)
//!     .with_vocab(entity_vocab, 0);
//! let mut model = SalienceModel::new(config, &input, &Device::Cpu)?;
//!
//! let trainer = Trainer::new(TrainingConfig::default().with_epochs(5), &input);
//! let report = trainer.train(&mut model, &docs, None, None)?;
//! ```

pub mod checkpoint;
pub mod combiner;
pub mod conv;
pub mod embedding;
pub mod error;
pub mod event;
pub mod kernel;
pub mod loss;
pub mod model;
pub mod predict;
pub mod propagation;
pub mod training;

pub use checkpoint::FROZEN_EMBEDDING;
pub use combiner::ScoreCombiner;
pub use embedding::{load_table, random_table, EmbeddingStore, EMBEDDING_VAR};
pub use error::{Error, Result};
pub use event::{EventEncoder, EventInput, EventStrategy};
pub use kernel::{KernelBank, KernelPooling};
pub use loss::{LossKind, LossValue};
pub use model::{Backend, ModelConfig, ModelInput, ModelKind, SalienceModel};
pub use predict::{
    eval_path, write_eval, DocumentPrediction, MetricAccumulator, NullEvaluator, PredictionSummary,
    Predictor, SalienceEvaluator,
};
pub use training::{BatchOutcome, EarlyStopping, Trainer, TrainingConfig, TrainingReport};
