//! Training loop with validation and early stopping.
//!
//! ```text
//! for epoch:
//!     for batch of batch_size documents (last one may be partial):
//!         assemble -> forward -> loss -> backward -> AdamW step
//!     validation loss (no step)
//!     best? -> checkpoint          else patience += 1
//!     patience > limit -> stop
//! ```
//!
//! Documents arrive already normalized; skipped documents never reach the
//! trainer. A batch whose documents are all empty is skipped, a batch with no
//! comparable (positive, negative) term takes no step, and a non-finite loss,
//! score, gradient or updated parameter aborts training with the epoch and
//! batch index. The hinge and pairwise losses clip NaN scores to zero, so the
//! loss alone cannot be trusted.
//!
//! # Example
//!
//! ```rust,ignore
//! use salix_nn::training::{Trainer, TrainingConfig};
//!
//! let config = TrainingConfig::default()
//!     .with_learning_rate(0.001)
//!     .with_epochs(10)
//!     .with_early_stopping(2);
//!
//! let trainer = Trainer::new(config, &normalizer_config);
//! let report = trainer.train(&mut model, &train_docs, Some(&dev_docs), Some(path))?;
//! ```

use crate::error::{Error, Result};
use crate::loss::LossKind;
use crate::model::SalienceModel;
use candle_core::{DType, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use salix_core::{BatchAssembler, NormalizedDocument, NormalizerConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Training configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Learning rate (default: 0.001).
    pub learning_rate: f64,
    /// Documents per batch (default: 128).
    pub batch_size: usize,
    /// Number of epochs (default: 2).
    #[serde(alias = "number_of_epochs")]
    pub epochs: usize,
    /// Ranking loss (default: hinge).
    pub loss: LossKind,
    /// Loss margin (default: 1.0).
    pub margin: f32,
    /// Epochs without validation improvement tolerated (None = never stop early).
    pub early_stopping_patience: Option<usize>,
    /// Decoupled weight decay (default: 0.0).
    pub weight_decay: f64,
    /// Batches between progress lines (default: 100).
    pub log_every: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            batch_size: 128,
            epochs: 2,
            loss: LossKind::Hinge,
            margin: 1.0,
            early_stopping_patience: None,
            weight_decay: 0.0,
            log_every: 100,
        }
    }
}

impl TrainingConfig {
    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_loss(mut self, loss: LossKind) -> Self {
        self.loss = loss;
        self
    }

    pub fn with_margin(mut self, margin: f32) -> Self {
        self.margin = margin;
        self
    }

    pub fn with_early_stopping(mut self, patience: usize) -> Self {
        self.early_stopping_patience = Some(patience);
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be positive".into()));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(Error::InvalidConfig(format!(
                "learning_rate must be a positive number, got {}",
                self.learning_rate
            )));
        }
        if !self.margin.is_finite() || self.margin < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "margin must be non-negative, got {}",
                self.margin
            )));
        }
        Ok(())
    }
}

/// Patience counter over validation losses.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: Option<usize>,
    best: f32,
    best_epoch: usize,
    counter: usize,
}

impl EarlyStopping {
    pub fn new(patience: Option<usize>) -> Self {
        Self {
            patience,
            best: f32::INFINITY,
            best_epoch: 0,
            counter: 0,
        }
    }

    /// Records an epoch's validation loss; true when it is the best so far.
    pub fn observe(&mut self, epoch: usize, loss: f32) -> bool {
        if loss < self.best {
            self.best = loss;
            self.best_epoch = epoch;
            self.counter = 0;
            true
        } else {
            self.counter += 1;
            false
        }
    }

    pub fn should_stop(&self) -> bool {
        self.patience.is_some_and(|p| self.counter > p)
    }

    pub fn best(&self) -> Option<f32> {
        self.best.is_finite().then_some(self.best)
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }
}

/// What happened to one batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BatchOutcome {
    Trained { loss: f32 },
    /// Every document of the batch was empty.
    Empty,
    /// No valid loss term; no step taken.
    NoTerms,
}

/// Training results.
#[derive(Debug, Clone, Default)]
pub struct TrainingReport {
    /// Mean training loss per epoch.
    pub loss_history: Vec<f32>,
    /// Validation loss per epoch (if a validation set was given).
    pub validation_history: Vec<f32>,
    /// Epoch with the best validation loss, or the last epoch without one.
    pub best_epoch: usize,
    pub stopped_early: bool,
    pub epochs_run: usize,
}

pub struct Trainer {
    config: TrainingConfig,
    assembler: BatchAssembler,
}

impl Trainer {
    pub fn new(config: TrainingConfig, input: &NormalizerConfig) -> Self {
        Self {
            config,
            assembler: BatchAssembler::from_config(input),
        }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn optimizer(&self, model: &SalienceModel) -> Result<AdamW> {
        let params = ParamsAdamW {
            lr: self.config.learning_rate,
            weight_decay: self.config.weight_decay,
            ..Default::default()
        };
        Ok(AdamW::new(model.trainable_vars(), params)?)
    }

    /// Runs the full loop. `checkpoint` receives the best model so far.
    pub fn train(
        &self,
        model: &mut SalienceModel,
        train: &[NormalizedDocument],
        validation: Option<&[NormalizedDocument]>,
        checkpoint: Option<&Path>,
    ) -> Result<TrainingReport> {
        self.config.validate()?;
        let mut optimizer = self.optimizer(model)?;
        let mut stopping = EarlyStopping::new(self.config.early_stopping_patience);
        let mut report = TrainingReport::default();

        for epoch in 0..self.config.epochs {
            info!(epoch, documents = train.len(), "epoch start");
            let mean = self.train_epoch(&mut optimizer, model, train, epoch)?;
            report.loss_history.push(mean);
            report.epochs_run = epoch + 1;
            info!(epoch, loss = mean, "epoch done");
            warn_missing(model);

            let improved = match validation {
                Some(docs) => match self.validation_loss(model, docs)? {
                    Some(loss) => {
                        report.validation_history.push(loss);
                        let improved = stopping.observe(epoch, loss);
                        info!(epoch, loss, best = ?stopping.best(), "validation");
                        improved
                    }
                    None => {
                        warn!(epoch, "validation set has no comparable terms");
                        true
                    }
                },
                None => {
                    report.best_epoch = epoch;
                    true
                }
            };

            if improved {
                if let Some(path) = checkpoint {
                    model.save_checkpoint(path)?;
                }
            }
            if stopping.should_stop() {
                info!(epoch, best_epoch = stopping.best_epoch(), "early stopping");
                report.stopped_early = true;
                break;
            }
        }
        if validation.is_some() && stopping.best().is_some() {
            report.best_epoch = stopping.best_epoch();
        }
        Ok(report)
    }

    /// One pass over `docs`; returns the mean loss of the trained batches.
    pub fn train_epoch(
        &self,
        optimizer: &mut AdamW,
        model: &SalienceModel,
        docs: &[NormalizedDocument],
        epoch: usize,
    ) -> Result<f32> {
        let mut total = 0.0f64;
        let mut trained = 0usize;
        for (index, chunk) in docs.chunks(self.config.batch_size).enumerate() {
            match self.train_batch(optimizer, model, chunk, epoch, index)? {
                BatchOutcome::Trained { loss } => {
                    total += loss as f64;
                    trained += 1;
                }
                BatchOutcome::Empty => debug!(epoch, batch = index, "empty batch skipped"),
                BatchOutcome::NoTerms => debug!(epoch, batch = index, "no loss terms"),
            }
            if self.config.log_every > 0 && (index + 1) % self.config.log_every == 0 {
                info!(
                    epoch,
                    batch = index + 1,
                    loss = total / trained.max(1) as f64,
                    "training"
                );
            }
        }
        Ok((total / trained.max(1) as f64) as f32)
    }

    /// Forward, loss, backward and one optimizer step.
    pub fn train_batch(
        &self,
        optimizer: &mut AdamW,
        model: &SalienceModel,
        docs: &[NormalizedDocument],
        epoch: usize,
        batch: usize,
    ) -> Result<BatchOutcome> {
        let Some(value) = self.batch_loss(model, docs)? else {
            return Ok(BatchOutcome::Empty);
        };
        if value.terms == 0 {
            return Ok(BatchOutcome::NoTerms);
        }
        let loss = value.loss.to_scalar::<f32>()?;
        let diverged = |what| Error::NumericDivergence {
            what,
            epoch,
            batch,
            loss,
        };
        if !loss.is_finite() {
            return Err(diverged("loss"));
        }
        if !all_finite(&value.scores)? {
            return Err(diverged("scores"));
        }
        let grads = value.loss.backward()?;
        let vars = model.trainable_vars();
        for var in &vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                if !all_finite(grad)? {
                    return Err(diverged("gradients"));
                }
            }
        }
        optimizer.step(&grads)?;
        for var in &vars {
            if !all_finite(var.as_tensor())? {
                return Err(diverged("parameters"));
            }
        }
        Ok(BatchOutcome::Trained { loss })
    }

    /// Term-weighted mean loss over `docs` without touching parameters.
    /// `None` when no batch has a comparable term.
    pub fn validation_loss(&self, model: &SalienceModel, docs: &[NormalizedDocument]) -> Result<Option<f32>> {
        let mut total = 0.0f64;
        let mut terms = 0usize;
        for chunk in docs.chunks(self.config.batch_size) {
            let Some(value) = self.batch_loss(model, chunk)? else {
                continue;
            };
            if value.terms == 0 {
                continue;
            }
            let loss = value.loss.detach().to_scalar::<f32>()?;
            total += loss as f64 * value.terms as f64;
            terms += value.terms;
        }
        Ok((terms > 0).then(|| (total / terms as f64) as f32))
    }

    fn batch_loss(&self, model: &SalienceModel, docs: &[NormalizedDocument]) -> Result<Option<ScoredLoss>> {
        let batch = match self.assembler.assemble(docs) {
            Ok(batch) => batch,
            Err(e) => {
                let e = Error::from(e);
                return if e.is_empty_batch() { Ok(None) } else { Err(e) };
            }
        };
        let input = model.prepare(&batch)?;
        let scores = model.forward(&input)?;
        let value = self
            .config
            .loss
            .compute(&scores, &input.labels, &input.score_mask, self.config.margin)?;
        Ok(Some(ScoredLoss {
            loss: value.loss,
            terms: value.terms,
            scores,
        }))
    }
}

/// A batch loss together with the scores it was computed from.
struct ScoredLoss {
    loss: Tensor,
    terms: usize,
    scores: Tensor,
}

fn all_finite(t: &Tensor) -> Result<bool> {
    let values = t.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    Ok(values.iter().all(|v| v.is_finite()))
}

fn warn_missing(model: &SalienceModel) {
    let missing = model.embedding().missing_count();
    if missing > 0 {
        warn!(missing, "ids without an embedding row were mapped to 0");
        model.embedding().reset_missing_count();
    }
}
