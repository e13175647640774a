//! Embedding store: the vocab × dim table shared by every model.
//!
//! Row 0 is the pad/unknown row. Lookups always return a zero vector there,
//! whatever the table holds, so padded slots contribute nothing downstream
//! once masks are applied.
//!
//! Ids outside the table (an entity missing from a pretrained matrix, for
//! instance) are remapped to 0 when host ids are converted to a tensor and
//! counted; [`EmbeddingStore::missing_count`] exposes the count for
//! vocabulary-coverage diagnostics.

use crate::error::{Error, Result};
use candle_core::{DType, Device, Shape, Tensor};
use candle_nn::{Init, VarBuilder};
use ndarray::{Array, Dimension};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Parameter name of the trainable table inside the model's `VarMap`.
pub const EMBEDDING_VAR: &str = "embedding.weight";

/// Owns the embedding matrix, trainable or frozen.
#[derive(Debug)]
pub struct EmbeddingStore {
    table: Tensor,
    frozen: bool,
    missing: AtomicUsize,
}

impl EmbeddingStore {
    /// Trainable table registered in the model's `VarMap` as [`EMBEDDING_VAR`].
    ///
    /// The caller writes the initial values (see [`random_table`]) after the
    /// builder is done; the returned handle shares storage with the variable.
    pub fn trainable(vocab_size: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        let table = vb.get_with_hints((vocab_size, dim), "weight", Init::Const(0.0))?;
        Ok(Self {
            table,
            frozen: false,
            missing: AtomicUsize::new(0),
        })
    }

    /// Fixed table that the optimizer never sees.
    pub fn frozen(table: Tensor) -> Result<Self> {
        if table.rank() != 2 {
            return Err(Error::DimensionMismatch {
                what: "embedding table rank",
                expected: 2,
                got: table.rank(),
            });
        }
        Ok(Self {
            table,
            frozen: true,
            missing: AtomicUsize::new(0),
        })
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn table(&self) -> &Tensor {
        &self.table
    }

    pub fn vocab_size(&self) -> usize {
        self.table.dims()[0]
    }

    pub fn dim(&self) -> usize {
        self.table.dims()[1]
    }

    /// Ids seen so far that had no row in the table.
    pub fn missing_count(&self) -> usize {
        self.missing.load(Ordering::Relaxed)
    }

    pub fn reset_missing_count(&self) {
        self.missing.store(0, Ordering::Relaxed);
    }

    /// Replaces a frozen table (checkpoint restore).
    pub(crate) fn replace_frozen(&mut self, table: Tensor) -> Result<()> {
        if table.dims() != self.table.dims() {
            return Err(Error::Checkpoint(format!(
                "frozen embedding has shape {:?}, model expects {:?}",
                table.dims(),
                self.table.dims()
            )));
        }
        self.table = table;
        Ok(())
    }

    /// Converts host ids to a `u32` tensor, remapping ids past the table to 0.
    pub fn ids_tensor<D: Dimension>(&self, ids: &Array<u32, D>, device: &Device) -> Result<Tensor> {
        let vocab = self.vocab_size() as u32;
        let mut missing = 0;
        let data: Vec<u32> = ids
            .iter()
            .map(|&id| {
                if id >= vocab {
                    missing += 1;
                    0
                } else {
                    id
                }
            })
            .collect();
        if missing > 0 {
            self.missing.fetch_add(missing, Ordering::Relaxed);
        }
        Ok(Tensor::from_vec(data, Shape::from(ids.shape().to_vec()), device)?)
    }

    /// Batched lookup: `ids` of any shape `S` gives `S × dim`; id 0 gives zeros.
    pub fn lookup(&self, ids: &Tensor) -> Result<Tensor> {
        let mut dims = ids.dims().to_vec();
        let flat = ids.flatten_all()?;
        let rows = self.table.index_select(&flat, 0)?;
        let keep = flat.ne(0u32)?.to_dtype(DType::F32)?.unsqueeze(1)?;
        let rows = rows.broadcast_mul(&keep)?;
        dims.push(self.dim());
        Ok(rows.reshape(dims)?)
    }
}

/// Seeded uniform table in `[-1/sqrt(dim), 1/sqrt(dim))` with a zero pad row.
pub fn random_table(vocab_size: usize, dim: usize, seed: u64, device: &Device) -> Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let bound = 1.0 / (dim as f32).sqrt();
    let data: Vec<f32> = (0..vocab_size * dim)
        .map(|i| {
            if i < dim {
                0.0
            } else {
                rng.random_range(-bound..bound)
            }
        })
        .collect();
    Ok(Tensor::from_vec(data, (vocab_size, dim), device)?)
}

/// Loads a pretrained matrix from `.npy` or `.safetensors`.
///
/// A safetensors file must hold a tensor named `embedding`, or exactly one
/// tensor.
pub fn load_table(path: &Path, device: &Device) -> Result<Tensor> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let table = match ext {
        "npy" => Tensor::read_npy(path)?,
        "safetensors" => {
            let mut tensors = candle_core::safetensors::load(path, device)?;
            match tensors.remove("embedding") {
                Some(t) => t,
                None if tensors.len() == 1 => tensors
                    .into_values()
                    .next()
                    .ok_or_else(|| Error::InvalidConfig("empty safetensors file".into()))?,
                None => {
                    return Err(Error::InvalidConfig(format!(
                        "{} has no `embedding` tensor",
                        path.display()
                    )))
                }
            }
        }
        other => {
            return Err(Error::InvalidConfig(format!(
                "unsupported embedding format {other:?} for {}",
                path.display()
            )))
        }
    };
    Ok(table.to_dtype(DType::F32)?.to_device(device)?)
}
