//! Model checkpoints as safetensors files.
//!
//! A checkpoint holds every variable of the model's `VarMap` under its own
//! name, plus the frozen embedding table (if the model has one) under
//! [`FROZEN_EMBEDDING`]. Restoring requires a model built from the same
//! configuration; every tensor is shape-checked before anything is written.

use crate::error::{Error, Result};
use crate::model::SalienceModel;
use candle_core::Tensor;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Key of the frozen embedding table.
pub const FROZEN_EMBEDDING: &str = "embedding.frozen";

impl SalienceModel {
    pub fn save_checkpoint(&self, path: &Path) -> Result<()> {
        let mut tensors: HashMap<String, Tensor> = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::Checkpoint("variable map lock poisoned".into()))?
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        if self.embedding.is_frozen() {
            tensors.insert(FROZEN_EMBEDDING.to_string(), self.embedding.table().clone());
        }
        candle_core::safetensors::save(&tensors, path)?;
        info!(path = %path.display(), tensors = tensors.len(), "checkpoint written");
        Ok(())
    }

    pub fn load_checkpoint(&mut self, path: &Path) -> Result<()> {
        let mut tensors = candle_core::safetensors::load(path, self.device())?;

        {
            let vars = self
                .varmap
                .data()
                .lock()
                .map_err(|_| Error::Checkpoint("variable map lock poisoned".into()))?;
            for (name, var) in vars.iter() {
                let tensor = tensors
                    .get(name)
                    .ok_or_else(|| Error::Checkpoint(format!("missing tensor `{name}`")))?;
                if tensor.dims() != var.dims() {
                    return Err(Error::Checkpoint(format!(
                        "tensor `{name}` has shape {:?}, model expects {:?}",
                        tensor.dims(),
                        var.dims()
                    )));
                }
            }
            for (name, var) in vars.iter() {
                if let Some(tensor) = tensors.remove(name) {
                    var.set(&tensor)?;
                }
            }
        }

        match (self.embedding.is_frozen(), tensors.remove(FROZEN_EMBEDDING)) {
            (true, Some(table)) => self.embedding.replace_frozen(table)?,
            (true, None) => {
                return Err(Error::Checkpoint(format!(
                    "missing tensor `{FROZEN_EMBEDDING}`"
                )))
            }
            (false, Some(_)) => {
                return Err(Error::Checkpoint(
                    "checkpoint holds a frozen embedding, model embedding is trainable".into(),
                ))
            }
            (false, None) => {}
        }
        info!(path = %path.display(), "checkpoint restored");
        Ok(())
    }
}
