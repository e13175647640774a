//! Final per-node scoring head.
//!
//! Concatenates the relational signal(s) of a scorer with an optional
//! explicit-feature score and maps them to one scalar per node. There is no
//! normalization across nodes: scores are only ever compared pairwise within
//! a document.

use candle_core::{Result, Tensor, D};
use candle_nn::{linear, linear_no_bias, Linear, Module, VarBuilder};

#[derive(Debug, Clone)]
pub struct ScoreCombiner {
    feature: Option<Linear>,
    output: Linear,
}

impl ScoreCombiner {
    /// # Arguments
    /// - `signal_dim`: width of the relational signal (kernel count, or 1)
    /// - `feature_dim`: explicit feature width, 0 for none
    /// - `vb`: variable builder
    pub fn new(signal_dim: usize, feature_dim: usize, vb: VarBuilder) -> Result<Self> {
        let feature = if feature_dim > 0 {
            Some(linear_no_bias(feature_dim, 1, vb.pp("feature"))?)
        } else {
            None
        };
        let inputs = signal_dim + usize::from(feature.is_some());
        let output = linear(inputs, 1, vb.pp("output"))?;
        Ok(Self { feature, output })
    }

    pub fn uses_features(&self) -> bool {
        self.feature.is_some()
    }

    /// # Arguments
    /// - `signals`: `(B, S, K)`
    /// - `features`: `(B, S, F)` when the combiner was built with features
    /// - `mask`: `(B, S)`
    ///
    /// # Returns
    /// - Scores `(B, S)`, zero on padded nodes
    pub fn forward(&self, signals: &Tensor, features: Option<&Tensor>, mask: &Tensor) -> Result<Tensor> {
        let joined = match (&self.feature, features) {
            (Some(head), Some(f)) => {
                let feature_score = head.forward(f)?.tanh()?;
                Tensor::cat(&[signals, &feature_score], D::Minus1)?
            }
            (Some(_), None) => candle_core::bail!("combiner expects explicit features"),
            (None, _) => signals.clone(),
        };
        self.output.forward(&joined)?.squeeze(D::Minus1)?.mul(mask)
    }
}
