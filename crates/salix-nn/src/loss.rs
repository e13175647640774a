//! Within-document ranking losses.
//!
//! Both losses only ever compare a document's scores with its own labels;
//! padded nodes and cross-document pairs never contribute.
//!
//! - **Hinge**: mean over valid nodes of `max(0, margin − y·s)`.
//! - **Pairwise**: mean over `(positive, negative)` pairs of the same
//!   document of `max(0, margin − (s⁺ − s⁻))`.

use crate::error::Result;
use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    #[default]
    Hinge,
    Pairwise,
}

/// A scalar loss and the number of terms averaged into it.
///
/// `terms == 0` means nothing in the batch could be compared; `loss` is then
/// a constant zero and no optimizer step should be taken.
#[derive(Debug, Clone)]
pub struct LossValue {
    pub loss: Tensor,
    pub terms: usize,
}

impl LossKind {
    /// # Arguments
    /// - `scores`, `labels`, `mask`: `(B, S)`; labels are `+1/-1`, 0 on padding
    pub fn compute(self, scores: &Tensor, labels: &Tensor, mask: &Tensor, margin: f32) -> Result<LossValue> {
        match self {
            LossKind::Hinge => hinge(scores, labels, mask, margin),
            LossKind::Pairwise => pairwise(scores, labels, mask, margin),
        }
    }
}

fn hinge(scores: &Tensor, labels: &Tensor, mask: &Tensor, margin: f32) -> Result<LossValue> {
    let per_node = scores
        .mul(labels)?
        .affine(-1.0, margin as f64)?
        .relu()?
        .mul(mask)?;
    mean_over(per_node, mask)
}

fn pairwise(scores: &Tensor, labels: &Tensor, mask: &Tensor, margin: f32) -> Result<LossValue> {
    let positive = labels.eq(1f32)?.to_dtype(DType::F32)?.mul(mask)?;
    let negative = labels.eq(-1f32)?.to_dtype(DType::F32)?.mul(mask)?;
    // (B, S, S): rows index the positive node, columns the negative one
    let pairs = positive.unsqueeze(2)?.broadcast_mul(&negative.unsqueeze(1)?)?;
    let gap = scores.unsqueeze(2)?.broadcast_sub(&scores.unsqueeze(1)?)?;
    let per_pair = gap.affine(-1.0, margin as f64)?.relu()?.mul(&pairs)?;
    mean_over(per_pair, &pairs)
}

fn mean_over(values: Tensor, weights: &Tensor) -> Result<LossValue> {
    let terms = weights.sum_all()?.to_scalar::<f32>()?.round() as usize;
    if terms == 0 {
        return Ok(LossValue {
            loss: Tensor::zeros((), DType::F32, values.device())?,
            terms,
        });
    }
    let loss = values.sum_all()?.affine(1.0 / terms as f64, 0.0)?;
    Ok(LossValue { loss, terms })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn t(rows: &[[f32; 3]]) -> Tensor {
        Tensor::from_vec(rows.concat(), (rows.len(), 3), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_hinge() {
        let scores = t(&[[2.0, 0.5, 9.0], [-1.0, 0.0, 0.0]]);
        let labels = t(&[[1.0, -1.0, 0.0], [-1.0, 0.0, 0.0]]);
        let mask = t(&[[1.0, 1.0, 0.0], [1.0, 0.0, 0.0]]);
        let value = LossKind::Hinge.compute(&scores, &labels, &mask, 1.0).unwrap();
        // terms: max(0, 1-2)=0, max(0, 1+0.5)=1.5, max(0, 1-1)=0
        assert_eq!(value.terms, 3);
        assert!((value.loss.to_scalar::<f32>().unwrap() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_pairwise_stays_within_document() {
        let scores = t(&[[1.0, 0.8, 0.0], [5.0, 0.0, 0.0]]);
        let labels = t(&[[1.0, -1.0, 0.0], [-1.0, 0.0, 0.0]]);
        let mask = t(&[[1.0, 1.0, 0.0], [1.0, 0.0, 0.0]]);
        let value = LossKind::Pairwise.compute(&scores, &labels, &mask, 1.0).unwrap();
        // single pair in doc 0: max(0, 1 - (1.0 - 0.8)) = 0.8
        assert_eq!(value.terms, 1);
        assert!((value.loss.to_scalar::<f32>().unwrap() - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_no_terms_is_zero() {
        let scores = t(&[[1.0, 2.0, 0.0]]);
        let labels = t(&[[-1.0, -1.0, 0.0]]);
        let mask = t(&[[1.0, 1.0, 0.0]]);
        let value = LossKind::Pairwise.compute(&scores, &labels, &mask, 1.0).unwrap();
        assert_eq!(value.terms, 0);
        assert_eq!(value.loss.to_scalar::<f32>().unwrap(), 0.0);
    }
}
