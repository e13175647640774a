//! Similarity-weighted diffusion of frequency weights.
//!
//! Personalized-PageRank flavour without teleport: each document's entities
//! form a dense graph whose edge weights are non-negative cosine affinities.
//! Columns are L1-normalized into a stochastic transition matrix and the
//! initial weight vector is pushed through it `K` times.
//!
//! ```text
//! A   = relu(Ê Êᵀ) ⊙ (m mᵀ)          Ê = L2-normalized embeddings
//! T   = A · diag(1 / colsum(A))
//! w_k = T w_{k-1},   w_0 = frequency weights
//! ```
//!
//! A real node whose column is all zero (zero embedding, e.g. an unknown id)
//! gets a self-loop, so its mass stays put instead of vanishing.

use crate::kernel::l2_normalize;
use candle_core::{DType, Tensor};

/// Column-stochastic transition matrix `(B, N, N)` from embeddings `(B, N, D)`.
///
/// Padded columns stay all-zero; every real column sums to one.
pub fn transition_matrix(emb: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
    let n = emb.dim(1)?;
    let unit = l2_normalize(emb)?;
    let pair = mask.unsqueeze(2)?.broadcast_mul(&mask.unsqueeze(1)?)?;
    let affinity = unit.matmul(&unit.t()?.contiguous()?)?.relu()?.mul(&pair)?;

    // (B, 1, N): 1 where a real node has no incoming affinity
    let col = affinity.sum_keepdim(1)?;
    let isolated = col.eq(0f32)?.to_dtype(DType::F32)?.broadcast_mul(&mask.unsqueeze(1)?)?;
    let eye = Tensor::eye(n, DType::F32, emb.device())?.unsqueeze(0)?;
    let affinity = affinity.broadcast_add(&eye.broadcast_mul(&isolated)?)?;

    let col = affinity.sum_keepdim(1)?;
    let denom = col.add(&col.eq(0f32)?.to_dtype(DType::F32)?)?;
    affinity.broadcast_div(&denom)
}

/// Applies `transition` to `weights (B, N)` `hops` times.
pub fn propagate(transition: &Tensor, weights: &Tensor, hops: usize) -> candle_core::Result<Tensor> {
    let mut w = weights.unsqueeze(2)?;
    for _ in 0..hops {
        w = transition.matmul(&w)?;
    }
    w.squeeze(2)
}
