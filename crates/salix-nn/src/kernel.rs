//! Masked kernel pooling over per-document similarity matrices.
//!
//! For node `i` and kernel `m`:
//!
//! ```text
//! K_m(i) = log( max( Σ_j mask_j · exp(-(sim_ij - μ_m)² / (2σ_m²)), 1e-10 ) )
//! ```
//!
//! Each kernel is a soft bin over cosine similarity: the exact-match kernel
//! (μ = 1, tiny σ) counts near-duplicates, the others count neighbours at
//! decreasing similarity. Summing over the neighbour axis and taking a log
//! gives a per-node feature vector that is differentiable and insensitive to
//! how many padding slots follow the real nodes.
//!
//! Similarity involving a padded node is set to zero explicitly, and padded
//! neighbours are removed from the sum by the mask rather than by relying on
//! their response being small.

use crate::error::{Error, Result};
use candle_core::{Device, Tensor, D};
use serde::{Deserialize, Serialize};

/// Floor applied before the log.
pub const MIN_POOLED: f32 = 1e-10;

/// Gaussian kernel parameters `(μ_m, σ_m)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelBank {
    pub mu: Vec<f32>,
    pub sigma: Vec<f32>,
}

impl Default for KernelBank {
    fn default() -> Self {
        Self::knrm(11)
    }
}

impl KernelBank {
    pub fn new(mu: Vec<f32>, sigma: Vec<f32>) -> Result<Self> {
        if mu.is_empty() || mu.len() != sigma.len() {
            return Err(Error::InvalidConfig(format!(
                "kernel bank needs matching non-empty mu/sigma lists, got {} and {}",
                mu.len(),
                sigma.len()
            )));
        }
        if let Some(s) = sigma.iter().find(|s| !(**s > 0.0)) {
            return Err(Error::InvalidConfig(format!("kernel sigma must be positive, got {s}")));
        }
        Ok(Self { mu, sigma })
    }

    /// Exact-match kernel `(1.0, 1e-3)` followed by `n - 1` soft kernels
    /// evenly spaced over `(-1, 1)` with σ = 0.1.
    pub fn knrm(n: usize) -> Self {
        let mut mu = vec![1.0];
        let mut sigma = vec![1e-3];
        if n > 1 {
            let soft = n - 1;
            let step = 2.0 / soft as f32;
            for k in 0..soft {
                mu.push(1.0 - step / 2.0 - step * k as f32);
                sigma.push(0.1);
            }
        }
        Self { mu, sigma }
    }

    pub fn len(&self) -> usize {
        self.mu.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mu.is_empty()
    }

    /// Host-side kernel responses to a single similarity value.
    pub fn response(&self, sim: f32) -> Vec<f32> {
        self.mu
            .iter()
            .zip(&self.sigma)
            .map(|(mu, sigma)| (-(sim - mu).powi(2) / (2.0 * sigma * sigma)).exp())
            .collect()
    }
}

/// Added under the square root of the squared norm.
pub const NORM_EPS: f64 = 1e-12;

/// Rows scaled to unit L2 norm; all-zero rows stay zero.
///
/// The epsilon sits inside the square root so the gradient at a zero row
/// (the pad row, unknown ids) is zero instead of `0/0`.
pub fn l2_normalize(emb: &Tensor) -> candle_core::Result<Tensor> {
    let norm = emb.sqr()?.sum_keepdim(D::Minus1)?.affine(1.0, NORM_EPS)?.sqrt()?;
    emb.broadcast_div(&norm)
}

/// Pairwise cosine similarity `(B, N, N)` with every pair touching a padded
/// node set to zero.
pub fn masked_cosine(emb: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
    let unit = l2_normalize(emb)?;
    let sim = unit.matmul(&unit.t()?.contiguous()?)?;
    let pair = mask.unsqueeze(2)?.broadcast_mul(&mask.unsqueeze(1)?)?;
    sim.mul(&pair)
}

/// Fixed kernel bank applied to similarity matrices.
#[derive(Debug, Clone)]
pub struct KernelPooling {
    mu: Tensor,
    inv_two_sigma_sq: Tensor,
    size: usize,
}

impl KernelPooling {
    pub fn new(bank: &KernelBank, device: &Device) -> Result<Self> {
        let size = bank.len();
        let mu = Tensor::from_vec(bank.mu.clone(), (1, 1, 1, size), device)?;
        let inv: Vec<f32> = bank.sigma.iter().map(|s| 1.0 / (2.0 * s * s)).collect();
        let inv_two_sigma_sq = Tensor::from_vec(inv, (1, 1, 1, size), device)?;
        Ok(Self {
            mu,
            inv_two_sigma_sq,
            size,
        })
    }

    /// Number of kernels `M`.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Pools `sim (B, N, N)` into `(B, N, M)` log kernel features.
    ///
    /// # Arguments
    /// - `sim`: similarity, already zeroed for padded pairs
    /// - `mask`: node validity `(B, N)`
    ///
    /// # Returns
    /// - Kernel features, zero on padded rows
    pub fn forward(&self, sim: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
        let diff = sim.unsqueeze(3)?.broadcast_sub(&self.mu)?;
        let response = diff
            .sqr()?
            .broadcast_mul(&self.inv_two_sigma_sq)?
            .neg()?
            .exp()?;
        // neighbours j live on axis 2
        let neighbours = mask.unsqueeze(1)?.unsqueeze(3)?;
        let pooled = response.broadcast_mul(&neighbours)?.sum(2)?;
        let features = pooled.maximum(MIN_POOLED)?.log()?;
        features.broadcast_mul(&mask.unsqueeze(2)?)
    }
}
