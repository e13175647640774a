//! One-hop graph convolution over the document's entity/event graph.
//!
//! Used by the graph event strategies: node embeddings are augmented with
//! their neighbours' projected embeddings before kernel pooling, either added
//! back residually or concatenated alongside the input.

use candle_core::{Result, Tensor, D};
use candle_nn::{linear_no_bias, Linear, Module, VarBuilder};

/// Residual GCN layer: `H' = H + Â H W`.
///
/// `Â` is the symmetric normalized adjacency with self-loops
/// (`D^{-1/2} (A + I) D^{-1/2}`) built by the batch assembler; its padded
/// rows and columns are zero, so padded nodes receive no messages.
///
/// # Reference
///
/// Kipf & Welling, "Semi-Supervised Classification with Graph Convolutional
/// Networks", ICLR 2017.
#[derive(Debug, Clone)]
pub struct GraphConv {
    linear: Linear,
}

impl GraphConv {
    /// # Arguments
    /// - `dim`: node embedding dimension (input and output)
    /// - `vb`: variable builder for the projection `W`
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            linear: linear_no_bias(dim, dim, vb)?,
        })
    }

    /// # Arguments
    /// - `x`: node embeddings `(B, S, D)`
    /// - `adj`: normalized adjacency `(B, S, S)`
    ///
    /// # Returns
    /// - Refined embeddings `(B, S, D)`
    pub fn forward(&self, x: &Tensor, adj: &Tensor) -> Result<Tensor> {
        x.add(&self.messages(x, adj)?)
    }

    /// `[H ; Â H W]`, doubling the embedding width to `2D`.
    pub fn forward_concat(&self, x: &Tensor, adj: &Tensor) -> Result<Tensor> {
        Tensor::cat(&[x, &self.messages(x, adj)?], D::Minus1)
    }

    fn messages(&self, x: &Tensor, adj: &Tensor) -> Result<Tensor> {
        adj.matmul(&self.linear.forward(x)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_graph_conv_shape_and_isolation() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let conv = GraphConv::new(4, vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (2, 3, 4), &device).unwrap();
        let adj = Tensor::zeros((2, 3, 3), DType::F32, &device).unwrap();
        let out = conv.forward(&x, &adj).unwrap();
        assert_eq!(out.dims(), &[2, 3, 4]);

        // without edges the residual path returns the input unchanged
        let diff = out.sub(&x).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_graph_conv_concat_keeps_input_half() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let conv = GraphConv::new(4, vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (2, 3, 4), &device).unwrap();
        let adj = Tensor::eye(3, DType::F32, &device).unwrap().unsqueeze(0).unwrap();
        let adj = adj.broadcast_as((2, 3, 3)).unwrap().contiguous().unwrap();
        let out = conv.forward_concat(&x, &adj).unwrap();
        assert_eq!(out.dims(), &[2, 3, 8]);

        let head = out.narrow(2, 0, 4).unwrap();
        let diff = head.sub(&x).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }
}
