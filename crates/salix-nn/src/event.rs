//! Event representation strategies for the joint kernel scorer.
//!
//! An event is a predicate (its lexical head id) plus a ragged list of
//! argument entity ids. The strategy decides how those become one embedding
//! per event; the kernel scorer itself is the same for every strategy.
//!
//! | Strategy | Event embedding |
//! |----------|-----------------|
//! | `Plain` | `p` |
//! | `ArgumentAverage` | `(p + Σ a) / (1 + n)` |
//! | `ArgumentCombine` | `tanh(W [p ; tanh(W' mean(a))])` |
//! | `ArgumentAttention` | `p + Σ softmax(a · p) a` |
//! | `GraphConvolved` | argument average, then a residual GCN hop over all nodes |
//! | `GraphConcat` | argument average, then `[h ; GCN(h)]` over all nodes (width `2D`) |

use crate::conv::GraphConv;
use crate::embedding::EmbeddingStore;
use crate::error::Result;
use candle_core::{DType, Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

/// How event embeddings are composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStrategy {
    #[default]
    Plain,
    ArgumentAverage,
    ArgumentCombine,
    ArgumentAttention,
    GraphConvolved,
    GraphConcat,
}

/// Event-axis tensors of a joint-graph batch.
#[derive(Debug, Clone)]
pub struct EventInput {
    /// Event ids `(B, V)`, already offset past the entity vocabulary.
    pub ids: Tensor,
    /// `(B, V)`
    pub mask: Tensor,
    /// Argument entity ids `(B, V, A)`.
    pub arguments: Tensor,
    /// `(B, V, A)`
    pub argument_mask: Tensor,
    /// True argument counts as floats `(B, V)`.
    pub argument_lengths: Tensor,
    /// Normalized adjacency over the scoring axis `(B, N + V, N + V)`.
    pub adjacency: Tensor,
}

/// A strategy with its parameters.
#[derive(Debug, Clone)]
pub enum EventEncoder {
    Plain,
    ArgumentAverage,
    ArgumentCombine { arguments: Linear, combine: Linear },
    ArgumentAttention,
    GraphConvolved { conv: GraphConv },
    GraphConcat { conv: GraphConv },
}

impl EventEncoder {
    pub fn new(strategy: EventStrategy, dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(match strategy {
            EventStrategy::Plain => EventEncoder::Plain,
            EventStrategy::ArgumentAverage => EventEncoder::ArgumentAverage,
            EventStrategy::ArgumentCombine => EventEncoder::ArgumentCombine {
                arguments: linear(dim, dim, vb.pp("arguments"))?,
                combine: linear(2 * dim, dim, vb.pp("combine"))?,
            },
            EventStrategy::ArgumentAttention => EventEncoder::ArgumentAttention,
            EventStrategy::GraphConvolved => EventEncoder::GraphConvolved {
                conv: GraphConv::new(dim, vb.pp("conv"))?,
            },
            EventStrategy::GraphConcat => EventEncoder::GraphConcat {
                conv: GraphConv::new(dim, vb.pp("conv"))?,
            },
        })
    }

    /// Event embeddings `(B, V, D)`, zero on padded events.
    pub fn encode(&self, store: &EmbeddingStore, events: &EventInput) -> Result<Tensor> {
        let predicate = store.lookup(&events.ids)?;
        let encoded = match self {
            EventEncoder::Plain => predicate,
            EventEncoder::ArgumentAverage
            | EventEncoder::GraphConvolved { .. }
            | EventEncoder::GraphConcat { .. } => {
                let sum = argument_sum(store, events)?;
                let count = events.argument_lengths.affine(1.0, 1.0)?.unsqueeze(2)?;
                predicate.add(&sum)?.broadcast_div(&count)?
            }
            EventEncoder::ArgumentCombine { arguments, combine } => {
                let sum = argument_sum(store, events)?;
                let lengths = &events.argument_lengths;
                let count = lengths.add(&lengths.eq(0f32)?.to_dtype(DType::F32)?)?;
                let mean = sum.broadcast_div(&count.unsqueeze(2)?)?;
                let args = arguments.forward(&mean)?.tanh()?;
                let joined = Tensor::cat(&[&predicate, &args], D::Minus1)?;
                combine.forward(&joined)?.tanh()?
            }
            EventEncoder::ArgumentAttention => {
                let args = store.lookup(&events.arguments)?;
                let logits = args.broadcast_mul(&predicate.unsqueeze(2)?)?.sum(D::Minus1)?;
                let weights = masked_softmax(&logits, &events.argument_mask)?;
                let attended = args.broadcast_mul(&weights.unsqueeze(3)?)?.sum(2)?;
                predicate.add(&attended)?
            }
        };
        Ok(encoded.broadcast_mul(&events.mask.unsqueeze(2)?)?)
    }

    /// Graph refinement of the combined node embeddings `(B, N + V, D)`.
    /// Identity for the non-graph strategies; `GraphConcat` returns width `2D`.
    pub fn refine(&self, nodes: &Tensor, adjacency: &Tensor) -> Result<Tensor> {
        match self {
            EventEncoder::GraphConvolved { conv } => Ok(conv.forward(nodes, adjacency)?),
            EventEncoder::GraphConcat { conv } => Ok(conv.forward_concat(nodes, adjacency)?),
            _ => Ok(nodes.clone()),
        }
    }
}

/// Σ over valid arguments of their embeddings, `(B, V, D)`.
fn argument_sum(store: &EmbeddingStore, events: &EventInput) -> Result<Tensor> {
    let args = store.lookup(&events.arguments)?;
    Ok(args
        .broadcast_mul(&events.argument_mask.unsqueeze(3)?)?
        .sum(2)?)
}

/// Softmax over the last axis restricted to `mask`; all-masked rows give zeros.
fn masked_softmax(logits: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
    let max = logits.max_keepdim(D::Minus1)?;
    let e = logits.broadcast_sub(&max)?.exp()?.mul(mask)?;
    let z = e.sum_keepdim(D::Minus1)?;
    let z = z.add(&z.eq(0f32)?.to_dtype(DType::F32)?)?;
    e.broadcast_div(&z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn store() -> EmbeddingStore {
        let table = Tensor::new(
            &[[0f32, 0.], [1., 0.], [0., 1.], [2., 2.]],
            &Device::Cpu,
        )
        .unwrap();
        EmbeddingStore::frozen(table).unwrap()
    }

    /// One document, two events: event id 3 with args [1, 2], padding event.
    fn input() -> EventInput {
        let device = Device::Cpu;
        EventInput {
            ids: Tensor::new(&[[3u32, 0]], &device).unwrap(),
            mask: Tensor::new(&[[1f32, 0.]], &device).unwrap(),
            arguments: Tensor::new(&[[[1u32, 2], [0, 0]]], &device).unwrap(),
            argument_mask: Tensor::new(&[[[1f32, 1.], [0., 0.]]], &device).unwrap(),
            argument_lengths: Tensor::new(&[[2f32, 0.]], &device).unwrap(),
            adjacency: Tensor::zeros((1, 2, 2), DType::F32, &device).unwrap(),
        }
    }

    fn encode(strategy: EventStrategy) -> Vec<Vec<f32>> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = EventEncoder::new(strategy, 2, vb).unwrap();
        encoder
            .encode(&store(), &input())
            .unwrap()
            .squeeze(0)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap()
    }

    #[test]
    fn test_plain_is_predicate() {
        assert_eq!(encode(EventStrategy::Plain), vec![vec![2.0, 2.0], vec![0.0, 0.0]]);
    }

    #[test]
    fn test_argument_average() {
        // (p + a1 + a2) / 3 = ([2,2] + [1,0] + [0,1]) / 3
        let out = encode(EventStrategy::ArgumentAverage);
        assert!((out[0][0] - 1.0).abs() < 1e-6);
        assert!((out[0][1] - 1.0).abs() < 1e-6);
        assert_eq!(out[1], vec![0.0, 0.0]);
    }

    #[test]
    fn test_attention_weights_valid_arguments_only() {
        // p·a1 = p·a2 = 2, so attention is uniform over the two arguments
        let out = encode(EventStrategy::ArgumentAttention);
        assert!((out[0][0] - 2.5).abs() < 1e-6);
        assert!((out[0][1] - 2.5).abs() < 1e-6);
        assert_eq!(out[1], vec![0.0, 0.0]);
    }

    #[test]
    fn test_combine_is_bounded_and_masked() {
        let out = encode(EventStrategy::ArgumentCombine);
        assert!(out[0].iter().all(|v| v.abs() < 1.0));
        assert_eq!(out[1], vec![0.0, 0.0]);
    }

    #[test]
    fn test_refine_only_for_graph() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let plain = EventEncoder::new(EventStrategy::Plain, 2, vb.pp("a")).unwrap();
        let nodes = Tensor::ones((1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let adj = Tensor::ones((1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let same = plain.refine(&nodes, &adj).unwrap();
        assert_eq!(same.to_vec3::<f32>().unwrap(), nodes.to_vec3::<f32>().unwrap());

        let graph = EventEncoder::new(EventStrategy::GraphConvolved, 2, vb.pp("b")).unwrap();
        assert_eq!(graph.refine(&nodes, &adj).unwrap().dims(), &[1, 2, 2]);

        let concat = EventEncoder::new(EventStrategy::GraphConcat, 2, vb.pp("c")).unwrap();
        assert_eq!(concat.refine(&nodes, &adj).unwrap().dims(), &[1, 2, 4]);
    }

    #[test]
    fn test_graph_concat_encodes_as_average() {
        assert_eq!(
            encode(EventStrategy::GraphConcat),
            encode(EventStrategy::ArgumentAverage)
        );
    }
}
