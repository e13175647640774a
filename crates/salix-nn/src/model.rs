//! Salience models: one scorer per [`ModelKind`], one shared combiner head.
//!
//! | Kind | Relational signal | Input groups |
//! |------|-------------------|--------------|
//! | `EmbeddingLinear` | stacked linear layers on each node embedding | single-axis |
//! | `Propagation` | K-hop cosine-affinity diffusion of frequency weights | single-axis |
//! | `ProjectedPropagation` | same, after a learned projection | single-axis |
//! | `KernelPooling` | masked kernel pooling over node similarities | single-axis |
//! | `JointKernel` | kernel pooling over entities + composed events | `joint_graph` |
//!
//! The joint kernel scorer is the plain kernel scorer with an injected
//! [`EventEncoder`]; the strategy decides how events are embedded, nothing
//! else changes.

use crate::combiner::ScoreCombiner;
use crate::embedding::{load_table, random_table, EmbeddingStore, EMBEDDING_VAR};
use crate::error::{Error, Result};
use crate::event::{EventEncoder, EventInput, EventStrategy};
use crate::kernel::{masked_cosine, KernelBank, KernelPooling};
use crate::propagation::{propagate, transition_matrix};
use candle_core::{DType, Device, Shape, Tensor, Var};
use candle_nn::{linear_no_bias, Linear, Module, VarBuilder, VarMap};
use ndarray::{Array, Dimension};
use salix_core::{Batch, Field, InputGroup, NormalizerConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Closed set of model kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    EmbeddingLinear,
    Propagation,
    ProjectedPropagation,
    #[default]
    KernelPooling,
    JointKernel,
}

impl ModelKind {
    /// Whether batches of `group` can feed this kind.
    pub fn accepts(self, group: InputGroup) -> bool {
        match self {
            ModelKind::JointKernel => group == InputGroup::JointGraph,
            _ => group != InputGroup::JointGraph,
        }
    }

    pub fn uses_kernels(self) -> bool {
        matches!(self, ModelKind::KernelPooling | ModelKind::JointKernel)
    }
}

/// Numeric backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Cpu,
    /// First CUDA device, falling back to CPU when unavailable.
    Cuda,
}

impl Backend {
    pub fn device(self) -> Result<Device> {
        Ok(match self {
            Backend::Cpu => Device::Cpu,
            Backend::Cuda => Device::cuda_if_available(0)?,
        })
    }
}

/// Model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model kind (default: `kernel_pooling`).
    pub kind: ModelKind,
    /// Event composition for `joint_kernel` (default: `plain`).
    pub event_strategy: EventStrategy,
    /// Entity vocabulary size, including id 0.
    pub entity_vocab_size: usize,
    /// Event vocabulary size; event rows follow the entity rows.
    pub event_vocab_size: usize,
    /// Embedding dimension (default: 50).
    pub embedding_dim: usize,
    /// Pretrained table, `.npy` or `.safetensors`.
    pub pretrained_embedding: Option<PathBuf>,
    /// Keep the embedding table out of the optimizer.
    pub freeze_embedding: bool,
    /// Kernel centres (default: 11-kernel bank).
    pub kernel_mu: Vec<f32>,
    /// Kernel widths, parallel to `kernel_mu`.
    pub kernel_sigma: Vec<f32>,
    /// Diffusion steps for propagation models (default: 1).
    #[serde(alias = "number_of_layers")]
    pub number_of_hops: usize,
    /// Linear layers of the embedding baseline (default: 1).
    pub hidden_layers: usize,
    /// Explicit node feature width; must match the input group (default: 0).
    pub node_feature_dim: usize,
    /// Seed for embedding initialization (default: 42).
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        let bank = KernelBank::default();
        Self {
            kind: ModelKind::KernelPooling,
            event_strategy: EventStrategy::Plain,
            entity_vocab_size: 0,
            event_vocab_size: 0,
            embedding_dim: 50,
            pretrained_embedding: None,
            freeze_embedding: false,
            kernel_mu: bank.mu,
            kernel_sigma: bank.sigma,
            number_of_hops: 1,
            hidden_layers: 1,
            node_feature_dim: 0,
            seed: 42,
        }
    }
}

impl ModelConfig {
    pub fn with_kind(mut self, kind: ModelKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_event_strategy(mut self, strategy: EventStrategy) -> Self {
        self.event_strategy = strategy;
        self
    }

    pub fn with_vocab(mut self, entities: usize, events: usize) -> Self {
        self.entity_vocab_size = entities;
        self.event_vocab_size = events;
        self
    }

    pub fn with_embedding_dim(mut self, dim: usize) -> Self {
        self.embedding_dim = dim;
        self
    }

    pub fn with_pretrained(mut self, path: impl Into<PathBuf>, freeze: bool) -> Self {
        self.pretrained_embedding = Some(path.into());
        self.freeze_embedding = freeze;
        self
    }

    pub fn with_kernels(mut self, mu: Vec<f32>, sigma: Vec<f32>) -> Self {
        self.kernel_mu = mu;
        self.kernel_sigma = sigma;
        self
    }

    pub fn with_hops(mut self, hops: usize) -> Self {
        self.number_of_hops = hops;
        self
    }

    pub fn with_hidden_layers(mut self, layers: usize) -> Self {
        self.hidden_layers = layers;
        self
    }

    pub fn with_node_feature_dim(mut self, dim: usize) -> Self {
        self.node_feature_dim = dim;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Rows of the shared embedding table.
    pub fn total_vocab_size(&self) -> usize {
        self.entity_vocab_size + self.event_vocab_size
    }

    pub fn kernel_bank(&self) -> Result<KernelBank> {
        KernelBank::new(self.kernel_mu.clone(), self.kernel_sigma.clone())
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding_dim == 0 {
            return Err(Error::InvalidConfig("embedding_dim must be positive".into()));
        }
        if self.total_vocab_size() == 0 && self.pretrained_embedding.is_none() {
            return Err(Error::InvalidConfig(
                "entity_vocab_size + event_vocab_size must be positive".into(),
            ));
        }
        if self.kind.uses_kernels() {
            self.kernel_bank()?;
        }
        if self.kind == ModelKind::EmbeddingLinear && self.hidden_layers == 0 {
            return Err(Error::InvalidConfig("hidden_layers must be at least 1".into()));
        }
        Ok(())
    }
}

/// Device tensors for one batch.
#[derive(Debug, Clone)]
pub struct ModelInput {
    /// Primary node ids `(B, N)`, out-of-table ids already mapped to 0.
    pub nodes: Tensor,
    /// `(B, N)`
    pub weights: Tensor,
    /// `(B, N)`
    pub node_mask: Tensor,
    /// Explicit features over the scoring axis `(B, S, F)`.
    pub features: Option<Tensor>,
    /// Event axis, joint-graph batches only.
    pub events: Option<EventInput>,
    /// `(B, S)`
    pub labels: Tensor,
    /// `(B, S)`
    pub score_mask: Tensor,
}

#[derive(Debug, Clone)]
enum Scorer {
    Linear { layers: Vec<Linear> },
    Propagation { projection: Option<Linear>, hops: usize },
    Kernel { pooling: KernelPooling, events: Option<EventEncoder> },
}

/// A built model: embedding store, scorer and combiner head.
pub struct SalienceModel {
    config: ModelConfig,
    group: InputGroup,
    device: Device,
    pub(crate) varmap: VarMap,
    pub(crate) embedding: EmbeddingStore,
    scorer: Scorer,
    combiner: ScoreCombiner,
}

impl SalienceModel {
    /// Builds a model for batches produced under `input`, loading the
    /// pretrained table named in the config if any.
    ///
    /// # Errors
    ///
    /// [`Error::DimensionMismatch`] when the configured feature width, the
    /// event id offset or the pretrained table disagree with the input.
    pub fn new(config: ModelConfig, input: &NormalizerConfig, device: &Device) -> Result<Self> {
        let pretrained = match &config.pretrained_embedding {
            Some(path) => Some(load_table(path, device)?),
            None => None,
        };
        Self::with_pretrained(config, input, pretrained, device)
    }

    /// Like [`SalienceModel::new`] with an in-memory pretrained table.
    pub fn with_pretrained(
        config: ModelConfig,
        input: &NormalizerConfig,
        pretrained: Option<Tensor>,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let group = input.input;
        if !config.kind.accepts(group) {
            return Err(Error::InvalidConfig(format!(
                "{:?} cannot score {:?} batches",
                config.kind, group
            )));
        }
        let feature_dim = input.node_feature_dim();
        if config.node_feature_dim != feature_dim {
            return Err(Error::DimensionMismatch {
                what: "node feature dimension",
                expected: config.node_feature_dim,
                got: feature_dim,
            });
        }
        if group.is_joint() && input.entity_vocab_size != config.entity_vocab_size {
            return Err(Error::DimensionMismatch {
                what: "entity vocabulary offset",
                expected: config.entity_vocab_size,
                got: input.entity_vocab_size,
            });
        }

        let dim = config.embedding_dim;
        if let Some(table) = &pretrained {
            let dims = table.dims();
            if dims.len() != 2 || dims[1] != dim {
                return Err(Error::DimensionMismatch {
                    what: "pretrained embedding dimension",
                    expected: dim,
                    got: dims.last().copied().unwrap_or(0),
                });
            }
        }

        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let vocab = config.total_vocab_size();

        let (embedding, init) = if config.freeze_embedding {
            let table = match pretrained {
                Some(t) => t,
                None => random_table(vocab, dim, config.seed, device)?,
            };
            (EmbeddingStore::frozen(table)?, None)
        } else {
            let store = EmbeddingStore::trainable(vocab, dim, vb.pp("embedding"))?;
            let mut init = random_table(vocab, dim, config.seed, device)?;
            if let Some(table) = pretrained {
                let rows = table.dims()[0];
                if rows > vocab {
                    return Err(Error::DimensionMismatch {
                        what: "pretrained embedding rows",
                        expected: vocab,
                        got: rows,
                    });
                }
                init = if rows == vocab {
                    table
                } else {
                    Tensor::cat(&[&table, &init.narrow(0, rows, vocab - rows)?], 0)?
                };
            }
            (store, Some(init))
        };

        let (scorer, signal_dim) = match config.kind {
            ModelKind::EmbeddingLinear => {
                let layers = (0..config.hidden_layers)
                    .map(|p| {
                        let out = if p + 1 < config.hidden_layers { dim } else { 1 };
                        linear_no_bias(dim, out, vb.pp(format!("scorer.layer{p}")))
                    })
                    .collect::<candle_core::Result<Vec<_>>>()?;
                (Scorer::Linear { layers }, 1)
            }
            ModelKind::Propagation | ModelKind::ProjectedPropagation => {
                let projection = if config.kind == ModelKind::ProjectedPropagation {
                    Some(linear_no_bias(dim, dim, vb.pp("scorer.projection"))?)
                } else {
                    None
                };
                let scorer = Scorer::Propagation {
                    projection,
                    hops: config.number_of_hops,
                };
                (scorer, 1)
            }
            ModelKind::KernelPooling | ModelKind::JointKernel => {
                let pooling = KernelPooling::new(&config.kernel_bank()?, device)?;
                let events = if config.kind == ModelKind::JointKernel {
                    Some(EventEncoder::new(config.event_strategy, dim, vb.pp("event"))?)
                } else {
                    None
                };
                let size = pooling.size();
                (Scorer::Kernel { pooling, events }, size)
            }
        };
        let combiner = ScoreCombiner::new(signal_dim, feature_dim, vb.pp("combiner"))?;

        if let Some(init) = init {
            varmap.set_one(EMBEDDING_VAR, &init)?;
        }

        Ok(Self {
            config,
            group,
            device: device.clone(),
            varmap,
            embedding,
            scorer,
            combiner,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn group(&self) -> InputGroup {
        self.group
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn embedding(&self) -> &EmbeddingStore {
        &self.embedding
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Variables the optimizer updates.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Moves a host batch to device tensors.
    pub fn prepare(&self, batch: &Batch) -> Result<ModelInput> {
        if batch.group() != self.group {
            return Err(Error::InvalidConfig(format!(
                "batch assembled for {:?}, model expects {:?}",
                batch.group(),
                self.group
            )));
        }
        let device = &self.device;
        let features = if self.config.node_feature_dim > 0 {
            Some(host_tensor(batch.floats3(Field::Features)?, device)?)
        } else {
            None
        };
        let events = if self.group == InputGroup::JointGraph {
            let lengths = batch.ints(Field::ArgumentLengths)?.mapv(|n| n as f32);
            Some(EventInput {
                ids: self.embedding.ids_tensor(batch.ints(Field::Events)?, device)?,
                mask: host_tensor(batch.mask(Field::Events)?, device)?,
                arguments: self.embedding.ids_tensor(batch.ints3(Field::Arguments)?, device)?,
                argument_mask: host_tensor(batch.argument_mask()?, device)?,
                argument_lengths: host_tensor(&lengths, device)?,
                adjacency: host_tensor(batch.floats3(Field::Adjacency)?, device)?,
            })
        } else {
            None
        };
        Ok(ModelInput {
            nodes: self.embedding.ids_tensor(batch.ints(Field::Nodes)?, device)?,
            weights: host_tensor(batch.floats(Field::Weights)?, device)?,
            node_mask: host_tensor(batch.mask(Field::Nodes)?, device)?,
            features,
            events,
            labels: host_tensor(batch.floats(Field::Labels)?, device)?,
            score_mask: host_tensor(batch.mask(Field::Labels)?, device)?,
        })
    }

    /// Scores `(B, S)` over the scoring axis, zero on padding.
    pub fn forward(&self, input: &ModelInput) -> Result<Tensor> {
        if let Some(features) = &input.features {
            let got = features.dim(2)?;
            if got != self.config.node_feature_dim {
                return Err(Error::DimensionMismatch {
                    what: "node features",
                    expected: self.config.node_feature_dim,
                    got,
                });
            }
        }

        let signals = match &self.scorer {
            Scorer::Linear { layers } => {
                let mut h = self.embedding.lookup(&input.nodes)?;
                for layer in layers {
                    h = layer.forward(&h)?;
                }
                h
            }
            Scorer::Propagation { projection, hops } => {
                let mut emb = self.embedding.lookup(&input.nodes)?;
                if let Some(projection) = projection {
                    emb = projection.forward(&emb)?;
                }
                let transition = transition_matrix(&emb, &input.node_mask)?;
                let initial = input.weights.mul(&input.node_mask)?;
                propagate(&transition, &initial, *hops)?.unsqueeze(2)?
            }
            Scorer::Kernel { pooling, events } => {
                let entities = self.embedding.lookup(&input.nodes)?;
                let (nodes, mask) = match (events, &input.events) {
                    (Some(encoder), Some(ev)) => {
                        let encoded = encoder.encode(&self.embedding, ev)?;
                        let all = Tensor::cat(&[&entities, &encoded], 1)?;
                        let mask = Tensor::cat(&[&input.node_mask, &ev.mask], 1)?;
                        (encoder.refine(&all, &ev.adjacency)?, mask)
                    }
                    (Some(_), None) => {
                        return Err(Error::InvalidConfig(
                            "joint kernel model needs event inputs".into(),
                        ))
                    }
                    (None, _) => (entities, input.node_mask.clone()),
                };
                let sim = masked_cosine(&nodes, &mask)?;
                pooling.forward(&sim, &mask)?
            }
        };
        Ok(self
            .combiner
            .forward(&signals, input.features.as_ref(), &input.score_mask)?)
    }

    /// `prepare` then `forward`.
    pub fn score(&self, batch: &Batch) -> Result<Tensor> {
        self.forward(&self.prepare(batch)?)
    }
}

fn host_tensor<D: Dimension>(array: &Array<f32, D>, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = array.iter().copied().collect();
    Ok(Tensor::from_vec(data, Shape::from(array.shape().to_vec()), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use salix_core::{BatchAssembler, RecordNormalizer};
    use serde_json::json;

    fn entity_input() -> NormalizerConfig {
        NormalizerConfig::default()
    }

    fn batch(input: &NormalizerConfig, lines: &[serde_json::Value]) -> Batch {
        let normalizer = RecordNormalizer::new(input.clone()).unwrap();
        let docs: Vec<_> = lines
            .iter()
            .filter_map(|l| normalizer.normalize_value(l).document())
            .collect();
        BatchAssembler::from_config(input).assemble(&docs).unwrap()
    }

    fn small(kind: ModelKind) -> ModelConfig {
        ModelConfig::default()
            .with_kind(kind)
            .with_vocab(20, 0)
            .with_embedding_dim(8)
    }

    #[test]
    fn test_every_single_axis_kind_scores() {
        let input = entity_input();
        let b = batch(
            &input,
            &[
                json!({"docno": "a", "spot": {"bodyText": [1, 2, 2, 3]}}),
                json!({"docno": "b", "spot": {"bodyText": [4]}}),
            ],
        );
        for kind in [
            ModelKind::EmbeddingLinear,
            ModelKind::Propagation,
            ModelKind::ProjectedPropagation,
            ModelKind::KernelPooling,
        ] {
            let model = SalienceModel::new(small(kind), &input, &Device::Cpu).unwrap();
            let scores = model.score(&b).unwrap();
            assert_eq!(scores.dims(), &[2, 3], "{kind:?}");
            let rows = scores.to_vec2::<f32>().unwrap();
            assert_eq!(&rows[1][1..], &[0.0, 0.0], "{kind:?}");
        }
    }

    #[test]
    fn test_kind_must_accept_group() {
        let graph = NormalizerConfig::default()
            .with_input(InputGroup::JointGraph)
            .with_entity_vocab_size(20);
        let err = SalienceModel::new(small(ModelKind::KernelPooling), &graph, &Device::Cpu);
        assert!(matches!(err, Err(Error::InvalidConfig(_))));

        let err = SalienceModel::new(small(ModelKind::JointKernel), &entity_input(), &Device::Cpu);
        assert!(matches!(err, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_feature_dimension_mismatch_fails_fast() {
        let input = NormalizerConfig::default()
            .with_input(InputGroup::EntityFeature)
            .with_entity_feature_dim(4);
        let config = small(ModelKind::KernelPooling).with_node_feature_dim(3);
        let err = SalienceModel::new(config, &input, &Device::Cpu);
        assert!(matches!(
            err,
            Err(Error::DimensionMismatch { expected: 3, got: 4, .. })
        ));
    }

    #[test]
    fn test_event_offset_must_match() {
        let input = NormalizerConfig::default()
            .with_input(InputGroup::JointGraph)
            .with_entity_vocab_size(10);
        let config = small(ModelKind::JointKernel).with_vocab(20, 5);
        assert!(matches!(
            SalienceModel::new(config, &input, &Device::Cpu),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_joint_kernel_scores_both_axes() {
        let input = NormalizerConfig::default()
            .with_input(InputGroup::JointGraph)
            .with_entity_vocab_size(20);
        let b = batch(
            &input,
            &[json!({
                "docno": "a",
                "spot": {"bodyText": [1, 2, 3]},
                "event": {"bodyText": {"sparse_features": {"LexicalHead": [1, 2]}, "salience": [1, 0]}},
                "adjacent": [[1, 2], [3]]
            })],
        );
        for strategy in [
            EventStrategy::Plain,
            EventStrategy::ArgumentAverage,
            EventStrategy::ArgumentCombine,
            EventStrategy::ArgumentAttention,
            EventStrategy::GraphConvolved,
            EventStrategy::GraphConcat,
        ] {
            let config = small(ModelKind::JointKernel)
                .with_vocab(20, 5)
                .with_event_strategy(strategy);
            let model = SalienceModel::new(config, &input, &Device::Cpu).unwrap();
            let scores = model.score(&b).unwrap();
            assert_eq!(scores.dims(), &[1, 5], "{strategy:?}");
        }
    }

    #[test]
    fn test_frozen_embedding_is_not_trainable() {
        let input = entity_input();
        let table = Tensor::ones((20, 8), DType::F32, &Device::Cpu).unwrap();
        let mut config = small(ModelKind::Propagation);
        config.freeze_embedding = true;
        let model = SalienceModel::with_pretrained(config, &input, Some(table), &Device::Cpu).unwrap();
        assert!(model.embedding().is_frozen());
        assert!(!model.varmap().data().lock().unwrap().contains_key(EMBEDDING_VAR));
        // the combiner head is still trainable
        assert!(!model.trainable_vars().is_empty());
    }

    #[test]
    fn test_pretrained_rows_are_copied() {
        let input = entity_input();
        let table = Tensor::ones((4, 8), DType::F32, &Device::Cpu).unwrap();
        let model = SalienceModel::with_pretrained(
            small(ModelKind::KernelPooling),
            &input,
            Some(table),
            &Device::Cpu,
        )
        .unwrap();
        let rows = model.embedding().table().to_vec2::<f32>().unwrap();
        assert_eq!(rows.len(), 20);
        assert_eq!(rows[3], vec![1.0; 8]);
        assert_ne!(rows[4], vec![1.0; 8]);

        let wide = Tensor::ones((4, 9), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            SalienceModel::with_pretrained(small(ModelKind::KernelPooling), &input, Some(wide), &Device::Cpu),
            Err(Error::DimensionMismatch { .. })
        ));
    }
}
