//! Ragged batch assembly.
//!
//! [`BatchAssembler`] pads a list of [`NormalizedDocument`]s into rectangular
//! `ndarray` buffers. Every ragged axis gets a parallel `0/1` mask built from
//! the recorded pre-padding lengths.
//!
//! # Coordinates
//!
//! Arrays that describe *scored* nodes ([`Field::Labels`], [`Field::Features`],
//! [`Field::Adjacency`]) use the scoring axis: the primary node axis padded to
//! its batch maximum `N`, followed (for [`InputGroup::JointGraph`] only) by
//! the event axis padded to `V`. Model outputs use the same layout.
//!
//! ```text
//! scoring axis:  [ n0 n1 .. n(N-1) | e0 e1 .. e(V-1) ]
//!                  primary nodes      events (JointGraph)
//! ```
//!
//! Every padded axis is at least one slot wide, so downstream tensors never
//! carry a zero-length dimension.

use crate::error::{Error, Result};
use crate::normalize::{InputGroup, NormalizerConfig};
use crate::record::{Label, NodeRecord, NormalizedDocument};
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Named arrays a batch can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// Primary node ids `(B, N)`.
    Nodes,
    /// Primary node frequency weights `(B, N)`.
    Weights,
    /// Event ids on their own axis `(B, V)`.
    Events,
    /// Event frequency weights `(B, V)`.
    EventWeights,
    /// Argument entity ids per event `(B, V, A)`.
    Arguments,
    /// True argument count per event `(B, V)`.
    ArgumentLengths,
    /// Normalized adjacency over the scoring axis `(B, S, S)`.
    Adjacency,
    /// Explicit feature rows over the scoring axis `(B, S, F)`.
    Features,
    /// `+1/-1` labels over the scoring axis, `0` for padding `(B, S)`.
    Labels,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Nodes => "nodes",
            Field::Weights => "weights",
            Field::Events => "events",
            Field::EventWeights => "event_weights",
            Field::Arguments => "arguments",
            Field::ArgumentLengths => "argument_lengths",
            Field::Adjacency => "adjacency",
            Field::Features => "features",
            Field::Labels => "labels",
        };
        f.write_str(name)
    }
}

/// Element type of a padded array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    Int,
    Float,
}

/// Declared shape of one target array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArraySpec {
    pub field: Field,
    pub rank: usize,
    pub dtype: DType,
}

impl ArraySpec {
    const fn new(field: Field, rank: usize, dtype: DType) -> Self {
        Self { field, rank, dtype }
    }

    /// True when `array` has the declared rank and element type.
    pub fn matches(&self, array: &PaddedArray) -> bool {
        array.rank() == self.rank && array.dtype() == self.dtype
    }
}

/// A padded host buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum PaddedArray {
    Int2(Array2<u32>),
    Float2(Array2<f32>),
    Int3(Array3<u32>),
    Float3(Array3<f32>),
}

impl PaddedArray {
    pub fn shape(&self) -> &[usize] {
        match self {
            PaddedArray::Int2(a) => a.shape(),
            PaddedArray::Float2(a) => a.shape(),
            PaddedArray::Int3(a) => a.shape(),
            PaddedArray::Float3(a) => a.shape(),
        }
    }

    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    pub fn dtype(&self) -> DType {
        match self {
            PaddedArray::Int2(_) | PaddedArray::Int3(_) => DType::Int,
            PaddedArray::Float2(_) | PaddedArray::Float3(_) => DType::Float,
        }
    }
}

impl InputGroup {
    /// Arrays this group assembles. `Features` is included when
    /// `feature_dim > 0`.
    pub fn target_arrays(self, feature_dim: usize) -> Vec<ArraySpec> {
        let mut specs = vec![
            ArraySpec::new(Field::Nodes, 2, DType::Int),
            ArraySpec::new(Field::Weights, 2, DType::Float),
        ];
        if self == InputGroup::JointGraph {
            specs.extend([
                ArraySpec::new(Field::Events, 2, DType::Int),
                ArraySpec::new(Field::EventWeights, 2, DType::Float),
                ArraySpec::new(Field::Arguments, 3, DType::Int),
                ArraySpec::new(Field::ArgumentLengths, 2, DType::Int),
                ArraySpec::new(Field::Adjacency, 3, DType::Float),
            ]);
        }
        if feature_dim > 0 {
            specs.push(ArraySpec::new(Field::Features, 3, DType::Float));
        }
        specs.push(ArraySpec::new(Field::Labels, 2, DType::Float));
        specs
    }

    /// Axes that carry a validity mask.
    pub fn masked_axes(self) -> Vec<Field> {
        match self {
            InputGroup::JointGraph => {
                vec![Field::Nodes, Field::Events, Field::Arguments, Field::Labels]
            }
            _ => vec![Field::Nodes, Field::Labels],
        }
    }
}

/// Padded arrays, masks and lengths for one mini-batch.
#[derive(Debug, Clone)]
pub struct Batch {
    group: InputGroup,
    size: usize,
    arrays: BTreeMap<Field, PaddedArray>,
    masks: BTreeMap<Field, PaddedArray>,
    lengths: BTreeMap<Field, Vec<usize>>,
}

impl Batch {
    pub fn group(&self) -> InputGroup {
        self.group
    }

    /// Number of documents.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn has(&self, field: Field) -> bool {
        self.arrays.contains_key(&field)
    }

    pub fn get(&self, field: Field) -> Result<&PaddedArray> {
        self.arrays.get(&field).ok_or(Error::MissingArray(field))
    }

    pub fn ints(&self, field: Field) -> Result<&Array2<u32>> {
        match self.get(field)? {
            PaddedArray::Int2(a) => Ok(a),
            _ => Err(Error::ArrayType {
                field,
                expected: "a rank-2 int array",
            }),
        }
    }

    pub fn floats(&self, field: Field) -> Result<&Array2<f32>> {
        match self.get(field)? {
            PaddedArray::Float2(a) => Ok(a),
            _ => Err(Error::ArrayType {
                field,
                expected: "a rank-2 float array",
            }),
        }
    }

    pub fn ints3(&self, field: Field) -> Result<&Array3<u32>> {
        match self.get(field)? {
            PaddedArray::Int3(a) => Ok(a),
            _ => Err(Error::ArrayType {
                field,
                expected: "a rank-3 int array",
            }),
        }
    }

    pub fn floats3(&self, field: Field) -> Result<&Array3<f32>> {
        match self.get(field)? {
            PaddedArray::Float3(a) => Ok(a),
            _ => Err(Error::ArrayType {
                field,
                expected: "a rank-3 float array",
            }),
        }
    }

    /// Validity mask of a rank-2 axis (`Nodes`, `Events` or `Labels`).
    pub fn mask(&self, axis: Field) -> Result<&Array2<f32>> {
        match self.masks.get(&axis) {
            Some(PaddedArray::Float2(m)) => Ok(m),
            Some(_) => Err(Error::ArrayType {
                field: axis,
                expected: "a rank-2 mask",
            }),
            None => Err(Error::MissingArray(axis)),
        }
    }

    /// Per-event argument mask `(B, V, A)`.
    pub fn argument_mask(&self) -> Result<&Array3<f32>> {
        match self.masks.get(&Field::Arguments) {
            Some(PaddedArray::Float3(m)) => Ok(m),
            Some(_) => Err(Error::ArrayType {
                field: Field::Arguments,
                expected: "a rank-3 mask",
            }),
            None => Err(Error::MissingArray(Field::Arguments)),
        }
    }

    /// True pre-padding lengths of a masked axis.
    pub fn lengths(&self, axis: Field) -> Result<&[usize]> {
        self.lengths
            .get(&axis)
            .map(Vec::as_slice)
            .ok_or(Error::MissingArray(axis))
    }

    /// Width of the scoring axis.
    pub fn scored_width(&self) -> usize {
        self.masks
            .get(&Field::Labels)
            .map_or(0, |m| m.shape()[1])
    }
}

/// Pads normalized documents into a [`Batch`].
#[derive(Debug, Clone)]
pub struct BatchAssembler {
    group: InputGroup,
    feature_dim: usize,
}

impl BatchAssembler {
    pub fn new(group: InputGroup, feature_dim: usize) -> Self {
        Self { group, feature_dim }
    }

    pub fn from_config(config: &NormalizerConfig) -> Self {
        Self::new(config.input, config.node_feature_dim())
    }

    pub fn group(&self) -> InputGroup {
        self.group
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn specs(&self) -> Vec<ArraySpec> {
        self.group.target_arrays(self.feature_dim)
    }

    /// Assembles one batch.
    ///
    /// # Errors
    ///
    /// [`Error::EmptyBatch`] when `docs` is empty or every document is empty;
    /// callers treat it as a no-op.
    pub fn assemble(&self, docs: &[NormalizedDocument]) -> Result<Batch> {
        if docs.iter().all(NormalizedDocument::is_empty) {
            return Err(Error::EmptyBatch);
        }
        let b = docs.len();
        let graph = self.group == InputGroup::JointGraph;

        let primary: Vec<Vec<&NodeRecord>> = docs.iter().map(|d| self.primary(d)).collect();
        let n = primary.iter().map(Vec::len).max().unwrap_or(0).max(1);
        let v = if graph {
            docs.iter().map(|d| d.events.len()).max().unwrap_or(0).max(1)
        } else {
            0
        };
        let s = n + v;

        let mut arrays = BTreeMap::new();
        let mut masks = BTreeMap::new();
        let mut lengths = BTreeMap::new();

        let mut ids = Array2::<u32>::zeros((b, n));
        let mut weights = Array2::<f32>::zeros((b, n));
        let mut node_mask = Array2::<f32>::zeros((b, n));
        let mut labels = Array2::<f32>::from_elem((b, s), Label::PAD);
        let mut label_mask = Array2::<f32>::zeros((b, s));
        for (i, nodes) in primary.iter().enumerate() {
            for (j, node) in nodes.iter().enumerate() {
                ids[[i, j]] = node.id;
                weights[[i, j]] = node.weight;
                node_mask[[i, j]] = 1.0;
                labels[[i, j]] = node.label.sign();
                label_mask[[i, j]] = 1.0;
            }
        }
        lengths.insert(Field::Nodes, primary.iter().map(Vec::len).collect());

        if graph {
            let a = docs
                .iter()
                .flat_map(|d| d.events.iter().map(|e| e.arguments.len()))
                .max()
                .unwrap_or(0)
                .max(1);
            let mut events = Array2::<u32>::zeros((b, v));
            let mut event_weights = Array2::<f32>::zeros((b, v));
            let mut event_mask = Array2::<f32>::zeros((b, v));
            let mut args = Array3::<u32>::zeros((b, v, a));
            let mut arg_lengths = Array2::<u32>::zeros((b, v));
            let mut arg_mask = Array3::<f32>::zeros((b, v, a));
            for (i, doc) in docs.iter().enumerate() {
                for (k, event) in doc.events.iter().enumerate() {
                    events[[i, k]] = event.node.id;
                    event_weights[[i, k]] = event.node.weight;
                    event_mask[[i, k]] = 1.0;
                    labels[[i, n + k]] = event.node.label.sign();
                    label_mask[[i, n + k]] = 1.0;
                    arg_lengths[[i, k]] = event.arguments.len() as u32;
                    for (x, &arg) in event.arguments.iter().enumerate() {
                        args[[i, k, x]] = arg;
                        arg_mask[[i, k, x]] = 1.0;
                    }
                }
            }
            arrays.insert(Field::Events, PaddedArray::Int2(events));
            arrays.insert(Field::EventWeights, PaddedArray::Float2(event_weights));
            arrays.insert(Field::Arguments, PaddedArray::Int3(args));
            arrays.insert(Field::ArgumentLengths, PaddedArray::Int2(arg_lengths));
            arrays.insert(
                Field::Adjacency,
                PaddedArray::Float3(normalized_adjacency(docs, n, v)),
            );
            masks.insert(Field::Events, PaddedArray::Float2(event_mask));
            masks.insert(Field::Arguments, PaddedArray::Float3(arg_mask));
            lengths.insert(Field::Events, docs.iter().map(|d| d.events.len()).collect());
        }

        if self.feature_dim > 0 {
            let f = docs
                .iter()
                .flat_map(|d| d.nodes().map(|node| node.features.len()))
                .max()
                .unwrap_or(0)
                .max(self.feature_dim);
            let mut features = Array3::<f32>::zeros((b, s, f));
            for (i, doc) in docs.iter().enumerate() {
                let events = doc
                    .events
                    .iter()
                    .enumerate()
                    .filter(|_| graph)
                    .map(|(k, e)| (n + k, &e.node));
                let rows = primary[i].iter().copied().enumerate().chain(events);
                for (j, node) in rows {
                    for (x, &value) in node.features.iter().enumerate() {
                        features[[i, j, x]] = value;
                    }
                }
            }
            arrays.insert(Field::Features, PaddedArray::Float3(features));
        }

        arrays.insert(Field::Nodes, PaddedArray::Int2(ids));
        arrays.insert(Field::Weights, PaddedArray::Float2(weights));
        arrays.insert(Field::Labels, PaddedArray::Float2(labels));
        masks.insert(Field::Nodes, PaddedArray::Float2(node_mask));
        masks.insert(Field::Labels, PaddedArray::Float2(label_mask));
        lengths.insert(
            Field::Labels,
            docs.iter()
                .zip(&primary)
                .map(|(d, p)| p.len() + if graph { d.events.len() } else { 0 })
                .collect(),
        );

        for spec in self.specs() {
            let array = arrays.get(&spec.field).ok_or(Error::MissingArray(spec.field))?;
            if !spec.matches(array) {
                return Err(Error::ArrayType {
                    field: spec.field,
                    expected: "the declared rank and element type",
                });
            }
        }

        Ok(Batch {
            group: self.group,
            size: b,
            arrays,
            masks,
            lengths,
        })
    }

    /// Nodes on the primary axis for this group.
    fn primary<'a>(&self, doc: &'a NormalizedDocument) -> Vec<&'a NodeRecord> {
        match self.group {
            InputGroup::EntityRaw | InputGroup::EntityFeature | InputGroup::JointGraph => {
                doc.entities.iter().collect()
            }
            InputGroup::EventRaw | InputGroup::EventFeature => {
                doc.events.iter().map(|e| &e.node).collect()
            }
            InputGroup::Joint => doc.nodes().collect(),
        }
    }
}

/// Symmetric normalized adjacency `D^-1/2 (A + I) D^-1/2` over the scoring axis.
///
/// Edges link each event (at `n + k`) with the kept entities named among its
/// arguments. Only real nodes receive a self-loop, so padding rows stay zero.
fn normalized_adjacency(docs: &[NormalizedDocument], n: usize, v: usize) -> Array3<f32> {
    let s = n + v;
    let mut adj = Array3::<f32>::zeros((docs.len(), s, s));
    for (i, doc) in docs.iter().enumerate() {
        let position: HashMap<u32, usize> = doc
            .entities
            .iter()
            .enumerate()
            .map(|(j, e)| (e.id, j))
            .collect();
        for j in 0..doc.entities.len() {
            adj[[i, j, j]] = 1.0;
        }
        for (k, event) in doc.events.iter().enumerate() {
            let ev = n + k;
            adj[[i, ev, ev]] = 1.0;
            for arg in &event.arguments {
                if let Some(&j) = position.get(arg) {
                    adj[[i, ev, j]] = 1.0;
                    adj[[i, j, ev]] = 1.0;
                }
            }
        }
        let degree: Vec<f32> = (0..s)
            .map(|r| (0..s).map(|c| adj[[i, r, c]]).sum())
            .collect();
        for r in 0..s {
            for c in 0..s {
                if adj[[i, r, c]] != 0.0 {
                    adj[[i, r, c]] /= (degree[r] * degree[c]).sqrt();
                }
            }
        }
    }
    adj
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DocKey, EventRecord};

    fn doc(entities: &[(u32, f32, Label)]) -> NormalizedDocument {
        let mut d = NormalizedDocument::new(DocKey::Docno("d".into()));
        d.entities = entities
            .iter()
            .map(|&(id, w, label)| NodeRecord::new(id, w, label))
            .collect();
        d
    }

    #[test]
    fn test_pads_to_batch_max() {
        let docs = vec![
            doc(&[(1, 0.5, Label::Salient), (2, 0.5, Label::NotSalient)]),
            doc(&[(3, 1.0, Label::NotSalient)]),
        ];
        let batch = BatchAssembler::new(InputGroup::EntityRaw, 0)
            .assemble(&docs)
            .unwrap();

        let ids = batch.ints(Field::Nodes).unwrap();
        assert_eq!(ids.shape(), &[2, 2]);
        assert_eq!(ids[[1, 0]], 3);
        assert_eq!(ids[[1, 1]], 0);
        let mask = batch.mask(Field::Nodes).unwrap();
        assert_eq!(mask.row(0).sum(), 2.0);
        assert_eq!(mask.row(1).sum(), 1.0);
        let labels = batch.floats(Field::Labels).unwrap();
        assert_eq!(labels.row(0).to_vec(), vec![1.0, -1.0]);
        assert_eq!(labels.row(1).to_vec(), vec![-1.0, 0.0]);
        assert_eq!(batch.lengths(Field::Nodes).unwrap(), &[2, 1]);
        assert!(!batch.has(Field::Features));
        assert!(matches!(
            batch.ints(Field::Events),
            Err(Error::MissingArray(Field::Events))
        ));
    }

    #[test]
    fn test_masks_ignore_real_zero_values() {
        let mut d = doc(&[(1, 1.0, Label::Salient)]);
        d.entities[0].features = vec![0.0, 0.0];
        let batch = BatchAssembler::new(InputGroup::EntityFeature, 2)
            .assemble(&[d])
            .unwrap();
        let features = batch.floats3(Field::Features).unwrap();
        assert_eq!(features.shape(), &[1, 1, 2]);
        assert_eq!(batch.mask(Field::Nodes).unwrap()[[0, 0]], 1.0);
    }

    #[test]
    fn test_empty_batch() {
        let assembler = BatchAssembler::new(InputGroup::EntityRaw, 0);
        assert!(matches!(assembler.assemble(&[]), Err(Error::EmptyBatch)));
        assert!(matches!(
            assembler.assemble(&[doc(&[])]),
            Err(Error::EmptyBatch)
        ));
    }

    #[test]
    fn test_joint_graph_layout() {
        let mut d1 = doc(&[(1, 0.5, Label::Salient), (2, 0.5, Label::NotSalient)]);
        d1.events.push(EventRecord {
            node: NodeRecord::new(105, 1.0, Label::Salient),
            arguments: vec![2, 9],
        });
        let d2 = doc(&[(4, 1.0, Label::NotSalient)]);
        let batch = BatchAssembler::new(InputGroup::JointGraph, 0)
            .assemble(&[d1, d2])
            .unwrap();

        assert_eq!(batch.scored_width(), 3);
        assert_eq!(batch.ints3(Field::Arguments).unwrap().shape(), &[2, 1, 2]);
        assert_eq!(batch.ints(Field::ArgumentLengths).unwrap()[[0, 0]], 2);
        assert_eq!(batch.argument_mask().unwrap()[[0, 0, 1]], 1.0);
        assert_eq!(batch.mask(Field::Events).unwrap().row(1).sum(), 0.0);
        assert_eq!(batch.floats(Field::Labels).unwrap()[[0, 2]], 1.0);
        assert_eq!(batch.mask(Field::Labels).unwrap().row(1).to_vec(), vec![1.0, 0.0, 0.0]);

        let adj = batch.floats3(Field::Adjacency).unwrap();
        // entity 2 (position 1) and the event (position 2) each have degree 2.
        assert!((adj[[0, 1, 2]] - 0.5).abs() < 1e-6);
        assert!((adj[[0, 2, 1]] - 0.5).abs() < 1e-6);
        assert!((adj[[0, 0, 0]] - 1.0).abs() < 1e-6);
        assert_eq!(adj[[0, 0, 2]], 0.0);
        // padding rows stay zero
        assert_eq!(adj[[1, 1, 1]], 0.0);
        assert_eq!(adj[[1, 2, 2]], 0.0);
    }

    #[test]
    fn test_joint_merges_events_on_node_axis() {
        let mut d = doc(&[(1, 1.0, Label::NotSalient)]);
        d.events.push(EventRecord {
            node: NodeRecord::new(51, 1.0, Label::Salient),
            arguments: vec![],
        });
        let batch = BatchAssembler::new(InputGroup::Joint, 0).assemble(&[d]).unwrap();
        assert_eq!(batch.ints(Field::Nodes).unwrap().row(0).to_vec(), vec![1, 51]);
        assert_eq!(batch.floats(Field::Labels).unwrap().row(0).to_vec(), vec![-1.0, 1.0]);
    }

    #[test]
    fn test_specs_per_group() {
        let fields = |g: InputGroup, f| -> Vec<Field> {
            g.target_arrays(f).iter().map(|s| s.field).collect()
        };
        assert_eq!(
            fields(InputGroup::EntityRaw, 0),
            vec![Field::Nodes, Field::Weights, Field::Labels]
        );
        assert!(fields(InputGroup::EntityFeature, 4).contains(&Field::Features));
        assert!(fields(InputGroup::JointGraph, 0).contains(&Field::Adjacency));
        let spec = InputGroup::JointGraph
            .target_arrays(0)
            .into_iter()
            .find(|s| s.field == Field::Arguments)
            .unwrap();
        assert_eq!((spec.rank, spec.dtype), (3, DType::Int));
    }

    #[test]
    fn test_assembled_arrays_match_declared_specs() {
        let mut d = doc(&[(1, 1.0, Label::Salient)]);
        d.entities[0].features = vec![0.5];
        d.events.push(EventRecord {
            node: NodeRecord::new(12, 1.0, Label::NotSalient),
            arguments: vec![1],
        });
        let assembler = BatchAssembler::new(InputGroup::JointGraph, 1);
        let batch = assembler.assemble(&[d]).unwrap();
        for spec in assembler.specs() {
            let array = batch.get(spec.field).unwrap();
            assert!(spec.matches(array), "{}", spec.field);
            assert_eq!(array.rank(), spec.rank);
        }
        let nodes = batch.get(Field::Nodes).unwrap();
        assert_eq!(nodes.dtype(), DType::Int);
        assert!(!ArraySpec::new(Field::Nodes, 3, DType::Int).matches(nodes));
        assert!(!ArraySpec::new(Field::Nodes, 2, DType::Float).matches(nodes));
    }
}
