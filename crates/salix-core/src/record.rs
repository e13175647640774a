//! Canonical per-document records produced by the normalizer.

use serde::{Deserialize, Serialize};

/// Binary salience judgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    /// Central to the document's topic (`+1`).
    Salient,
    /// Mentioned but not central (`-1`).
    NotSalient,
}

impl Label {
    /// Value written into padded label arrays for padding slots.
    pub const PAD: f32 = 0.0;

    /// Reads a gold annotation value: exactly `1` is salient, anything else is not.
    pub fn from_gold(value: f64) -> Self {
        if value == 1.0 {
            Label::Salient
        } else {
            Label::NotSalient
        }
    }

    /// `+1.0` or `-1.0`.
    pub fn sign(self) -> f32 {
        match self {
            Label::Salient => 1.0,
            Label::NotSalient => -1.0,
        }
    }

    pub fn is_salient(self) -> bool {
        self == Label::Salient
    }
}

/// Half-open mention span `[start, end)` in the source field.
pub type Span = [u32; 2];

/// One kept entity or event node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Vocabulary id, never 0. Event ids in joint groups already carry the
    /// entity-vocabulary offset.
    pub id: u32,
    /// Frequency weight, normalized over the node's axis.
    pub weight: f32,
    /// Explicit feature row (empty when the input group has no features).
    pub features: Vec<f32>,
    pub label: Label,
    /// Mention spans, capped per node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spans: Vec<Span>,
}

impl NodeRecord {
    pub fn new(id: u32, weight: f32, label: Label) -> Self {
        Self {
            id,
            weight,
            features: Vec::new(),
            label,
            spans: Vec::new(),
        }
    }

    pub fn with_features(mut self, features: Vec<f32>) -> Self {
        self.features = features;
        self
    }
}

/// An event node together with its argument entity ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub node: NodeRecord,
    /// Argument entity ids (ragged, capped, never 0).
    pub arguments: Vec<u32>,
}

impl EventRecord {
    pub fn argument_count(&self) -> usize {
        self.arguments.len()
    }
}

/// Which key identified the document in its source line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocKey {
    Docno(String),
    Qid(String),
}

impl DocKey {
    /// JSON field name the key was read from.
    pub fn field_name(&self) -> &'static str {
        match self {
            DocKey::Docno(_) => "docno",
            DocKey::Qid(_) => "qid",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            DocKey::Docno(v) | DocKey::Qid(v) => v,
        }
    }
}

/// A document after normalization: ordered entity and event records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedDocument {
    pub key: DocKey,
    pub entities: Vec<NodeRecord>,
    pub events: Vec<EventRecord>,
}

impl NormalizedDocument {
    pub fn new(key: DocKey) -> Self {
        Self {
            key,
            entities: Vec::new(),
            events: Vec::new(),
        }
    }

    /// True when neither axis kept a node.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.events.is_empty()
    }

    /// Nodes in scoring order: entities first, then events.
    ///
    /// Model outputs are laid out in the same order, with each axis padded
    /// to its batch maximum.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.entities
            .iter()
            .chain(self.events.iter().map(|e| &e.node))
    }

    pub fn node_count(&self) -> usize {
        self.entities.len() + self.events.len()
    }
}
