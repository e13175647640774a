//! Record normalization: one raw JSON line into canonical parallel arrays.
//!
//! The normalizer never fails on a bad document. Anything confined to a
//! single record (invalid JSON, missing spot object, parallel arrays of
//! unequal length, a feature row of the wrong width) comes back as
//! [`Normalized::Skipped`] and the caller moves on. Only configuration
//! problems are errors, and those surface from [`RecordNormalizer::new`].
//!
//! # Selection
//!
//! Entities and events are capped per document by frequency. The sort is
//! stable, so equal frequencies keep their original array order (or first
//! occurrence order for raw id lists). Kept nodes are emitted in selection
//! order, most frequent first.

use crate::error::{Error, Result};
use crate::record::{DocKey, EventRecord, Label, NodeRecord, NormalizedDocument, Span};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Name of the sparse event feature holding the predicate (lexical head) id.
pub const LEXICAL_HEAD: &str = "LexicalHead";

/// Which arrays a model consumes, and therefore what the normalizer reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputGroup {
    /// Entity ids and frequency weights.
    #[default]
    EntityRaw,
    /// Entity ids, weights and explicit entity features.
    EntityFeature,
    /// Event (lexical head) ids and weights.
    EventRaw,
    /// Event ids, weights and explicit event features.
    EventFeature,
    /// Entities and offset events merged onto one node axis.
    Joint,
    /// Entities and events on separate axes, plus arguments and adjacency.
    JointGraph,
}

impl InputGroup {
    pub fn reads_entities(self) -> bool {
        !matches!(self, InputGroup::EventRaw | InputGroup::EventFeature)
    }

    pub fn reads_events(self) -> bool {
        !matches!(self, InputGroup::EntityRaw | InputGroup::EntityFeature)
    }

    /// Joint groups shift event ids past the entity vocabulary.
    pub fn is_joint(self) -> bool {
        matches!(self, InputGroup::Joint | InputGroup::JointGraph)
    }

    pub fn uses_entity_features(self) -> bool {
        matches!(
            self,
            InputGroup::EntityFeature | InputGroup::Joint | InputGroup::JointGraph
        )
    }

    pub fn uses_event_features(self) -> bool {
        matches!(
            self,
            InputGroup::EventFeature | InputGroup::Joint | InputGroup::JointGraph
        )
    }
}

/// Normalizer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Input group (default: `entity_raw`).
    pub input: InputGroup,
    /// Content field inside the spot objects (default: `"bodyText"`).
    pub content_field: String,
    /// Top-level entity spot object (default: `"spot"`).
    pub spot_field: String,
    /// Top-level event spot object (default: `"event"`).
    pub event_spot_field: String,
    /// Field inside the spot object holding the gold salient entities
    /// (default: `"abstract"`).
    pub salience_field: String,
    /// Top-level per-event argument lists (default: `"adjacent"`).
    pub adjacent_field: String,
    /// Entity cap per document (default: 200).
    pub max_entities_per_doc: usize,
    /// Event cap per document (default: 200).
    pub max_events_per_doc: usize,
    /// Argument cap per event (default: 10).
    pub max_arguments_per_event: usize,
    /// Mention span cap per entity (default: 20).
    pub max_spans_per_entity: usize,
    /// Entity vocabulary size; event ids are offset by it in joint groups.
    pub entity_vocab_size: usize,
    /// Explicit entity feature width (default: 0).
    pub entity_feature_dim: usize,
    /// Explicit event feature width after column selection (default: 0).
    pub event_feature_dim: usize,
    /// Entity feature column holding the frequency (default: 0).
    pub entity_frequency_column: i64,
    /// Event feature column holding the frequency; negative counts from the
    /// end of the row (default: -2).
    pub event_frequency_column: i64,
    /// Optional event feature columns to keep, in order; negative counts
    /// from the end of the row.
    pub event_feature_columns: Option<Vec<i64>>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            input: InputGroup::EntityRaw,
            content_field: "bodyText".to_string(),
            spot_field: "spot".to_string(),
            event_spot_field: "event".to_string(),
            salience_field: "abstract".to_string(),
            adjacent_field: "adjacent".to_string(),
            max_entities_per_doc: 200,
            max_events_per_doc: 200,
            max_arguments_per_event: 10,
            max_spans_per_entity: 20,
            entity_vocab_size: 0,
            entity_feature_dim: 0,
            event_feature_dim: 0,
            entity_frequency_column: 0,
            event_frequency_column: -2,
            event_feature_columns: None,
        }
    }
}

impl NormalizerConfig {
    pub fn with_input(mut self, input: InputGroup) -> Self {
        self.input = input;
        self
    }

    pub fn with_content_field(mut self, field: impl Into<String>) -> Self {
        self.content_field = field.into();
        self
    }

    pub fn with_max_entities(mut self, n: usize) -> Self {
        self.max_entities_per_doc = n;
        self
    }

    pub fn with_max_events(mut self, n: usize) -> Self {
        self.max_events_per_doc = n;
        self
    }

    pub fn with_max_arguments(mut self, n: usize) -> Self {
        self.max_arguments_per_event = n;
        self
    }

    pub fn with_entity_vocab_size(mut self, n: usize) -> Self {
        self.entity_vocab_size = n;
        self
    }

    pub fn with_entity_feature_dim(mut self, dim: usize) -> Self {
        self.entity_feature_dim = dim;
        self
    }

    pub fn with_event_feature_dim(mut self, dim: usize) -> Self {
        self.event_feature_dim = dim;
        self
    }

    pub fn with_event_feature_columns(mut self, columns: Vec<i64>) -> Self {
        self.event_feature_columns = Some(columns);
        self
    }

    /// Width of the explicit feature row of every emitted node.
    ///
    /// Joint groups lay rows out as `[entity block | event block]`.
    pub fn node_feature_dim(&self) -> usize {
        let entity = if self.input.uses_entity_features() {
            self.entity_feature_dim
        } else {
            0
        };
        let event = if self.input.uses_event_features() {
            self.event_feature_dim
        } else {
            0
        };
        entity + event
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_entities_per_doc == 0 || self.max_events_per_doc == 0 {
            return Err(Error::InvalidConfig(
                "per-document caps must be positive".into(),
            ));
        }
        if self.input.is_joint() && self.entity_vocab_size == 0 {
            return Err(Error::InvalidConfig(
                "joint input groups need entity_vocab_size for the event id offset".into(),
            ));
        }
        if u32::try_from(self.entity_vocab_size).is_err() {
            return Err(Error::InvalidConfig(format!(
                "entity_vocab_size {} does not fit a u32 id",
                self.entity_vocab_size
            )));
        }
        if self.input == InputGroup::EntityFeature && self.entity_feature_dim == 0 {
            return Err(Error::InvalidConfig(
                "entity_feature input needs entity_feature_dim > 0".into(),
            ));
        }
        if self.input == InputGroup::EventFeature && self.event_feature_dim == 0 {
            return Err(Error::InvalidConfig(
                "event_feature input needs event_feature_dim > 0".into(),
            ));
        }
        if let Some(columns) = &self.event_feature_columns {
            if columns.len() != self.event_feature_dim {
                return Err(Error::DimensionMismatch {
                    what: "event_feature_columns",
                    expected: self.event_feature_dim,
                    got: columns.len(),
                });
            }
        }
        Ok(())
    }
}

/// Why a document was not emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// No entity or event survived selection.
    Empty,
    /// The record could not be read; the message says where.
    Malformed(String),
}

/// Outcome of normalizing one record.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Document(NormalizedDocument),
    Skipped(SkipReason),
}

impl Normalized {
    pub fn document(self) -> Option<NormalizedDocument> {
        match self {
            Normalized::Document(doc) => Some(doc),
            Normalized::Skipped(_) => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PackedSpot {
    entities: Vec<u32>,
    features: Vec<Vec<f32>>,
    salience: Option<Vec<f64>>,
    loc: Vec<Vec<Span>>,
}

/// A spot content field: a plain list of (repeating) ids, or a packed object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SpotField {
    Ids(Vec<u32>),
    Packed(PackedSpot),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PackedEvents {
    sparse_features: HashMap<String, Vec<u32>>,
    features: Vec<Vec<f32>>,
    salience: Option<Vec<f64>>,
}

type Malformed = std::result::Result<(), String>;

/// Converts raw annotation records into [`NormalizedDocument`]s.
#[derive(Debug, Clone)]
pub struct RecordNormalizer {
    config: NormalizerConfig,
}

impl RecordNormalizer {
    /// Creates a normalizer after validating the configuration.
    pub fn new(config: NormalizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Normalizes one JSON line.
    pub fn normalize_line(&self, line: &str) -> Normalized {
        match serde_json::from_str::<Value>(line) {
            Ok(value) => self.normalize_value(&value),
            Err(e) => Normalized::Skipped(SkipReason::Malformed(format!("invalid json: {e}"))),
        }
    }

    /// Normalizes one parsed record.
    pub fn normalize_value(&self, value: &Value) -> Normalized {
        match self.read_document(value) {
            Ok(doc) if doc.is_empty() => Normalized::Skipped(SkipReason::Empty),
            Ok(doc) => Normalized::Document(doc),
            Err(msg) => Normalized::Skipped(SkipReason::Malformed(msg)),
        }
    }

    /// Normalizes a group of lines, dropping skipped documents.
    ///
    /// Skips are logged at `debug` with the line's position in the group.
    pub fn normalize_lines<S: AsRef<str>>(&self, lines: &[S]) -> Vec<NormalizedDocument> {
        let mut docs = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            match self.normalize_line(line.as_ref()) {
                Normalized::Document(doc) => docs.push(doc),
                Normalized::Skipped(SkipReason::Empty) => {
                    debug!(line = i, "skipping empty document");
                }
                Normalized::Skipped(SkipReason::Malformed(msg)) => {
                    debug!(line = i, reason = %msg, "skipping malformed document");
                }
            }
        }
        docs
    }

    fn read_document(&self, value: &Value) -> std::result::Result<NormalizedDocument, String> {
        let mut doc = NormalizedDocument::new(doc_key(value)?);
        let input = self.config.input;

        if input.reads_entities() {
            doc.entities = self.read_entities(value)?;
        }
        if input.reads_events() {
            doc.events = self.read_events(value)?;
        }

        if input.is_joint() {
            let offset = u32::try_from(self.config.entity_vocab_size)
                .map_err(|_| format!("entity vocabulary size {} exceeds the id range", self.config.entity_vocab_size))?;
            for event in &mut doc.events {
                event.node.id = event
                    .node
                    .id
                    .checked_add(offset)
                    .ok_or_else(|| format!("event id {} overflows with offset {offset}", event.node.id))?;
            }
            let entity_dim = self.config.entity_feature_dim;
            let event_dim = self.config.event_feature_dim;
            if entity_dim + event_dim > 0 {
                for node in &mut doc.entities {
                    node.features.resize(entity_dim + event_dim, 0.0);
                }
                for event in &mut doc.events {
                    let mut row = vec![0.0; entity_dim];
                    row.append(&mut event.node.features);
                    event.node.features = row;
                }
            }
        }
        Ok(doc)
    }

    fn read_entities(&self, value: &Value) -> std::result::Result<Vec<NodeRecord>, String> {
        let cfg = &self.config;
        let spots = value
            .get(&cfg.spot_field)
            .and_then(Value::as_object)
            .ok_or_else(|| format!("missing `{}` object", cfg.spot_field))?;
        let Some(content) = spots.get(&cfg.content_field) else {
            return Ok(Vec::new());
        };
        let spot = SpotField::deserialize(content)
            .map_err(|e| format!("{}.{}: {e}", cfg.spot_field, cfg.content_field))?;
        let gold = match spots.get(&cfg.salience_field) {
            Some(v) => Some(gold_set(v).map_err(|e| {
                format!("{}.{}: {e}", cfg.spot_field, cfg.salience_field)
            })?),
            None => None,
        };
        let feature_dim = if cfg.input.uses_entity_features() {
            cfg.entity_feature_dim
        } else {
            0
        };

        match spot {
            SpotField::Ids(ids) => {
                let counts = term_counts(&ids);
                let freqs: Vec<f32> = counts.iter().map(|&(_, c)| c as f32).collect();
                let keep = top_k_by_frequency(&freqs, cfg.max_entities_per_doc);
                let weights = normalize_weights(keep.iter().map(|&i| freqs[i]));
                Ok(keep
                    .iter()
                    .zip(weights)
                    .map(|(&i, w)| {
                        let id = counts[i].0;
                        let label = gold_label(gold.as_ref(), id);
                        NodeRecord::new(id, w, label).with_features(vec![0.0; feature_dim])
                    })
                    .collect())
            }
            SpotField::Packed(packed) => self.read_packed_entities(packed, gold.as_ref(), feature_dim),
        }
    }

    fn read_packed_entities(
        &self,
        packed: PackedSpot,
        gold: Option<&HashSet<u32>>,
        feature_dim: usize,
    ) -> std::result::Result<Vec<NodeRecord>, String> {
        let cfg = &self.config;
        let n = packed.entities.len();
        parallel("features", packed.features.len(), n)?;
        parallel("loc", packed.loc.len(), n)?;
        if let Some(s) = &packed.salience {
            parallel("salience", s.len(), n)?;
        }

        // Candidate positions, one per distinct id, first occurrence wins.
        let mut seen = HashSet::new();
        let candidates: Vec<usize> = (0..n)
            .filter(|&i| packed.entities[i] != 0 && seen.insert(packed.entities[i]))
            .collect();

        let freqs: Vec<f32> = if packed.features.is_empty() {
            let counts: HashMap<u32, usize> = term_counts(&packed.entities).into_iter().collect();
            candidates
                .iter()
                .map(|&i| counts.get(&packed.entities[i]).copied().unwrap_or(0) as f32)
                .collect()
        } else {
            candidates
                .iter()
                .map(|&i| column(&packed.features[i], cfg.entity_frequency_column, "entity frequency"))
                .collect::<std::result::Result<_, _>>()?
        };
        check_frequencies(&freqs)?;

        let keep = top_k_by_frequency(&freqs, cfg.max_entities_per_doc);
        let weights = normalize_weights(keep.iter().map(|&k| freqs[k]));

        let mut nodes = Vec::with_capacity(keep.len());
        for (&k, weight) in keep.iter().zip(weights) {
            let i = candidates[k];
            let id = packed.entities[i];
            let label = match &packed.salience {
                Some(s) => Label::from_gold(s[i]),
                None => gold_label(gold, id),
            };
            let features = if feature_dim == 0 {
                Vec::new()
            } else if packed.features.is_empty() {
                vec![0.0; feature_dim]
            } else {
                let row = &packed.features[i];
                if row.len() != feature_dim {
                    return Err(format!(
                        "entity feature row {i} has width {}, expected {feature_dim}",
                        row.len()
                    ));
                }
                row.clone()
            };
            let mut node = NodeRecord::new(id, weight, label).with_features(features);
            if let Some(loc) = packed.loc.get(i) {
                node.spans = loc.iter().take(cfg.max_spans_per_entity).copied().collect();
            }
            nodes.push(node);
        }
        Ok(nodes)
    }

    fn read_events(&self, value: &Value) -> std::result::Result<Vec<EventRecord>, String> {
        let cfg = &self.config;
        let spots = value
            .get(&cfg.event_spot_field)
            .and_then(Value::as_object)
            .ok_or_else(|| format!("missing `{}` object", cfg.event_spot_field))?;
        let Some(content) = spots.get(&cfg.content_field) else {
            return Ok(Vec::new());
        };
        let packed = PackedEvents::deserialize(content)
            .map_err(|e| format!("{}.{}: {e}", cfg.event_spot_field, cfg.content_field))?;
        let heads = packed
            .sparse_features
            .get(LEXICAL_HEAD)
            .cloned()
            .unwrap_or_default();
        let n = heads.len();
        parallel("event features", packed.features.len(), n)?;
        if let Some(s) = &packed.salience {
            parallel("event salience", s.len(), n)?;
        }

        let arguments: Vec<Vec<u32>> = match value.get(&cfg.adjacent_field) {
            None | Some(Value::Null) => Vec::new(),
            Some(v) => Vec::<Vec<u32>>::deserialize(v)
                .map_err(|e| format!("{}: {e}", cfg.adjacent_field))?,
        };
        // `[[]]` is the conventional "no arguments" placeholder.
        let arguments = if arguments.iter().all(Vec::is_empty) {
            Vec::new()
        } else {
            parallel("adjacent", arguments.len(), n)?;
            arguments
        };

        let candidates: Vec<usize> = (0..n).filter(|&i| heads[i] != 0).collect();
        let freqs: Vec<f32> = if packed.features.is_empty() {
            vec![1.0; candidates.len()]
        } else {
            candidates
                .iter()
                .map(|&i| column(&packed.features[i], cfg.event_frequency_column, "event frequency"))
                .collect::<std::result::Result<_, _>>()?
        };
        check_frequencies(&freqs)?;

        let keep = top_k_by_frequency(&freqs, cfg.max_events_per_doc);
        let weights = normalize_weights(keep.iter().map(|&k| freqs[k]));
        let feature_dim = if cfg.input.uses_event_features() {
            cfg.event_feature_dim
        } else {
            0
        };

        let mut events = Vec::with_capacity(keep.len());
        for (&k, weight) in keep.iter().zip(weights) {
            let i = candidates[k];
            let label = packed
                .salience
                .as_ref()
                .map_or(Label::NotSalient, |s| Label::from_gold(s[i]));
            let features = if feature_dim == 0 {
                Vec::new()
            } else if packed.features.is_empty() {
                vec![0.0; feature_dim]
            } else {
                self.event_feature_row(&packed.features[i], i)?
            };
            let args = arguments
                .get(i)
                .map(|a| {
                    a.iter()
                        .copied()
                        .filter(|&id| id != 0)
                        .take(cfg.max_arguments_per_event)
                        .collect()
                })
                .unwrap_or_default();
            events.push(EventRecord {
                node: NodeRecord::new(heads[i], weight, label).with_features(features),
                arguments: args,
            });
        }
        Ok(events)
    }

    fn event_feature_row(&self, row: &[f32], i: usize) -> std::result::Result<Vec<f32>, String> {
        let dim = self.config.event_feature_dim;
        match &self.config.event_feature_columns {
            Some(columns) => columns
                .iter()
                .map(|&c| column(row, c, "event feature"))
                .collect(),
            None if row.len() == dim => Ok(row.to_vec()),
            None => Err(format!(
                "event feature row {i} has width {}, expected {dim}",
                row.len()
            )),
        }
    }
}

/// Indices of the `k` largest frequencies, most frequent first.
///
/// The sort is stable: equal frequencies keep their input order.
pub fn top_k_by_frequency(freqs: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..freqs.len()).collect();
    order.sort_by(|&a, &b| freqs[b].total_cmp(&freqs[a]));
    order.truncate(k);
    order
}

/// Counts non-zero ids in first-occurrence order.
pub fn term_counts(ids: &[u32]) -> Vec<(u32, usize)> {
    let mut index: HashMap<u32, usize> = HashMap::new();
    let mut counts: Vec<(u32, usize)> = Vec::new();
    for &id in ids.iter().filter(|&&id| id != 0) {
        match index.get(&id) {
            Some(&slot) => counts[slot].1 += 1,
            None => {
                index.insert(id, counts.len());
                counts.push((id, 1));
            }
        }
    }
    counts
}

/// Scales frequencies to sum to one; all-zero input becomes uniform.
pub fn normalize_weights(freqs: impl IntoIterator<Item = f32>) -> Vec<f32> {
    let freqs: Vec<f32> = freqs.into_iter().collect();
    let z: f32 = freqs.iter().sum();
    if z > 0.0 {
        freqs.iter().map(|f| f / z).collect()
    } else {
        let n = freqs.len() as f32;
        freqs.iter().map(|_| 1.0 / n).collect()
    }
}

fn doc_key(value: &Value) -> std::result::Result<DocKey, String> {
    let text = |v: &Value| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    };
    if let Some(v) = value.get("docno").and_then(text) {
        return Ok(DocKey::Docno(v));
    }
    if let Some(v) = value.get("qid").and_then(text) {
        return Ok(DocKey::Qid(v));
    }
    Err("missing `docno` or `qid`".into())
}

/// Gold entity set: either an id list or a packed spot object.
fn gold_set(value: &Value) -> std::result::Result<HashSet<u32>, serde_json::Error> {
    Ok(match SpotField::deserialize(value)? {
        SpotField::Ids(ids) => ids.into_iter().collect(),
        SpotField::Packed(p) => p.entities.into_iter().collect(),
    })
}

fn gold_label(gold: Option<&HashSet<u32>>, id: u32) -> Label {
    match gold {
        Some(set) if set.contains(&id) => Label::Salient,
        _ => Label::NotSalient,
    }
}

fn parallel(name: &str, len: usize, expected: usize) -> Malformed {
    if len != 0 && len != expected {
        return Err(format!("`{name}` has {len} entries for {expected} nodes"));
    }
    Ok(())
}

fn column(row: &[f32], col: i64, what: &str) -> std::result::Result<f32, String> {
    let idx = if col < 0 {
        row.len().checked_sub(col.unsigned_abs() as usize)
    } else {
        Some(col as usize)
    };
    idx.and_then(|i| row.get(i).copied())
        .ok_or_else(|| format!("{what} column {col} out of range for row of width {}", row.len()))
}

fn check_frequencies(freqs: &[f32]) -> Malformed {
    match freqs.iter().find(|f| !f.is_finite() || **f < 0.0) {
        Some(f) => Err(format!("invalid frequency {f}")),
        None => Ok(()),
    }
}
