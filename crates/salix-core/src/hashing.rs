//! Corpus hashing: annotated documents with string ids into packed id records.
//!
//! Input lines carry one object per mention:
//!
//! ```text
//! { "docno": .., "spot": { field: [ {"id": "/m/02mjmr", "loc": [s, e], "salience": 1,
//!                                    "feature": {"featureArray": [..]}}, .. ] },
//!   "event": { field: [ {"frame_name": .., "salience": 0,
//!                        "feature": {"featureArray": [..],
//!                                    "sparseFeatureArray": ["LexicalHead_run", ..]}}, .. ] } }
//! ```
//!
//! Output lines are what [`crate::RecordNormalizer`] reads: per field a
//! packed object with `entities`, `features` (term frequency first),
//! `salience` and optionally `loc`.

use crate::error::Result;
use crate::normalize::{term_counts, top_k_by_frequency, LEXICAL_HEAD};
use crate::record::Span;
use crate::vocab::{Vocabulary, VocabularyBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, Write};
use tracing::{debug, info};

/// Hasher configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HasherConfig {
    /// Entity cap per field (default: 200).
    pub max_entities_per_doc: usize,
    /// Append each entity's `featureArray` after its term frequency.
    pub with_features: bool,
    /// Emit mention spans under `loc`.
    pub with_position: bool,
    /// Span cap per entity (default: 20).
    pub max_positions_per_entity: usize,
    /// Hash the `event` object too.
    pub hash_events: bool,
    /// Spot fields that must keep at least one entity, or the document is
    /// dropped (default: `["bodyText", "abstract"]`).
    pub required_fields: Vec<String>,
}

impl Default for HasherConfig {
    fn default() -> Self {
        Self {
            max_entities_per_doc: 200,
            with_features: false,
            with_position: false,
            max_positions_per_entity: 20,
            hash_events: false,
            required_fields: vec!["bodyText".to_string(), "abstract".to_string()],
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MentionFeature {
    #[serde(rename = "featureArray")]
    dense: Vec<f32>,
    #[serde(rename = "sparseFeatureArray")]
    sparse: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EntityMention {
    id: String,
    #[serde(default)]
    loc: Option<Span>,
    #[serde(default)]
    salience: f64,
    #[serde(default)]
    feature: MentionFeature,
}

#[derive(Debug, Deserialize)]
struct EventMention {
    #[serde(default)]
    frame_name: Option<String>,
    #[serde(default)]
    loc: Option<Span>,
    #[serde(default)]
    salience: f64,
    #[serde(default)]
    feature: MentionFeature,
}

impl EventMention {
    /// Lexical head from the sparse features, falling back to the frame name.
    fn head(&self) -> Option<&str> {
        let prefix = format!("{LEXICAL_HEAD}_");
        self.feature
            .sparse
            .iter()
            .find_map(|f| f.strip_prefix(prefix.as_str()))
            .or(self.frame_name.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct AnnotatedDocument {
    #[serde(default)]
    docno: Option<Value>,
    #[serde(default)]
    qid: Option<Value>,
    #[serde(default)]
    spot: BTreeMap<String, Vec<EntityMention>>,
    #[serde(default)]
    event: BTreeMap<String, Vec<EventMention>>,
}

#[derive(Debug, Serialize)]
struct HashedSpot {
    entities: Vec<u32>,
    features: Vec<Vec<f32>>,
    salience: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    loc: Option<Vec<Vec<Span>>>,
}

#[derive(Debug, Serialize)]
struct HashedEvents {
    sparse_features: BTreeMap<String, Vec<u32>>,
    features: Vec<Vec<f32>>,
    salience: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    loc: Option<Vec<Vec<Span>>>,
}

#[derive(Debug, Serialize)]
struct HashedDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    docno: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    qid: Option<Value>,
    spot: BTreeMap<String, HashedSpot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<BTreeMap<String, HashedEvents>>,
}

/// Entity and event vocabularies collected in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabularies {
    pub entities: Vocabulary,
    pub events: Vocabulary,
}

impl Vocabularies {
    /// Collects entity ids and event heads from annotated lines.
    ///
    /// Lines that do not parse are skipped here; the hashing pass reports them.
    pub fn collect<S: AsRef<str>>(lines: impl IntoIterator<Item = S>) -> Self {
        let mut entities = VocabularyBuilder::new();
        let mut events = VocabularyBuilder::new();
        for line in lines {
            let Ok(doc) = serde_json::from_str::<AnnotatedDocument>(line.as_ref()) else {
                continue;
            };
            for mention in doc.spot.values().flatten() {
                entities.add(&mention.id);
            }
            for mention in doc.event.values().flatten() {
                if let Some(head) = mention.head() {
                    events.add(head);
                }
            }
        }
        Self {
            entities: entities.build(),
            events: events.build(),
        }
    }
}

/// Counters from one hashing run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HashStats {
    pub read: usize,
    pub written: usize,
    /// Dropped because a required field kept no entity.
    pub dropped: usize,
    /// Dropped because the line did not parse.
    pub malformed: usize,
}

/// Hashes annotated documents against fixed vocabularies.
#[derive(Debug, Clone)]
pub struct CorpusHasher {
    config: HasherConfig,
    entities: Vocabulary,
    events: Vocabulary,
}

impl CorpusHasher {
    pub fn new(config: HasherConfig, vocabularies: Vocabularies) -> Self {
        Self {
            config,
            entities: vocabularies.entities,
            events: vocabularies.events,
        }
    }

    pub fn config(&self) -> &HasherConfig {
        &self.config
    }

    /// Hashes one line. `Ok(None)` means a required field kept no entity.
    pub fn hash_line(&self, line: &str) -> Result<Option<Value>> {
        let doc: AnnotatedDocument = serde_json::from_str(line)?;

        let spot: BTreeMap<String, HashedSpot> = doc
            .spot
            .iter()
            .map(|(field, mentions)| (field.clone(), self.hash_spot(mentions)))
            .collect();
        let complete = self
            .config
            .required_fields
            .iter()
            .all(|f| spot.get(f).is_some_and(|s| !s.entities.is_empty()));
        if !complete {
            return Ok(None);
        }

        let event = self.config.hash_events.then(|| {
            doc.event
                .iter()
                .map(|(field, mentions)| (field.clone(), self.hash_events(mentions)))
                .collect()
        });
        let hashed = HashedDocument {
            docno: doc.docno,
            qid: doc.qid,
            spot,
            event,
        };
        Ok(Some(serde_json::to_value(hashed)?))
    }

    /// Hashes every line of `reader` into `writer`, one JSON object per line.
    pub fn hash_corpus<R: BufRead, W: Write>(&self, reader: R, mut writer: W) -> Result<HashStats> {
        let mut stats = HashStats::default();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            stats.read += 1;
            match self.hash_line(&line) {
                Ok(Some(value)) => {
                    serde_json::to_writer(&mut writer, &value)?;
                    writer.write_all(b"\n")?;
                    stats.written += 1;
                }
                Ok(None) => stats.dropped += 1,
                Err(e) => {
                    debug!(line = stats.read, error = %e, "skipping unreadable line");
                    stats.malformed += 1;
                }
            }
            if stats.read % 1000 == 0 {
                info!(lines = stats.read, written = stats.written, "hashing");
            }
        }
        writer.flush()?;
        Ok(stats)
    }

    fn hash_spot(&self, mentions: &[EntityMention]) -> HashedSpot {
        let cfg = &self.config;
        let ids: Vec<u32> = mentions.iter().map(|m| self.entities.id(&m.id)).collect();
        let counts = term_counts(&ids);
        let freqs: Vec<f32> = counts.iter().map(|&(_, c)| c as f32).collect();
        let kept: Vec<(u32, usize)> = top_k_by_frequency(&freqs, cfg.max_entities_per_doc)
            .into_iter()
            .map(|i| counts[i])
            .collect();

        // Later mentions overwrite earlier ones for per-entity values.
        let mut salience: HashMap<u32, f64> = HashMap::new();
        let mut dense: HashMap<u32, &[f32]> = HashMap::new();
        let mut spans: HashMap<u32, Vec<Span>> = HashMap::new();
        for (m, &id) in mentions.iter().zip(&ids) {
            salience.insert(id, m.salience);
            dense.insert(id, &m.feature.dense);
            if let Some(loc) = m.loc {
                let list = spans.entry(id).or_default();
                if list.len() < cfg.max_positions_per_entity {
                    list.push(loc);
                }
            }
        }

        let width = if cfg.with_features {
            kept.iter()
                .map(|(id, _)| dense.get(id).map_or(0, |f| f.len()))
                .max()
                .unwrap_or(0)
        } else {
            0
        };
        let features = kept
            .iter()
            .map(|&(id, tf)| {
                let mut row = vec![tf as f32];
                if cfg.with_features {
                    let extra = dense.get(&id).copied().unwrap_or(&[]);
                    row.extend_from_slice(extra);
                    row.resize(1 + width, 0.0);
                }
                row
            })
            .collect();

        HashedSpot {
            entities: kept.iter().map(|&(id, _)| id).collect(),
            features,
            salience: kept
                .iter()
                .map(|(id, _)| salience.get(id).copied().unwrap_or(0.0))
                .collect(),
            loc: cfg.with_position.then(|| {
                kept.iter()
                    .map(|(id, _)| spans.get(id).cloned().unwrap_or_default())
                    .collect()
            }),
        }
    }

    fn hash_events(&self, mentions: &[EventMention]) -> HashedEvents {
        let heads: Vec<u32> = mentions
            .iter()
            .map(|m| m.head().map_or(0, |h| self.events.id(h)))
            .collect();
        let width = mentions.iter().map(|m| m.feature.dense.len()).max().unwrap_or(0);
        let features = if self.config.with_features {
            mentions
                .iter()
                .map(|m| {
                    let mut row = m.feature.dense.clone();
                    row.resize(width, 0.0);
                    row
                })
                .collect()
        } else {
            Vec::new()
        };
        let mut sparse_features = BTreeMap::new();
        sparse_features.insert(LEXICAL_HEAD.to_string(), heads);

        HashedEvents {
            sparse_features,
            features,
            salience: mentions.iter().map(|m| m.salience).collect(),
            loc: self.config.with_position.then(|| {
                mentions
                    .iter()
                    .map(|m| m.loc.into_iter().collect())
                    .collect()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{InputGroup, Normalized, NormalizerConfig, RecordNormalizer};
    use serde_json::json;

    fn annotated() -> String {
        json!({
            "docno": "clueweb-1",
            "spot": {
                "bodyText": [
                    {"id": "/m/b", "loc": [0, 4], "salience": 0},
                    {"id": "/m/a", "loc": [10, 14], "salience": 1},
                    {"id": "/m/a", "loc": [20, 24], "salience": 1},
                    {"id": "/m/zz", "loc": [30, 34]}
                ],
                "abstract": [{"id": "/m/a", "loc": [0, 4]}]
            },
            "event": {
                "bodyText": [
                    {"frame_name": "Motion", "salience": 1,
                     "feature": {"featureArray": [1.0, 2.0],
                                 "sparseFeatureArray": ["LexicalHead_run", "FrameName_Motion"]}},
                    {"frame_name": "Arrest", "feature": {"featureArray": [3.0]}}
                ]
            }
        })
        .to_string()
    }

    fn vocabularies() -> Vocabularies {
        let mut entities = VocabularyBuilder::new();
        entities.add("/m/a");
        entities.add("/m/b");
        let mut events = VocabularyBuilder::new();
        events.add("run");
        Vocabularies {
            entities: entities.build(),
            events: events.build(),
        }
    }

    #[test]
    fn test_hash_spot_orders_by_frequency() {
        let hasher = CorpusHasher::new(
            HasherConfig {
                with_position: true,
                ..Default::default()
            },
            vocabularies(),
        );
        let out = hasher.hash_line(&annotated()).unwrap().unwrap();
        let body = &out["spot"]["bodyText"];
        // "/m/zz" is out of vocabulary and filtered as UNK.
        assert_eq!(body["entities"], json!([1, 2]));
        assert_eq!(body["features"], json!([[2.0], [1.0]]));
        assert_eq!(body["salience"], json!([1.0, 0.0]));
        assert_eq!(body["loc"], json!([[[10, 14], [20, 24]], [[0, 4]]]));
        assert!(out.get("event").is_none());
    }

    #[test]
    fn test_hash_events() {
        let hasher = CorpusHasher::new(
            HasherConfig {
                with_features: true,
                hash_events: true,
                ..Default::default()
            },
            vocabularies(),
        );
        let out = hasher.hash_line(&annotated()).unwrap().unwrap();
        let events = &out["event"]["bodyText"];
        // "Arrest" has no lexical head in the event vocabulary.
        assert_eq!(events["sparse_features"]["LexicalHead"], json!([1, 0]));
        assert_eq!(events["features"], json!([[1.0, 2.0], [3.0, 0.0]]));
        assert_eq!(events["salience"], json!([1.0, 0.0]));
    }

    #[test]
    fn test_required_fields() {
        let hasher = CorpusHasher::new(HasherConfig::default(), vocabularies());
        let line = json!({"docno": "d", "spot": {"bodyText": [{"id": "/m/a"}]}}).to_string();
        assert!(hasher.hash_line(&line).unwrap().is_none());
        assert!(hasher.hash_line("{oops").is_err());
    }

    #[test]
    fn test_hashed_output_normalizes() {
        let hasher = CorpusHasher::new(HasherConfig::default(), vocabularies());
        let out = hasher.hash_line(&annotated()).unwrap().unwrap();
        let normalizer = RecordNormalizer::new(
            NormalizerConfig::default().with_input(InputGroup::EntityRaw),
        )
        .unwrap();
        let Normalized::Document(doc) = normalizer.normalize_value(&out) else {
            panic!("hashed document should normalize");
        };
        let ids: Vec<u32> = doc.entities.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(doc.entities[0].label.is_salient());
        assert!((doc.entities[0].weight - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_collect_vocabularies_and_corpus() {
        let lines = vec![annotated()];
        let vocabs = Vocabularies::collect(&lines);
        assert_eq!(vocabs.entities.len(), 4);
        assert_eq!(vocabs.events.get("run"), Some(1));
        assert_eq!(vocabs.events.get("Arrest"), Some(2));

        let hasher = CorpusHasher::new(HasherConfig::default(), vocabs);
        let input = format!("{}\nnot json\n", annotated());
        let mut out = Vec::new();
        let stats = hasher.hash_corpus(input.as_bytes(), &mut out).unwrap();
        assert_eq!(stats.read, 2);
        assert_eq!(stats.written, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 1);
    }
}
