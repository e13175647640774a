//! Inference and the hand-off to an external evaluator.
//!
//! Each document is scored on its own (a batch of one), paired with its
//! labels and passed to a [`SalienceEvaluator`]. The crate ships no metric
//! formulas; callers plug theirs in and [`MetricAccumulator`] keeps the
//! running means.
//!
//! Output is one JSON line per document:
//!
//! ```text
//! {"docno": "d1", "bodyText": {"predict": [[11, 0.83], [12, -0.20]]}, "eval": {"p@1": 1.0}}
//! ```
//!
//! plus `<output>.eval` holding the final means as sorted `[name, mean]` pairs.

use crate::error::{Error, Result};
use crate::model::SalienceModel;
use salix_core::{BatchAssembler, DocKey, Field, InputGroup, NormalizedDocument, NormalizerConfig};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// External metric computation over one document's scores and labels.
pub trait SalienceEvaluator {
    /// `labels` are `+1/-1`, parallel to `scores`.
    fn evaluate(&self, scores: &[f32], labels: &[f32]) -> BTreeMap<String, f64>;
}

/// Evaluator that reports nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEvaluator;

impl SalienceEvaluator for NullEvaluator {
    fn evaluate(&self, _scores: &[f32], _labels: &[f32]) -> BTreeMap<String, f64> {
        BTreeMap::new()
    }
}

/// Running mean per metric name; each metric counts only the documents
/// that reported it.
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    sums: BTreeMap<String, f64>,
    counts: BTreeMap<String, usize>,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, metrics: &BTreeMap<String, f64>) {
        for (name, value) in metrics {
            *self.sums.entry(name.clone()).or_default() += value;
            *self.counts.entry(name.clone()).or_default() += 1;
        }
    }

    pub fn means(&self) -> BTreeMap<String, f64> {
        self.sums
            .iter()
            .map(|(name, sum)| {
                let n = self.counts.get(name).copied().unwrap_or(1).max(1);
                (name.clone(), sum / n as f64)
            })
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.counts.get(name).copied().unwrap_or(0)
    }
}

/// Scores of one document in scoring order.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentPrediction {
    pub key: DocKey,
    /// `(id, score)`; event ids carry their vocabulary offset.
    pub scores: Vec<(u32, f32)>,
    pub labels: Vec<f32>,
    pub eval: BTreeMap<String, f64>,
}

impl DocumentPrediction {
    pub fn to_json(&self, content_field: &str) -> Value {
        let predict: Vec<Value> = self.scores.iter().map(|&(id, s)| json!([id, s])).collect();
        let mut out = serde_json::Map::new();
        out.insert(self.key.field_name().to_string(), json!(self.key.value()));
        out.insert(content_field.to_string(), json!({ "predict": predict }));
        out.insert("eval".to_string(), json!(self.eval));
        Value::Object(out)
    }
}

/// Counts of one prediction run.
#[derive(Debug, Clone, Default)]
pub struct PredictionSummary {
    pub documents: usize,
    /// Documents with nothing to score.
    pub skipped: usize,
    pub metrics: BTreeMap<String, f64>,
}

pub struct Predictor<'a, E> {
    model: &'a SalienceModel,
    assembler: BatchAssembler,
    content_field: String,
    evaluator: E,
    log_every: usize,
}

impl<'a, E: SalienceEvaluator> Predictor<'a, E> {
    pub fn new(model: &'a SalienceModel, input: &NormalizerConfig, evaluator: E) -> Self {
        Self {
            model,
            assembler: BatchAssembler::from_config(input),
            content_field: input.content_field.clone(),
            evaluator,
            log_every: 1000,
        }
    }

    pub fn with_log_every(mut self, n: usize) -> Self {
        self.log_every = n;
        self
    }

    /// Forward pass for one document; `None` when it has no nodes.
    pub fn predict_document(&self, doc: &NormalizedDocument) -> Result<Option<DocumentPrediction>> {
        let batch = match self.assembler.assemble(std::slice::from_ref(doc)) {
            Ok(batch) => batch,
            Err(e) => {
                let e = Error::from(e);
                return if e.is_empty_batch() { Ok(None) } else { Err(e) };
            }
        };
        let scores = self.model.score(&batch)?.detach().to_vec2::<f32>()?;
        let scores = &scores[0];
        let labels = batch.floats(Field::Labels)?.row(0);

        let nodes = batch.ints(Field::Nodes)?.row(0);
        let mut positions: Vec<(usize, u32)> = (0..batch.lengths(Field::Nodes)?[0])
            .map(|i| (i, nodes[i]))
            .collect();
        if batch.group() == InputGroup::JointGraph {
            let offset = nodes.len();
            let events = batch.ints(Field::Events)?.row(0);
            positions.extend((0..batch.lengths(Field::Events)?[0]).map(|k| (offset + k, events[k])));
        }

        let pairs: Vec<(u32, f32)> = positions.iter().map(|&(p, id)| (id, scores[p])).collect();
        let gold: Vec<f32> = positions.iter().map(|&(p, _)| labels[p]).collect();
        let ranked: Vec<f32> = pairs.iter().map(|&(_, s)| s).collect();
        let eval = self.evaluator.evaluate(&ranked, &gold);
        Ok(Some(DocumentPrediction {
            key: doc.key.clone(),
            scores: pairs,
            labels: gold,
            eval,
        }))
    }

    /// Scores every document, writing one JSON line each to `out`.
    pub fn predict_all<W: Write>(&self, docs: &[NormalizedDocument], mut out: W) -> Result<PredictionSummary> {
        let mut accumulator = MetricAccumulator::new();
        let mut summary = PredictionSummary::default();
        for doc in docs {
            let Some(prediction) = self.predict_document(doc)? else {
                summary.skipped += 1;
                continue;
            };
            accumulator.add(&prediction.eval);
            serde_json::to_writer(&mut out, &prediction.to_json(&self.content_field))?;
            writeln!(out)?;
            summary.documents += 1;
            if self.log_every > 0 && summary.documents % self.log_every == 0 {
                info!(documents = summary.documents, metrics = ?accumulator.means(), "predicting");
            }
        }
        out.flush()?;
        let missing = self.model.embedding().missing_count();
        if missing > 0 {
            warn!(missing, "ids without an embedding row were mapped to 0");
        }
        summary.metrics = accumulator.means();
        info!(
            documents = summary.documents,
            skipped = summary.skipped,
            metrics = ?summary.metrics,
            "prediction done"
        );
        Ok(summary)
    }
}

/// `<output>.eval`
pub fn eval_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".eval");
    PathBuf::from(name)
}

/// Writes the aggregate metrics as sorted `[name, mean]` pairs.
pub fn write_eval(path: &Path, metrics: &BTreeMap<String, f64>) -> Result<()> {
    let pairs: Vec<(&String, &f64)> = metrics.iter().collect();
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, &pairs)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}
