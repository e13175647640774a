//! Salix CLI: corpus hashing, salience model training and prediction.
//!
//! # Usage
//!
//! ```bash
//! # Hash an annotated corpus, building vocabularies on the fly
//! salix hash annotated.json -o hashed.json --events --with-features
//!
//! # Train with validation and early stopping, keeping the best checkpoint
//! salix train config.json --train hashed.json --validation dev.json -m model.safetensors
//!
//! # Score a corpus; writes test.pred and test.pred.eval
//! salix predict config.json --input test.json -m model.safetensors -o test.pred
//! ```
//!
//! Set `RUST_LOG=debug` to see skipped documents.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::SalixConfig;
use indicatif::ProgressBar;
use salix_core::{
    CorpusHasher, HasherConfig, NormalizedDocument, RecordNormalizer, Vocabularies, Vocabulary,
};
use salix_nn::{eval_path, write_eval, Backend, NullEvaluator, Predictor, SalienceModel, Trainer};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "salix")]
#[command(about = "Entity and event salience scoring", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hash an annotated corpus into packed id records
    Hash {
        /// Annotated input (one JSON document per line)
        input: PathBuf,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Entity vocabulary (JSON list); collected from the input if absent
        #[arg(long)]
        entity_vocab: Option<PathBuf>,

        /// Event vocabulary (JSON list); collected from the input if absent
        #[arg(long)]
        event_vocab: Option<PathBuf>,

        /// Entity cap per field
        #[arg(long, default_value = "200")]
        max_entities: usize,

        /// Keep mention feature arrays
        #[arg(long)]
        with_features: bool,

        /// Keep mention spans
        #[arg(long)]
        with_position: bool,

        /// Hash events as well
        #[arg(long)]
        events: bool,
    },

    /// Train a salience model
    Train {
        /// Run configuration (JSON)
        config: PathBuf,

        /// Hashed training corpus
        #[arg(long)]
        train: PathBuf,

        /// Hashed validation corpus
        #[arg(long)]
        validation: Option<PathBuf>,

        /// Checkpoint path (safetensors)
        #[arg(short = 'm', long)]
        model: PathBuf,

        /// Override training.epochs
        #[arg(long)]
        epochs: Option<usize>,

        /// Override training.learning_rate
        #[arg(long)]
        learning_rate: Option<f64>,

        /// Run on the first CUDA device if available
        #[arg(long)]
        cuda: bool,
    },

    /// Score a corpus with a trained model
    Predict {
        /// Run configuration (JSON)
        config: PathBuf,

        /// Hashed corpus to score
        #[arg(long)]
        input: PathBuf,

        /// Checkpoint path (safetensors)
        #[arg(short = 'm', long)]
        model: PathBuf,

        /// Prediction output; metrics go to `<output>.eval`
        #[arg(short, long)]
        output: PathBuf,

        /// Run on the first CUDA device if available
        #[arg(long)]
        cuda: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Hash {
            input,
            output,
            entity_vocab,
            event_vocab,
            max_entities,
            with_features,
            with_position,
            events,
        } => {
            let config = HasherConfig {
                max_entities_per_doc: max_entities,
                with_features,
                with_position,
                hash_events: events,
                ..Default::default()
            };
            cmd_hash(&input, &output, entity_vocab, event_vocab, config)
        }
        Commands::Train {
            config,
            train,
            validation,
            model,
            epochs,
            learning_rate,
            cuda,
        } => {
            let mut config = load_config(&config, cuda)?;
            if let Some(epochs) = epochs {
                config.training.epochs = epochs;
            }
            if let Some(lr) = learning_rate {
                config.training.learning_rate = lr;
            }
            config.validate()?;
            cmd_train(&config, &train, validation.as_deref(), &model)
        }
        Commands::Predict {
            config,
            input,
            model,
            output,
            cuda,
        } => {
            let config = load_config(&config, cuda)?;
            config.validate()?;
            cmd_predict(&config, &input, &model, &output)
        }
    }
}

fn load_config(path: &Path, cuda: bool) -> Result<SalixConfig> {
    let mut config = SalixConfig::load(path)?;
    if cuda {
        config.backend = Backend::Cuda;
    }
    Ok(config)
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    BufReader::new(file)
        .lines()
        .filter(|l| l.as_ref().map_or(true, |l| !l.trim().is_empty()))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("Failed to read {}", path.display()))
}

fn load_documents(path: &Path, normalizer: &RecordNormalizer) -> Result<Vec<NormalizedDocument>> {
    let start = Instant::now();
    let pb = ProgressBar::new_spinner();
    pb.set_message(format!("Loading {}...", path.display()));

    let lines = read_lines(path)?;
    let docs = normalizer.normalize_lines(&lines);

    pb.finish_with_message(format!(
        "Loaded {} of {} documents in {:.2?}",
        docs.len(),
        lines.len(),
        start.elapsed()
    ));
    info!(path = %path.display(), read = lines.len(), kept = docs.len(), "corpus loaded");
    Ok(docs)
}

fn cmd_hash(
    input: &Path,
    output: &Path,
    entity_vocab: Option<PathBuf>,
    event_vocab: Option<PathBuf>,
    config: HasherConfig,
) -> Result<()> {
    let vocabularies = match (entity_vocab, event_vocab) {
        (Some(entities), Some(events)) => Vocabularies {
            entities: Vocabulary::load(&entities)
                .with_context(|| format!("Failed to load {}", entities.display()))?,
            events: Vocabulary::load(&events)
                .with_context(|| format!("Failed to load {}", events.display()))?,
        },
        (entities, events) => {
            let pb = ProgressBar::new_spinner();
            pb.set_message(format!("Collecting vocabularies from {}...", input.display()));
            let mut collected = Vocabularies::collect(read_lines(input)?);
            if let Some(path) = entities {
                collected.entities = Vocabulary::load(&path)
                    .with_context(|| format!("Failed to load {}", path.display()))?;
            }
            if let Some(path) = events {
                collected.events = Vocabulary::load(&path)
                    .with_context(|| format!("Failed to load {}", path.display()))?;
            }
            pb.finish_with_message(format!(
                "{} entities, {} events",
                collected.entities.len(),
                collected.events.len()
            ));
            collected
        }
    };

    let entity_out = sibling(output, "entities.json");
    let event_out = sibling(output, "events.json");
    vocabularies
        .entities
        .save(&entity_out)
        .with_context(|| format!("Failed to write {}", entity_out.display()))?;
    vocabularies
        .events
        .save(&event_out)
        .with_context(|| format!("Failed to write {}", event_out.display()))?;

    let hasher = CorpusHasher::new(config, vocabularies);
    let reader = BufReader::new(
        File::open(input).with_context(|| format!("Failed to open {}", input.display()))?,
    );
    let writer = BufWriter::new(
        File::create(output).with_context(|| format!("Failed to create {}", output.display()))?,
    );
    let start = Instant::now();
    let stats = hasher
        .hash_corpus(reader, writer)
        .with_context(|| format!("Failed to hash {}", input.display()))?;

    println!("Hashed {} -> {}", input.display(), output.display());
    println!("Read:      {}", stats.read);
    println!("Written:   {}", stats.written);
    println!("Dropped:   {}", stats.dropped);
    println!("Malformed: {}", stats.malformed);
    println!("Done in {:.2?}", start.elapsed());
    Ok(())
}

fn cmd_train(config: &SalixConfig, train: &Path, validation: Option<&Path>, model_path: &Path) -> Result<()> {
    let device = config.backend.device()?;
    let normalizer = RecordNormalizer::new(config.io.clone())?;
    let train_docs = load_documents(train, &normalizer)?;
    let validation_docs = match validation {
        Some(path) => Some(load_documents(path, &normalizer)?),
        None => None,
    };

    let mut model = SalienceModel::new(config.model.clone(), &config.io, &device)
        .context("Failed to build model")?;
    let trainer = Trainer::new(config.training.clone(), &config.io);
    let start = Instant::now();
    let report = trainer.train(
        &mut model,
        &train_docs,
        validation_docs.as_deref(),
        Some(model_path),
    )?;

    println!("Trained {} epochs in {:.2?}", report.epochs_run, start.elapsed());
    if let Some(loss) = report.loss_history.last() {
        println!("Final loss:  {loss:.6}");
    }
    let best = report.validation_history.iter().copied().fold(f32::INFINITY, f32::min);
    if best.is_finite() {
        println!("Best epoch:  {} (validation {best:.6})", report.best_epoch);
    }
    if report.stopped_early {
        println!("Stopped early");
    }
    println!("Model:       {}", model_path.display());
    Ok(())
}

fn cmd_predict(config: &SalixConfig, input: &Path, model_path: &Path, output: &Path) -> Result<()> {
    let device = config.backend.device()?;
    let normalizer = RecordNormalizer::new(config.io.clone())?;
    let docs = load_documents(input, &normalizer)?;

    let mut model = SalienceModel::new(config.model.clone(), &config.io, &device)
        .context("Failed to build model")?;
    model
        .load_checkpoint(model_path)
        .with_context(|| format!("Failed to load {}", model_path.display()))?;

    let predictor = Predictor::new(&model, &config.io, NullEvaluator)
        .with_log_every(config.training.log_every.max(1));
    let writer = BufWriter::new(
        File::create(output).with_context(|| format!("Failed to create {}", output.display()))?,
    );
    let summary = predictor.predict_all(&docs, writer)?;

    let eval_out = eval_path(output);
    write_eval(&eval_out, &summary.metrics)
        .with_context(|| format!("Failed to write {}", eval_out.display()))?;

    println!("Scored {} documents ({} skipped)", summary.documents, summary.skipped);
    println!("Predictions: {}", output.display());
    println!("Metrics:     {}", eval_out.display());
    Ok(())
}

/// `<output>.<suffix>` next to `output`.
fn sibling(output: &Path, suffix: &str) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}
