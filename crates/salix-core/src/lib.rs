//! Host-side data model for salience scoring.
//!
//! A document arrives as one JSON line of pre-annotated spots: entity ids,
//! frequencies, optional explicit features and optional gold labels. Before
//! any model sees it, two things have to happen:
//!
//! 1. **Normalization** turns the loose record into canonical parallel
//!    arrays: kept ids (top-K by frequency, stable ties), weights that sum
//!    to one, fixed-width feature rows and `+1/-1` labels.
//! 2. **Assembly** pads a list of normalized documents into rectangular
//!    buffers and records a validity mask for every ragged axis.
//!
//! ```text
//!  JSON line ──► RecordNormalizer ──► NormalizedDocument ──┐
//!                      │                                   ├─► BatchAssembler ──► Batch
//!                      └─► Skipped(Empty | Malformed)      │      (padded arrays + masks)
//!  JSON line ──► RecordNormalizer ──► NormalizedDocument ──┘
//! ```
//!
//! ## Input groups
//!
//! | Group | Node axis | Extra arrays |
//! |-------|-----------|--------------|
//! | `EntityRaw` | entities | weights |
//! | `EntityFeature` | entities | weights, features |
//! | `EventRaw` | events (lexical head ids) | weights |
//! | `EventFeature` | events | weights, features |
//! | `Joint` | entities then offset events | weights, `[entity \| event]` features |
//! | `JointGraph` | entities, events on their own axis | arguments, adjacency |
//!
//! ## Padding and masks
//!
//! Pad value is always `0`, which is also the "unknown" id. Masks are never
//! derived by comparing against the pad value; they come from the recorded
//! pre-padding lengths, so a real feature value of `0.0` stays valid.
//!
//! ## Hashing
//!
//! [`hashing::CorpusHasher`] converts raw annotated documents (string ids)
//! into the packed, integer-id format the normalizer reads, using an
//! explicit [`vocab::Vocabulary`] built in a separate pass.

pub mod batch;
pub mod error;
pub mod hashing;
pub mod normalize;
pub mod record;
pub mod vocab;

pub use batch::{ArraySpec, Batch, BatchAssembler, DType, Field, PaddedArray};
pub use error::{Error, Result};
pub use hashing::{CorpusHasher, HashStats, HasherConfig, Vocabularies};
pub use normalize::{InputGroup, Normalized, NormalizerConfig, RecordNormalizer, SkipReason};
pub use record::{DocKey, EventRecord, Label, NodeRecord, NormalizedDocument};
pub use vocab::{Vocabulary, VocabularyBuilder, UNK_TOKEN};
