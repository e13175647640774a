//! Immutable name → id tables.
//!
//! A [`Vocabulary`] is a build artifact: [`VocabularyBuilder`] collects names
//! in a first pass over a corpus, `build()` freezes them, and the frozen table
//! is threaded into the [`crate::CorpusHasher`]. Id 0 is always [`UNK_TOKEN`],
//! which doubles as the padding id.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Name reserved for id 0.
pub const UNK_TOKEN: &str = "UNK";

/// Frozen name → id mapping. Serialized as the list of names in id order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Vocabulary {
    names: Vec<String>,
    index: HashMap<String, u32>,
}

impl Vocabulary {
    /// Id of `name`, or 0 when unknown.
    pub fn id(&self, name: &str) -> u32 {
        self.get(name).unwrap_or(0)
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.index.get(name).copied()
    }

    pub fn name(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    /// Number of ids, including UNK.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True when the table holds only UNK.
    pub fn is_empty(&self) -> bool {
        self.names.len() <= 1
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }
}

impl TryFrom<Vec<String>> for Vocabulary {
    type Error = Error;

    fn try_from(names: Vec<String>) -> Result<Self> {
        if names.first().map(String::as_str) != Some(UNK_TOKEN) {
            return Err(Error::InvalidConfig(format!(
                "vocabulary must start with {UNK_TOKEN}"
            )));
        }
        let mut index = HashMap::with_capacity(names.len());
        for (id, name) in names.iter().enumerate() {
            if index.insert(name.clone(), id as u32).is_some() {
                return Err(Error::InvalidConfig(format!(
                    "duplicate vocabulary entry {name:?}"
                )));
            }
        }
        Ok(Self { names, index })
    }
}

impl From<Vocabulary> for Vec<String> {
    fn from(vocab: Vocabulary) -> Self {
        vocab.names
    }
}

/// Collects names in first-appearance order.
#[derive(Debug, Clone, Default)]
pub struct VocabularyBuilder {
    order: Vec<String>,
    counts: HashMap<String, usize>,
    min_count: usize,
}

impl VocabularyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop names seen fewer than `n` times (default: keep all).
    pub fn with_min_count(mut self, n: usize) -> Self {
        self.min_count = n;
        self
    }

    pub fn add(&mut self, name: &str) {
        if name == UNK_TOKEN {
            return;
        }
        match self.counts.get_mut(name) {
            Some(c) => *c += 1,
            None => {
                self.counts.insert(name.to_string(), 1);
                self.order.push(name.to_string());
            }
        }
    }

    pub fn build(self) -> Vocabulary {
        let mut names = Vec::with_capacity(self.order.len() + 1);
        let mut index = HashMap::with_capacity(self.order.len() + 1);
        names.push(UNK_TOKEN.to_string());
        index.insert(UNK_TOKEN.to_string(), 0);
        for name in self.order {
            if self.counts.get(&name).copied().unwrap_or(0) >= self.min_count {
                index.insert(name.clone(), names.len() as u32);
                names.push(name);
            }
        }
        Vocabulary { names, index }
    }
}
