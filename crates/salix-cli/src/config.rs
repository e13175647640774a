//! Run configuration: one JSON file with `io`, `model` and `training` sections.

use anyhow::{bail, Context, Result};
use salix_core::NormalizerConfig;
use salix_nn::{Backend, ModelConfig, TrainingConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SalixConfig {
    pub io: NormalizerConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub backend: Backend,
}

impl SalixConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Startup checks; any failure is fatal.
    pub fn validate(&self) -> Result<()> {
        self.io.validate().context("invalid io section")?;
        self.model.validate().context("invalid model section")?;
        self.training.validate().context("invalid training section")?;
        if !self.model.kind.accepts(self.io.input) {
            bail!(
                "model kind {:?} cannot score input group {:?}",
                self.model.kind,
                self.io.input
            );
        }
        let feature_dim = self.io.node_feature_dim();
        if self.model.node_feature_dim != feature_dim {
            bail!(
                "model.node_feature_dim is {} but input group {:?} produces {} feature columns",
                self.model.node_feature_dim,
                self.io.input,
                feature_dim
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use salix_core::InputGroup;
    use salix_nn::{LossKind, ModelKind};

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: SalixConfig = serde_json::from_str(
            r#"{
                "io": {"input": "entity_feature", "entity_feature_dim": 3, "max_entities_per_doc": 50},
                "model": {"kind": "propagation", "number_of_layers": 2, "node_feature_dim": 3, "entity_vocab_size": 100},
                "training": {"number_of_epochs": 4, "loss": "pairwise"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.io.input, InputGroup::EntityFeature);
        assert_eq!(config.io.max_entities_per_doc, 50);
        assert_eq!(config.model.kind, ModelKind::Propagation);
        assert_eq!(config.model.number_of_hops, 2);
        assert_eq!(config.training.epochs, 4);
        assert_eq!(config.training.loss, LossKind::Pairwise);
        assert_eq!(config.backend, Backend::Cpu);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_feature_width_is_checked() {
        let mut config = SalixConfig::default();
        config.model.entity_vocab_size = 10;
        config.io = config.io.with_input(InputGroup::EntityFeature).with_entity_feature_dim(2);
        assert!(config.validate().is_err());
        config.model.node_feature_dim = 2;
        assert!(config.validate().is_ok());
    }
}
