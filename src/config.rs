//! TOML inference configuration.
//!
//! Every section is optional and falls back to its defaults:
//!
//! ```toml
//! [reasoner]
//! kind = "admm"
//!
//! [admm]
//! max_iterations = 25000
//! epsilon_abs = 1e-5
//!
//! [term_store]
//! kind = "streaming"
//! page_size = 10000
//!
//! [lazy]
//! activation_threshold = 0.05
//!
//! [evaluation]
//! threshold = 0.5
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, HlmrfResult, ReasonerError};
use crate::evaluation::EvaluationConfig;
use crate::lazy::LazyConfig;
use crate::reasoner::{
    AdmmConfig, DualBcdConfig, McSatConfig, MaxWalkSatConfig, ReasonerKind, SgdConfig,
};
use crate::term::GeneratorConfig;
use crate::term::streaming::PagingConfig;

/// `[reasoner]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasonerSection {
    pub kind: ReasonerKind,
}

/// Where ground terms live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TermStoreKind {
    #[default]
    Memory,
    Streaming,
    Online,
}

impl std::fmt::Display for TermStoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TermStoreKind::Memory => "memory",
            TermStoreKind::Streaming => "streaming",
            TermStoreKind::Online => "online",
        })
    }
}

/// `[term_store]` section. Paging keys apply to the streaming and online
/// stores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TermStoreSection {
    pub kind: TermStoreKind,
    #[serde(flatten)]
    pub paging: PagingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub reasoner: ReasonerSection,
    pub admm: AdmmConfig,
    pub sgd: SgdConfig,
    pub dual_bcd: DualBcdConfig,
    pub max_walk_sat: MaxWalkSatConfig,
    pub mc_sat: McSatConfig,
    pub term_store: TermStoreSection,
    pub generator: GeneratorConfig,
    pub lazy: LazyConfig,
    pub evaluation: EvaluationConfig,
}

impl InferenceConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> HlmrfResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config = Self::from_toml(&content, &path.display().to_string())?;
        tracing::debug!(path = %path.display(), reasoner = %config.reasoner.kind, "loaded config");
        Ok(config)
    }

    /// Parse and validate TOML text. `origin` names the source in errors.
    pub fn from_toml(content: &str, origin: &str) -> HlmrfResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> HlmrfResult<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::Parse {
                path: "<serialize>".to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Set the worker count of every threaded reasoner.
    pub fn set_threads(&mut self, threads: usize) {
        self.admm.num_threads = threads;
        self.dual_bcd.num_threads = threads;
    }

    /// Check every section and the reasoner/term store pairing.
    pub fn validate(&self) -> HlmrfResult<()> {
        self.admm.validate()?;
        self.sgd.validate()?;
        self.dual_bcd.validate()?;
        self.max_walk_sat.validate()?;
        self.mc_sat.validate()?;
        self.lazy.validate()?;
        self.evaluation.validate()?;
        if self.term_store.paging.page_size == 0 {
            return Err(ReasonerError::InvalidConfig {
                message: "term_store.page_size must be positive".to_string(),
            }
            .into());
        }
        match (self.reasoner.kind, self.term_store.kind) {
            (ReasonerKind::MaxWalkSat | ReasonerKind::McSat, kind) if kind != TermStoreKind::Memory => {
                Err(ReasonerError::StoreMismatch {
                    reasoner: self.reasoner.kind.to_string(),
                    required: "memory (blocker)".to_string(),
                }
                .into())
            }
            (ReasonerKind::DualBcd, TermStoreKind::Online) => Err(ReasonerError::StoreMismatch {
                reasoner: self.reasoner.kind.to_string(),
                required: "memory or streaming (dual)".to_string(),
            }
            .into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HlmrfError;
    use tempfile::TempDir;

    #[test]
    fn empty_document_is_all_defaults() {
        let config = InferenceConfig::from_toml("", "inline").unwrap();
        assert_eq!(config, InferenceConfig::default());
        assert_eq!(config.admm.max_iterations, 25_000);
        assert_eq!(config.dual_bcd.compute_period, 10);
        assert_eq!(config.max_walk_sat.max_flips, 50_000);
        assert_eq!(config.term_store.paging.page_size, 10_000);
        assert_eq!(config.lazy.max_rounds, 100);
        assert_eq!(config.evaluation.threshold, 0.5);
    }

    #[test]
    fn sections_override_defaults() {
        let config = InferenceConfig::from_toml(
            r#"
            [reasoner]
            kind = "sgd"

            [sgd]
            learning_rate = 0.5
            seed = 4

            [term_store]
            kind = "streaming"
            page_size = 128
            shuffle_pages = true

            [generator]
            invert_negative_weights = true
            "#,
            "inline",
        )
        .unwrap();
        assert_eq!(config.reasoner.kind, ReasonerKind::Sgd);
        assert_eq!(config.sgd.learning_rate, 0.5);
        assert_eq!(config.sgd.seed, Some(4));
        assert_eq!(config.sgd.max_iterations, 200);
        assert_eq!(config.term_store.kind, TermStoreKind::Streaming);
        assert_eq!(config.term_store.paging.page_size, 128);
        assert!(config.term_store.paging.shuffle_pages);
        assert!(config.generator.invert_negative_weights);
    }

    #[test]
    fn invalid_values_fail_fast() {
        let err = InferenceConfig::from_toml("[admm]\nstep_size = 0.0\n", "inline").unwrap_err();
        assert!(matches!(err, HlmrfError::Reasoner(ReasonerError::InvalidConfig { .. })));
        let err = InferenceConfig::from_toml("[lazy]\nactivation_threshold = 0.0\n", "inline")
            .unwrap_err();
        assert!(matches!(err, HlmrfError::Reasoner(ReasonerError::InvalidConfig { .. })));
        let err = InferenceConfig::from_toml("[evaluation]\nthreshold = 2.0\n", "inline").unwrap_err();
        assert!(matches!(err, HlmrfError::Reasoner(ReasonerError::InvalidConfig { .. })));
        let err = InferenceConfig::from_toml("[admm\n", "inline").unwrap_err();
        assert!(matches!(err, HlmrfError::Config(ConfigError::Parse { .. })));
    }

    #[test]
    fn discrete_reasoners_need_memory_store() {
        let err = InferenceConfig::from_toml(
            "[reasoner]\nkind = \"max-walk-sat\"\n[term_store]\nkind = \"streaming\"\n",
            "inline",
        )
        .unwrap_err();
        assert!(matches!(err, HlmrfError::Reasoner(ReasonerError::StoreMismatch { .. })));
    }

    #[test]
    fn load_reads_file_and_reports_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hlmrf.toml");
        std::fs::write(&path, "[dual_bcd]\nregularization = 0.1\n").unwrap();
        let config = InferenceConfig::load(&path).unwrap();
        assert_eq!(config.dual_bcd.regularization, 0.1);

        let err = InferenceConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, HlmrfError::Config(ConfigError::Read { .. })));
    }

    #[test]
    fn config_round_trips_through_toml() {
        let mut config = InferenceConfig::default();
        config.set_threads(3);
        let text = config.to_toml().unwrap();
        assert_eq!(InferenceConfig::from_toml(&text, "inline").unwrap(), config);
    }
}
