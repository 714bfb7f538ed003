//! Lazy MAP inference.
//!
//! Open-predicate atoms that the database does not hold are left out of the
//! grounding queries. Grounding still references them as random variables
//! (through rule heads, for instance), and optimization may push some of them
//! up. After each round the ones at or above `activation_threshold` are
//! stored, which lets the rules that query their predicate ground the
//! substitutions they now match. Rounds repeat until nothing is activated or
//! `max_rounds` is reached.

use serde::{Deserialize, Serialize};

use crate::error::HlmrfResult;
use crate::model::GroundAtom;
use crate::reasoner::{OptimizationReport, Reasoner, invalid_config};
use crate::term::TermStore;
use crate::term::online::OnlineTermStore;

/// `[lazy]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LazyConfig {
    pub max_rounds: usize,
    /// Smallest inferred value that activates an atom.
    pub activation_threshold: f32,
}

impl Default for LazyConfig {
    fn default() -> Self {
        Self {
            max_rounds: 100,
            activation_threshold: 0.01,
        }
    }
}

impl LazyConfig {
    pub fn validate(&self) -> HlmrfResult<()> {
        if self.max_rounds == 0 {
            return Err(invalid_config("lazy.max_rounds must be positive"));
        }
        if !(self.activation_threshold > 0.0 && self.activation_threshold <= 1.0) {
            return Err(invalid_config("lazy.activation_threshold must be in (0, 1]"));
        }
        Ok(())
    }
}

/// Outcome of [`LazyInference::run`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct LazyReport {
    pub rounds: usize,
    /// Atoms activated over all rounds.
    pub activated: usize,
    /// The last round activated nothing, so the ground model stopped growing.
    pub converged: bool,
    /// Report of the last optimization.
    pub optimization: OptimizationReport,
    /// Every random variable with its inferred value.
    #[serde(skip)]
    pub targets: Vec<(GroundAtom, f32)>,
}

impl std::fmt::Display for LazyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} after {} round(s), {} atom(s) activated; {}",
            if self.converged { "complete" } else { "round limit" },
            self.rounds,
            self.activated,
            self.optimization
        )
    }
}

pub struct LazyInference {
    store: OnlineTermStore,
    reasoner: Box<dyn Reasoner>,
    config: LazyConfig,
}

impl LazyInference {
    pub fn new(store: OnlineTermStore, reasoner: Box<dyn Reasoner>, config: LazyConfig) -> HlmrfResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            reasoner,
            config,
        })
    }

    pub fn store(&self) -> &OnlineTermStore {
        &self.store
    }

    /// Optimize and activate until the ground model stops growing.
    pub fn run(&mut self) -> HlmrfResult<LazyReport> {
        let mut report = LazyReport::default();
        loop {
            report.rounds += 1;
            report.optimization = self.reasoner.optimize(&mut self.store)?;
            let activated = self.activate()?;
            report.activated += activated;
            tracing::info!(
                round = report.rounds,
                activated,
                terms = self.store.len(),
                objective = report.optimization.objective,
                movement = report.optimization.movement,
                "lazy round finished"
            );
            if activated == 0 {
                report.converged = true;
                break;
            }
            if report.rounds >= self.config.max_rounds {
                tracing::warn!(
                    rounds = report.rounds,
                    pending = activated,
                    "lazy inference hit its round limit"
                );
                // Ground the last activations so the database leaves no atom
                // in a special partition.
                self.store.refresh()?;
                break;
            }
        }
        report.targets = self.store.atoms().sync();
        report.targets.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(report)
    }

    /// Store the random variables missing from the database whose value
    /// reached the threshold. Returns how many were stored.
    fn activate(&mut self) -> HlmrfResult<usize> {
        let atoms = self.store.atoms();
        let database = self.store.database();
        let batch: Vec<(GroundAtom, f32)> = atoms
            .random_variables()
            .into_iter()
            .filter_map(|index| {
                let value = atoms.get_value(index);
                if value < self.config.activation_threshold {
                    return None;
                }
                let atom = atoms.get_atom(index).atom;
                (!database.contains(&atom)).then_some((atom, value))
            })
            .collect();
        if batch.is_empty() {
            return Ok(0);
        }
        self.store.activate_atoms(&batch)
    }

    /// Release the term store.
    pub fn close(mut self) -> HlmrfResult<()> {
        self.store.close()
    }
}

impl std::fmt::Debug for LazyInference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyInference")
            .field("reasoner", &self.reasoner.name())
            .field("config", &self.config)
            .field("terms", &self.store.len())
            .finish()
    }
}
