//! MaxWalkSat over blocks of Boolean random variables.
//!
//! Starts from a random block assignment, then repeatedly picks an
//! unsatisfied weighted term and flips one of its blocks: with probability
//! `noise` to a random setting, otherwise to the setting of the touched
//! blocks that minimizes the weighted incompatibility of the block's
//! incident terms. Stops once every weighted term is satisfied or after
//! `max_flips` flips. Hard constraints are honored through the blocks.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::{HlmrfResult, ReasonerError};
use crate::reasoner::{OptimizationReport, Reasoner, compute_objective, invalid_config, seeded_rng};
use crate::term::blocker::Block;
use crate::term::{Term, TermStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxWalkSatConfig {
    pub max_flips: usize,
    /// Probability of a random flip instead of a greedy one.
    pub noise: f64,
    pub seed: Option<u64>,
}

impl Default for MaxWalkSatConfig {
    fn default() -> Self {
        Self {
            max_flips: 50_000,
            noise: 0.01,
            seed: None,
        }
    }
}

impl MaxWalkSatConfig {
    pub fn validate(&self) -> HlmrfResult<()> {
        if self.max_flips == 0 {
            return Err(invalid_config("max_walk_sat.max_flips must be positive"));
        }
        if !(0.0..=1.0).contains(&self.noise) {
            return Err(invalid_config("max_walk_sat.noise must be in [0, 1]"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct MaxWalkSatReasoner {
    config: MaxWalkSatConfig,
    rng: StdRng,
}

/// Unsatisfied weighted terms with constant-time insert, remove and pick.
struct UnsatSet {
    members: Vec<usize>,
    position: Vec<Option<usize>>,
}

impl UnsatSet {
    fn new(terms: usize) -> Self {
        Self {
            members: Vec::new(),
            position: vec![None; terms],
        }
    }

    fn set(&mut self, term: usize, unsatisfied: bool) {
        match (self.position[term], unsatisfied) {
            (None, true) => {
                self.position[term] = Some(self.members.len());
                self.members.push(term);
            }
            (Some(at), false) => {
                self.members.swap_remove(at);
                if let Some(&moved) = self.members.get(at) {
                    self.position[moved] = Some(at);
                }
                self.position[term] = None;
            }
            _ => {}
        }
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn len(&self) -> usize {
        self.members.len()
    }

    fn pick(&self, rng: &mut StdRng) -> usize {
        self.members[rng.gen_range(0..self.members.len())]
    }
}

/// Weighted incompatibility of the terms incident to `block`.
fn block_energy(block: &Block, terms: &[Term], values: &[f32]) -> f64 {
    block
        .incident
        .iter()
        .map(|&t| f64::from(terms[t].weighted_incompatibility(values)))
        .sum()
}

impl MaxWalkSatReasoner {
    pub fn new(config: MaxWalkSatConfig) -> HlmrfResult<Self> {
        config.validate()?;
        let rng = seeded_rng(config.seed);
        Ok(Self { config, rng })
    }
}

impl Reasoner for MaxWalkSatReasoner {
    fn name(&self) -> &'static str {
        "max-walk-sat"
    }

    fn optimize(&mut self, store: &mut dyn TermStore) -> HlmrfResult<OptimizationReport> {
        let Some(blocker) = store.as_blocker() else {
            return Err(ReasonerError::StoreMismatch {
                reasoner: "max-walk-sat".to_string(),
                required: "blocker".to_string(),
            }
            .into());
        };
        blocker.refresh()?;
        let atoms = Arc::clone(blocker.atoms());
        let mut values = atoms.values();
        blocker.randomly_initialize(&mut self.rng, &mut values);

        let terms = blocker.term_slice();
        let blocks = blocker.blocks();
        let mut unsat = UnsatSet::new(terms.len());
        for (index, term) in terms.iter().enumerate() {
            if !term.is_constraint() {
                unsat.set(index, term.weighted_incompatibility(&values) > 0.0);
            }
        }
        tracing::debug!(
            blocks = blocks.len(),
            unsatisfied = unsat.len(),
            "max walk sat start"
        );

        let mut report = OptimizationReport::default();
        for flip in 1..=self.config.max_flips {
            if unsat.is_empty() {
                report.converged = true;
                break;
            }
            report.iterations = flip;

            let term = &terms[unsat.pick(&mut self.rng)];
            let candidates: Vec<usize> = term
                .atoms
                .iter()
                .filter_map(|&a| blocker.block_of(a))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if candidates.is_empty() {
                continue;
            }

            let (chosen, setting) = if self.rng.gen_bool(self.config.noise) {
                let chosen = candidates[self.rng.gen_range(0..candidates.len())];
                let block = &blocks[chosen];
                let setting = if block.exactly_one && block.settings() > 1 {
                    let current = block.current(&values);
                    let drawn = self.rng.gen_range(0..block.settings() - 1);
                    if drawn >= current { drawn + 1 } else { drawn }
                } else {
                    self.rng.gen_range(0..block.settings())
                };
                (chosen, setting)
            } else {
                let mut best = (candidates[0], blocks[candidates[0]].current(&values), f64::INFINITY);
                'search: for &candidate in &candidates {
                    let block = &blocks[candidate];
                    let current = block.current(&values);
                    for setting in 0..block.settings() {
                        block.apply(setting, &mut values);
                        let energy = block_energy(block, terms, &values);
                        if energy < best.2 {
                            best = (candidate, setting, energy);
                        }
                        if energy == 0.0 {
                            block.apply(current, &mut values);
                            break 'search;
                        }
                    }
                    block.apply(current, &mut values);
                }
                (best.0, best.1)
            };

            let block = &blocks[chosen];
            block.apply(setting, &mut values);
            for &t in &block.incident {
                unsat.set(t, terms[t].weighted_incompatibility(&values) > 0.0);
            }
        }
        if unsat.is_empty() {
            report.converged = true;
        }

        report.movement = atoms.write_back(&values);
        let objective = compute_objective(store, &atoms.values())?;
        report.objective = objective.objective;
        report.violated_constraints = objective.violated_constraints;
        tracing::info!(
            flips = report.iterations,
            objective = report.objective,
            satisfied = report.converged,
            "max walk sat finished"
        );
        Ok(report)
    }
}
