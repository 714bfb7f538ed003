//! Marginal inference by block Gibbs sampling.
//!
//! Each sweep resamples every block from its conditional distribution
//! `p(setting) ∝ exp(−E(setting))`, where `E` is the weighted
//! incompatibility of the block's incident terms. After `num_burn_in`
//! sweeps the state is recorded `num_samples` times; each atom ends with
//! the fraction of recorded samples in which it was on.

use std::sync::Arc;

use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::{HlmrfResult, ReasonerError};
use crate::reasoner::{OptimizationReport, Reasoner, compute_objective, invalid_config, seeded_rng};
use crate::term::TermStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McSatConfig {
    pub num_samples: usize,
    pub num_burn_in: usize,
    pub seed: Option<u64>,
}

impl Default for McSatConfig {
    fn default() -> Self {
        Self {
            num_samples: 2500,
            num_burn_in: 500,
            seed: None,
        }
    }
}

impl McSatConfig {
    pub fn validate(&self) -> HlmrfResult<()> {
        if self.num_samples == 0 {
            return Err(invalid_config("mc_sat.num_samples must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct McSatReasoner {
    config: McSatConfig,
    rng: StdRng,
}

impl McSatReasoner {
    pub fn new(config: McSatConfig) -> HlmrfResult<Self> {
        config.validate()?;
        let rng = seeded_rng(config.seed);
        Ok(Self { config, rng })
    }
}

/// Draw an index with probability proportional to `exp(−energy)`.
fn sample_setting(energies: &[f64], rng: &mut StdRng) -> usize {
    let lowest = energies.iter().copied().fold(f64::INFINITY, f64::min);
    let weights: Vec<f64> = energies.iter().map(|e| (lowest - e).exp()).collect();
    let total: f64 = weights.iter().sum();
    let mut draw = rng.gen_range(0.0..total);
    for (i, w) in weights.iter().enumerate() {
        if draw < *w {
            return i;
        }
        draw -= w;
    }
    weights.len() - 1
}

impl Reasoner for McSatReasoner {
    fn name(&self) -> &'static str {
        "mc-sat"
    }

    fn optimize(&mut self, store: &mut dyn TermStore) -> HlmrfResult<OptimizationReport> {
        let Some(blocker) = store.as_blocker() else {
            return Err(ReasonerError::StoreMismatch {
                reasoner: "mc-sat".to_string(),
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
        let mut on_counts = vec![0usize; values.len()];
        let sweeps = self.config.num_burn_in + self.config.num_samples;
        tracing::debug!(blocks = blocks.len(), sweeps, "mc sat start");

        let mut energies = Vec::new();
        for sweep in 0..sweeps {
            for block in blocks {
                energies.clear();
                for setting in 0..block.settings() {
                    block.apply(setting, &mut values);
                    energies.push(
                        block
                            .incident
                            .iter()
                            .map(|&t| f64::from(terms[t].weighted_incompatibility(&values)))
                            .sum::<f64>(),
                    );
                }
                let chosen = sample_setting(&energies, &mut self.rng);
                block.apply(chosen, &mut values);
            }
            if sweep >= self.config.num_burn_in {
                for block in blocks {
                    for &atom in &block.atoms {
                        if values[atom as usize] > 0.5 {
                            on_counts[atom as usize] += 1;
                        }
                    }
                }
            }
        }

        for block in blocks {
            for &atom in &block.atoms {
                values[atom as usize] = on_counts[atom as usize] as f32 / self.config.num_samples as f32;
            }
        }

        let mut report = OptimizationReport {
            iterations: sweeps,
            converged: true,
            ..OptimizationReport::default()
        };
        report.movement = atoms.write_back(&values);
        let objective = compute_objective(store, &atoms.values())?;
        report.objective = objective.objective;
        report.violated_constraints = objective.violated_constraints;
        tracing::info!(
            samples = self.config.num_samples,
            objective = report.objective,
            "mc sat finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::AtomStore;
    use crate::model::{AtomKind, Comparator, GroundAtom, PredicateId, RuleId};
    use crate::term::blocker::BlockerTermStore;
    use crate::term::{Shape, Term, TermKind};
    use rand::SeedableRng;

    fn store(n: usize) -> BlockerTermStore {
        let atoms = Arc::new(AtomStore::new());
        for i in 0..n {
            atoms.intern(
                &GroundAtom::new(PredicateId::from_index(0), vec![format!("a{i}").into()]),
                AtomKind::RandomVariable,
                0.0,
            );
        }
        BlockerTermStore::new(atoms)
    }

    fn reasoner() -> McSatReasoner {
        McSatReasoner::new(McSatConfig {
            num_samples: 1000,
            num_burn_in: 100,
            seed: Some(19),
        })
        .unwrap()
    }

    #[test]
    fn strong_evidence_gives_high_marginal() {
        let mut store = store(1);
        store
            .add(Term::new(
                RuleId::new(0),
                vec![0],
                vec![-1.0],
                -1.0,
                TermKind::Potential {
                    weight: 5.0,
                    shape: Shape::Hinge,
                },
            ))
            .unwrap();
        reasoner().optimize(&mut store).unwrap();
        assert!(store.atoms().get_value(0) > 0.9);
    }

    #[test]
    fn exactly_one_marginals_sum_to_one() {
        let mut store = store(3);
        store
            .add(Term::new(
                RuleId::new(0),
                vec![0, 1, 2],
                vec![1.0; 3],
                1.0,
                TermKind::Constraint {
                    comparator: Comparator::Eq,
                },
            ))
            .unwrap();
        let report = reasoner().optimize(&mut store).unwrap();
        let total: f32 = store.atoms().values().iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
        assert_eq!(report.violated_constraints, 0);
    }

    #[test]
    fn sampling_follows_energies() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut hits = 0;
        for _ in 0..2000 {
            if sample_setting(&[0.0, 3.0], &mut rng) == 0 {
                hits += 1;
            }
        }
        // exp(0) / (exp(0) + exp(-3)) is about 0.95.
        assert!(hits > 1800, "{hits}");
    }
}
