//! Projected stochastic subgradient descent.
//!
//! Each pass visits every term once, in a shuffled order within each page,
//! and moves the term's atoms against the subgradient of its potential with
//! learning rate `learning_rate / iteration`, clamping to `[0, 1]`. Hard
//! constraints are handled by projecting a violated term's atoms back onto
//! its hyperplane. No per-term state is kept.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::HlmrfResult;
use crate::model::Comparator;
use crate::model::atom::clamp_value;
use crate::reasoner::{OptimizationReport, Reasoner, compute_objective, invalid_config, seeded_rng};
use crate::term::{CursorMode, ScratchKind, Term, TermKind, TermStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgdConfig {
    pub max_iterations: usize,
    /// Stop once the objective changes by less than this between passes.
    pub tolerance: f64,
    pub learning_rate: f32,
    pub objective_break: bool,
    /// Stop once the RMS movement of a pass falls below this.
    pub movement_threshold: f32,
    /// Seed for the term order; `None` draws one from the OS.
    pub seed: Option<u64>,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-6,
            learning_rate: 1.0,
            objective_break: true,
            movement_threshold: 0.05,
            seed: None,
        }
    }
}

impl SgdConfig {
    pub fn validate(&self) -> HlmrfResult<()> {
        if self.max_iterations == 0 {
            return Err(invalid_config("sgd.max_iterations must be positive"));
        }
        if !(self.tolerance >= 0.0) {
            return Err(invalid_config("sgd.tolerance must not be negative"));
        }
        if !(self.learning_rate > 0.0) {
            return Err(invalid_config("sgd.learning_rate must be positive"));
        }
        if !(self.movement_threshold >= 0.0) {
            return Err(invalid_config("sgd.movement_threshold must not be negative"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct SgdReasoner {
    config: SgdConfig,
    rng: StdRng,
}

impl SgdReasoner {
    pub fn new(config: SgdConfig) -> HlmrfResult<Self> {
        config.validate()?;
        let rng = seeded_rng(config.seed);
        Ok(Self { config, rng })
    }
}

impl Reasoner for SgdReasoner {
    fn name(&self) -> &'static str {
        "sgd"
    }

    fn optimize(&mut self, store: &mut dyn TermStore) -> HlmrfResult<OptimizationReport> {
        store.refresh()?;
        store.prepare_scratch(ScratchKind::None)?;
        let atoms = Arc::clone(store.atoms());
        let mut values = atoms.values();
        let variables = atoms.random_variables().len().max(1);

        let mut objective = compute_objective(store, &values)?.objective;
        let mut report = OptimizationReport::default();
        tracing::debug!(terms = store.len(), objective, "sgd start");

        for iteration in 1..=self.config.max_iterations {
            report.iterations = iteration;
            let rate = self.config.learning_rate / iteration as f32;
            let before = values.clone();
            let rng = &mut self.rng;
            store.visit_pages(CursorMode::ReadOnly, &mut |page| {
                let mut order: Vec<usize> = (0..page.terms.len()).collect();
                order.shuffle(&mut *rng);
                for i in order {
                    step(&page.terms[i], &mut values, rate);
                }
                Ok(())
            })?;

            let moved: f64 = before
                .iter()
                .zip(&values)
                .map(|(a, b)| f64::from(a - b).powi(2))
                .sum();
            let movement = (moved / variables as f64).sqrt() as f32;
            let previous = objective;
            objective = compute_objective(store, &values)?.objective;
            tracing::trace!(iteration, objective, movement, "sgd pass");

            if self.config.objective_break && (objective - previous).abs() < self.config.tolerance {
                report.converged = true;
                break;
            }
            if movement < self.config.movement_threshold {
                report.converged = true;
                break;
            }
        }

        report.movement = atoms.write_back(&values);
        let final_objective = compute_objective(store, &values)?;
        report.objective = final_objective.objective;
        report.violated_constraints = final_objective.violated_constraints;
        if report.converged {
            tracing::info!(iterations = report.iterations, objective = report.objective, "sgd converged");
        } else {
            tracing::warn!(
                iterations = report.iterations,
                objective = report.objective,
                "sgd hit the iteration cap without converging"
            );
        }
        Ok(report)
    }
}

/// One subgradient step on `term`, or a projection when it is a violated
/// constraint.
fn step(term: &Term, values: &mut [f32], rate: f32) {
    let distance = term.dot(values) - term.constant;
    match term.kind {
        TermKind::Constraint { comparator } => {
            let violated = match comparator {
                Comparator::Eq => distance != 0.0,
                Comparator::Lte => distance > 0.0,
                Comparator::Gte => distance < 0.0,
            };
            let norm: f32 = term.coefficients.iter().map(|c| c * c).sum();
            if violated && norm > 0.0 {
                let scale = distance / norm;
                for (&atom, c) in term.atoms.iter().zip(&term.coefficients) {
                    let v = &mut values[atom as usize];
                    *v = clamp_value(*v - scale * c);
                }
            }
        }
        TermKind::Potential { weight, shape } => {
            if shape.is_hinge() && distance <= 0.0 {
                return;
            }
            let slope = if shape.is_squared() {
                2.0 * weight * distance
            } else {
                weight
            };
            for (&atom, c) in term.atoms.iter().zip(&term.coefficients) {
                let v = &mut values[atom as usize];
                *v = clamp_value(*v - rate * slope * c);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::AtomStore;
    use crate::model::{AtomKind, GroundAtom, PredicateId, RuleId};
    use crate::term::Shape;
    use crate::term::memory::MemoryTermStore;

    fn store(terms: Vec<Term>, atoms: usize) -> MemoryTermStore {
        let store_atoms = Arc::new(AtomStore::new());
        for i in 0..atoms {
            store_atoms.intern(
                &GroundAtom::new(PredicateId::from_index(0), vec![format!("a{i}").into()]),
                AtomKind::RandomVariable,
                0.0,
            );
        }
        let mut store = MemoryTermStore::new(store_atoms);
        for term in terms {
            store.add(term).unwrap();
        }
        store
    }

    fn seeded() -> SgdReasoner {
        SgdReasoner::new(SgdConfig {
            seed: Some(7),
            movement_threshold: 0.0,
            ..SgdConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn hinge_pushes_target_up() {
        let mut store = store(
            vec![Term::new(
                RuleId::new(0),
                vec![0],
                vec![-1.0],
                -1.0,
                TermKind::Potential {
                    weight: 5.0,
                    shape: Shape::SquaredHinge,
                },
            )],
            1,
        );
        let report = seeded().optimize(&mut store).unwrap();
        assert!(report.converged);
        assert!((store.atoms().get_value(0) - 1.0).abs() < 1e-4);
        assert!(report.objective < 1e-6);
    }

    #[test]
    fn violated_constraint_is_projected() {
        let mut values = vec![0.9, 0.9];
        let term = Term::new(
            RuleId::new(0),
            vec![0, 1],
            vec![1.0, 1.0],
            1.0,
            TermKind::Constraint {
                comparator: Comparator::Lte,
            },
        );
        step(&term, &mut values, 1.0);
        assert!((values[0] + values[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn satisfied_hinge_does_not_move() {
        let mut values = vec![0.2];
        let term = Term::new(
            RuleId::new(0),
            vec![0],
            vec![1.0],
            0.5,
            TermKind::Potential {
                weight: 1.0,
                shape: Shape::Hinge,
            },
        );
        step(&term, &mut values, 1.0);
        assert_eq!(values[0], 0.2);
    }

    #[test]
    fn rejects_bad_learning_rate() {
        assert!(
            SgdReasoner::new(SgdConfig {
                learning_rate: 0.0,
                ..SgdConfig::default()
            })
            .is_err()
        );
    }
}
