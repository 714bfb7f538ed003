//! Ground rule → hyperplane term.
//!
//! A logical ground rule `b₁ ∧ … ∧ bₙ → h₁ ∨ … ∨ hₘ` has distance to
//! satisfaction `max(0, c·x − k)` with coefficient `+1` for positive body and
//! negated head atoms, `−1` for negated body and positive head atoms, and
//! `k = |positive body| + |negated head| − 1`. Arithmetic ground rules are
//! already linear. Observed atoms are folded into the constant, repeated
//! atoms have their coefficients summed, and `>=` is rewritten as a negated
//! `<=` so reasoners only see `<=` and `=`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::database::AtomStore;
use crate::error::{HlmrfResult, TermError};
use crate::grounding::GroundRule;
use crate::model::Comparator;
use crate::term::{CONSTRAINT_TOLERANCE, Shape, Term, TermKind};

/// Generator options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Negate the hyperplane of negatively weighted rules instead of failing.
    pub invert_negative_weights: bool,
    /// Drop terms without random variables, zero-weight potentials and
    /// hinges or constraints that hold for every assignment.
    pub drop_trivial: bool,
    /// Emit hinges that are active for every assignment as linear terms.
    pub drop_redundant_hinges: bool,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            invert_negative_weights: false,
            drop_trivial: true,
            drop_redundant_hinges: false,
        }
    }
}

/// Turns ground rules into terms.
#[derive(Debug, Clone, Default)]
pub struct TermGenerator {
    config: GeneratorConfig,
}

/// Linear form under construction.
struct Hyperplane {
    atoms: Vec<u32>,
    coefficients: Vec<f32>,
    slots: HashMap<u32, usize>,
    constant: f32,
}

impl Hyperplane {
    fn new(constant: f32) -> Self {
        Self {
            atoms: Vec::new(),
            coefficients: Vec::new(),
            slots: HashMap::new(),
            constant,
        }
    }

    /// Add `coefficient · x[atom]`, folding observations into the constant.
    fn add(&mut self, atoms: &AtomStore, atom: u32, coefficient: f32) {
        if !atoms.is_random_variable(atom) {
            self.constant -= coefficient * atoms.get_value(atom);
            return;
        }
        match self.slots.get(&atom) {
            Some(&slot) => self.coefficients[slot] += coefficient,
            None => {
                self.slots.insert(atom, self.atoms.len());
                self.atoms.push(atom);
                self.coefficients.push(coefficient);
            }
        }
    }

    fn negate(&mut self) {
        for c in &mut self.coefficients {
            *c = -*c;
        }
        self.constant = -self.constant;
    }

    fn is_finite(&self) -> bool {
        self.constant.is_finite() && self.coefficients.iter().all(|c| c.is_finite())
    }

    fn drop_zeros(&mut self) {
        let (atoms, coefficients): (Vec<u32>, Vec<f32>) = self
            .atoms
            .iter()
            .zip(&self.coefficients)
            .filter(|(_, c)| **c != 0.0)
            .map(|(a, c)| (*a, *c))
            .unzip();
        self.atoms = atoms;
        self.coefficients = coefficients;
    }

    /// Largest value of `c·x` over the unit box.
    fn max_over_box(&self) -> f32 {
        self.coefficients.iter().map(|c| c.max(0.0)).sum()
    }

    /// Smallest value of `c·x` over the unit box.
    fn min_over_box(&self) -> f32 {
        self.coefficients.iter().map(|c| c.min(0.0)).sum()
    }
}

impl TermGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Build the term for one ground rule, or `None` when it is dropped.
    pub fn generate(&self, atoms: &AtomStore, ground: &GroundRule) -> HlmrfResult<Option<Term>> {
        let (mut plane, comparator, weight, squared) = match ground {
            GroundRule::Logical {
                weight,
                squared,
                body,
                head,
                ..
            } => {
                let positive = body.iter().filter(|l| !l.negated).count()
                    + head.iter().filter(|l| l.negated).count();
                let mut plane = Hyperplane::new(positive as f32 - 1.0);
                for literal in body {
                    plane.add(atoms, literal.atom, if literal.negated { -1.0 } else { 1.0 });
                }
                for literal in head {
                    plane.add(atoms, literal.atom, if literal.negated { 1.0 } else { -1.0 });
                }
                (plane, Comparator::Lte, *weight, *squared)
            }
            GroundRule::Arithmetic {
                weight,
                squared,
                summands,
                comparator,
                constant,
                ..
            } => {
                let mut plane = Hyperplane::new(*constant);
                for &(coefficient, atom) in summands {
                    plane.add(atoms, atom, coefficient);
                }
                (plane, *comparator, *weight, *squared)
            }
        };

        if !plane.is_finite() {
            return Err(TermError::UnsupportedShape {
                ground_rule: ground.describe(atoms),
                reason: "non-finite coefficient or constant".into(),
            }
            .into());
        }
        plane.drop_zeros();

        let comparator = if comparator == Comparator::Gte {
            plane.negate();
            Comparator::Lte
        } else {
            comparator
        };

        match weight {
            Some(weight) => self.potential(atoms, ground, plane, comparator, weight, squared),
            None => self.constraint(atoms, ground, plane, comparator),
        }
    }

    fn potential(
        &self,
        atoms: &AtomStore,
        ground: &GroundRule,
        mut plane: Hyperplane,
        comparator: Comparator,
        weight: f32,
        squared: bool,
    ) -> HlmrfResult<Option<Term>> {
        if comparator == Comparator::Eq {
            return Err(TermError::UnsupportedShape {
                ground_rule: ground.describe(atoms),
                reason: "weighted equality must be split into two inequalities".into(),
            }
            .into());
        }
        if !weight.is_finite() {
            return Err(TermError::UnsupportedShape {
                ground_rule: ground.describe(atoms),
                reason: format!("weight {weight} is not finite"),
            }
            .into());
        }
        let weight = if weight < 0.0 {
            if !self.config.invert_negative_weights {
                return Err(TermError::NegativeWeight {
                    rule: ground.rule().get(),
                    weight,
                }
                .into());
            }
            plane.negate();
            -weight
        } else {
            weight
        };

        if self.config.drop_trivial
            && (weight == 0.0 || plane.atoms.is_empty() || plane.max_over_box() <= plane.constant)
        {
            return Ok(None);
        }
        let hinge =
            !(self.config.drop_redundant_hinges && plane.min_over_box() >= plane.constant);

        Ok(Some(Term::new(
            ground.rule(),
            plane.atoms,
            plane.coefficients,
            plane.constant,
            TermKind::Potential {
                weight,
                shape: Shape::new(hinge, squared),
            },
        )))
    }

    fn constraint(
        &self,
        atoms: &AtomStore,
        ground: &GroundRule,
        plane: Hyperplane,
        comparator: Comparator,
    ) -> HlmrfResult<Option<Term>> {
        let (lo, hi) = (plane.min_over_box(), plane.max_over_box());
        let k = plane.constant;
        let (infeasible, always) = match comparator {
            Comparator::Lte => (lo > k + CONSTRAINT_TOLERANCE, hi <= k),
            Comparator::Eq => (
                k < lo - CONSTRAINT_TOLERANCE || k > hi + CONSTRAINT_TOLERANCE,
                plane.atoms.is_empty(),
            ),
            Comparator::Gte => unreachable!("normalized to <= above"),
        };
        if infeasible {
            return Err(TermError::InfeasibleConstraint {
                ground_rule: ground.describe(atoms),
            }
            .into());
        }
        if self.config.drop_trivial && always {
            return Ok(None);
        }
        Ok(Some(Term::new(
            ground.rule(),
            plane.atoms,
            plane.coefficients,
            plane.constant,
            TermKind::Constraint { comparator },
        )))
    }
}
