//! Ground terms and the stores that hold them.
//!
//! A [`Term`] is a hyperplane `Σ cᵢ·x[aᵢ]` over atom-store indices compared
//! against a constant. Hard constraints carry a comparator, soft potentials a
//! weight and a [`Shape`]. Observed atoms are folded into the constant during
//! generation, so every index in a term names a random variable.

pub mod blocker;
pub mod dual;
pub mod generator;
pub mod memory;
pub mod online;
pub mod page;
pub mod store;
pub mod streaming;

use serde::{Deserialize, Serialize};

use crate::model::{Comparator, RuleId};

pub use generator::{GeneratorConfig, TermGenerator};
pub use store::{CursorMode, PageView, ScratchKind, StoreState, TermState, TermStore};

/// Tolerance used when checking hard constraints.
pub const CONSTRAINT_TOLERANCE: f32 = 1e-5;

/// Shape of a soft potential's incompatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shape {
    /// `c·x − k`
    Linear,
    /// `max(0, c·x − k)`
    Hinge,
    /// `(c·x − k)²`
    SquaredLinear,
    /// `max(0, c·x − k)²`
    SquaredHinge,
}

impl Shape {
    pub fn new(hinge: bool, squared: bool) -> Self {
        match (hinge, squared) {
            (false, false) => Shape::Linear,
            (true, false) => Shape::Hinge,
            (false, true) => Shape::SquaredLinear,
            (true, true) => Shape::SquaredHinge,
        }
    }

    pub fn is_hinge(self) -> bool {
        matches!(self, Shape::Hinge | Shape::SquaredHinge)
    }

    pub fn is_squared(self) -> bool {
        matches!(self, Shape::SquaredLinear | Shape::SquaredHinge)
    }

    /// Apply the shape to a signed distance `c·x − k`.
    pub fn apply(self, distance: f32) -> f32 {
        let d = if self.is_hinge() {
            distance.max(0.0)
        } else {
            distance
        };
        if self.is_squared() { d * d } else { d }
    }
}

/// What a term contributes to the problem.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TermKind {
    /// `c·x OP k`, infinite cost when violated. `OP` is `Lte` or `Eq`.
    Constraint { comparator: Comparator },
    /// `weight · shape(c·x − k)`.
    Potential { weight: f32, shape: Shape },
}

/// One ground potential or constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Term {
    pub rule: RuleId,
    pub atoms: Vec<u32>,
    pub coefficients: Vec<f32>,
    pub constant: f32,
    pub kind: TermKind,
}

impl Term {
    pub fn new(
        rule: RuleId,
        atoms: Vec<u32>,
        coefficients: Vec<f32>,
        constant: f32,
        kind: TermKind,
    ) -> Self {
        assert_eq!(
            atoms.len(),
            coefficients.len(),
            "term has {} atoms but {} coefficients",
            atoms.len(),
            coefficients.len()
        );
        Self {
            rule,
            atoms,
            coefficients,
            constant,
            kind,
        }
    }

    pub fn size(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self.kind, TermKind::Constraint { .. })
    }

    pub fn weight(&self) -> Option<f32> {
        match self.kind {
            TermKind::Potential { weight, .. } => Some(weight),
            TermKind::Constraint { .. } => None,
        }
    }

    pub fn comparator(&self) -> Option<Comparator> {
        match self.kind {
            TermKind::Constraint { comparator } => Some(comparator),
            TermKind::Potential { .. } => None,
        }
    }

    pub fn shape(&self) -> Option<Shape> {
        match self.kind {
            TermKind::Potential { shape, .. } => Some(shape),
            TermKind::Constraint { .. } => None,
        }
    }

    /// `Σ cᵢ·values[aᵢ]` over the global value array.
    pub fn dot(&self, values: &[f32]) -> f32 {
        self.atoms
            .iter()
            .zip(&self.coefficients)
            .map(|(&a, &c)| c * values[a as usize])
            .sum()
    }

    /// `Σ cᵢ·local[i]` over a term-local copy.
    pub fn dot_local(&self, local: &[f32]) -> f32 {
        self.coefficients
            .iter()
            .zip(local)
            .map(|(c, x)| c * x)
            .sum()
    }

    /// Unweighted incompatibility. Zero for constraints.
    pub fn incompatibility(&self, values: &[f32]) -> f32 {
        match self.kind {
            TermKind::Potential { shape, .. } => shape.apply(self.dot(values) - self.constant),
            TermKind::Constraint { .. } => 0.0,
        }
    }

    /// Contribution to the objective. Zero for constraints.
    pub fn weighted_incompatibility(&self, values: &[f32]) -> f32 {
        match self.kind {
            TermKind::Potential { weight, shape } => {
                weight * shape.apply(self.dot(values) - self.constant)
            }
            TermKind::Constraint { .. } => 0.0,
        }
    }

    /// How far a constraint is from holding. Zero for potentials.
    pub fn violation(&self, values: &[f32]) -> f32 {
        match self.kind {
            TermKind::Constraint { comparator } => {
                let d = self.dot(values) - self.constant;
                match comparator {
                    Comparator::Lte => d.max(0.0),
                    Comparator::Gte => (-d).max(0.0),
                    Comparator::Eq => d.abs(),
                }
            }
            TermKind::Potential { .. } => 0.0,
        }
    }

    /// Rewrite atom indices after [`crate::database::AtomStore::compact`].
    ///
    /// Returns `false` when an atom was dropped, in which case the term is no
    /// longer meaningful.
    pub fn remap(&mut self, remap: &[Option<u32>]) -> bool {
        for atom in &mut self.atoms {
            match remap.get(*atom as usize).copied().flatten() {
                Some(new) => *atom = new,
                None => return false,
            }
        }
        true
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .atoms
            .iter()
            .zip(&self.coefficients)
            .map(|(a, c)| format!("{c}*x{a}"))
            .collect();
        let lhs = if parts.is_empty() {
            "0".to_string()
        } else {
            parts.join(" + ")
        };
        match self.kind {
            TermKind::Constraint { comparator } => {
                write!(f, "[{}] {lhs} {comparator} {}", self.rule, self.constant)
            }
            TermKind::Potential { weight, shape } => {
                write!(f, "[{}] {weight}: {shape:?}({lhs} - {})", self.rule, self.constant)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hinge(weight: f32, squared: bool) -> Term {
        Term::new(
            RuleId::new(0),
            vec![0, 1],
            vec![1.0, -1.0],
            0.0,
            TermKind::Potential {
                weight,
                shape: Shape::new(true, squared),
            },
        )
    }

    #[test]
    fn hinge_incompatibility() {
        let t = hinge(2.0, false);
        assert_eq!(t.incompatibility(&[0.8, 0.3]), 0.5);
        assert_eq!(t.weighted_incompatibility(&[0.8, 0.3]), 1.0);
        assert_eq!(t.incompatibility(&[0.3, 0.8]), 0.0);
        let sq = hinge(2.0, true);
        assert_eq!(sq.incompatibility(&[0.8, 0.3]), 0.25);
    }

    #[test]
    fn constraint_violation() {
        let t = Term::new(
            RuleId::new(1),
            vec![0, 1],
            vec![1.0, 1.0],
            1.0,
            TermKind::Constraint {
                comparator: Comparator::Eq,
            },
        );
        assert_eq!(t.violation(&[0.5, 0.5]), 0.0);
        assert!((t.violation(&[0.9, 0.5]) - 0.4).abs() < 1e-6);
        assert_eq!(t.weighted_incompatibility(&[0.9, 0.5]), 0.0);
    }

    #[test]
    fn remap_follows_compaction() {
        let mut t = hinge(1.0, false);
        assert!(t.remap(&[Some(3), Some(1)]));
        assert_eq!(t.atoms, vec![3, 1]);
        assert!(!t.remap(&[None, Some(0), None, Some(2)]));
    }

    #[test]
    #[should_panic(expected = "atoms but")]
    fn mismatched_lengths_panic() {
        Term::new(
            RuleId::new(0),
            vec![0],
            vec![1.0, 2.0],
            0.0,
            TermKind::Constraint {
                comparator: Comparator::Lte,
            },
        );
    }
}
