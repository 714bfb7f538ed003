//! Constants and ground atoms.

use serde::{Deserialize, Serialize};

use crate::model::predicate::PredicateId;

/// A constant argument of a ground atom.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Constant(String);

impl Constant {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Constant {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Constant {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A predicate applied to constants. Identity is `(predicate, args)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroundAtom {
    pub predicate: PredicateId,
    pub args: Vec<Constant>,
}

impl GroundAtom {
    pub fn new(predicate: PredicateId, args: Vec<Constant>) -> Self {
        Self { predicate, args }
    }
}

impl std::fmt::Display for GroundAtom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(", self.predicate)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        f.write_str(")")
    }
}

/// Whether an atom's value is fixed by data or optimized by inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AtomKind {
    Observed,
    RandomVariable,
}

impl AtomKind {
    pub fn is_random_variable(self) -> bool {
        matches!(self, AtomKind::RandomVariable)
    }
}

impl std::fmt::Display for AtomKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AtomKind::Observed => write!(f, "observed"),
            AtomKind::RandomVariable => write!(f, "random-variable"),
        }
    }
}

/// Clamp a truth value into `[0, 1]`.
pub fn clamp_value(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}
