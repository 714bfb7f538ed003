//! Predicate declarations.

use serde::{Deserialize, Serialize};

/// Dense identifier of a predicate inside one [`crate::model::Model`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PredicateId(u32);

impl PredicateId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    /// Get the underlying `u32` value.
    pub fn get(self) -> u32 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for PredicateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pred:{}", self.0)
    }
}

/// A declared predicate.
///
/// Closed predicates are fully observed: any of their atoms missing from the
/// database is false. Open predicates carry the random variables inference
/// assigns values to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    pub id: PredicateId,
    pub name: String,
    pub arity: usize,
    pub closed: bool,
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name, self.arity)
    }
}
