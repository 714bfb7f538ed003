//! Resolves ground atoms produced by substitution into atom-store indices.

use crate::database::{AtomStore, QueryEngine};
use crate::model::{AtomKind, GroundAtom, Model};

/// Decides the kind and initial value of every atom grounding touches.
///
/// - READ and SPECIAL_READ facts are observations with their stored value.
/// - WRITE and SPECIAL_WRITE facts are random variables starting at their
///   stored value.
/// - An atom absent from the database is an observation with value 0 when its
///   predicate is closed, and a fresh random variable at 0 otherwise.
pub struct AtomManager<'a> {
    model: &'a Model,
    engine: &'a dyn QueryEngine,
    atoms: &'a AtomStore,
}

impl<'a> AtomManager<'a> {
    pub fn new(model: &'a Model, engine: &'a dyn QueryEngine, atoms: &'a AtomStore) -> Self {
        Self {
            model,
            engine,
            atoms,
        }
    }

    /// Index of `atom`, interning it on first sight.
    pub fn resolve(&self, atom: &GroundAtom) -> u32 {
        if let Some(index) = self.atoms.get_index(atom) {
            return index;
        }
        let (kind, value) = self.classify(atom);
        self.atoms.intern(atom, kind, value)
    }

    /// Kind and value an atom would be interned with.
    pub fn classify(&self, atom: &GroundAtom) -> (AtomKind, f32) {
        match self.engine.lookup(atom) {
            Some(fact) if fact.partition.is_observed() => (AtomKind::Observed, fact.value),
            Some(fact) => (AtomKind::RandomVariable, fact.value),
            None if self.model.predicate(atom.predicate).closed => (AtomKind::Observed, 0.0),
            None => (AtomKind::RandomVariable, 0.0),
        }
    }

    pub fn atoms(&self) -> &AtomStore {
        self.atoms
    }

    pub fn engine(&self) -> &dyn QueryEngine {
        self.engine
    }
}
