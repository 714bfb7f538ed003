//! The fact database grounding queries run against.
//!
//! Facts live in partitions:
//! - **READ**: observations, fixed during inference
//! - **WRITE**: targets, the random variables inference assigns
//! - **SPECIAL_READ / SPECIAL_WRITE**: newly added atoms parked during a
//!   partial-grounding pass and merged into READ/WRITE when it completes
//!
//! The [`Database`] is the in-memory implementation of the
//! [`query::QueryEngine`] boundary. Its fact table sits behind a single
//! `RwLock`, so a query always sees one consistent snapshot and the special
//! partition merge is atomic.

pub mod atom_store;
pub mod durable;
pub mod loader;
pub mod query;

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{DatabaseError, HlmrfResult};
use crate::model::{Constant, GroundAtom, PredicateId};

pub use atom_store::AtomStore;
pub use query::{Query, QueryEngine, QueryResult, Scope, Substitution, VariableMap};

/// Opaque partition identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Partition {
    Read,
    Write,
    SpecialRead,
    SpecialWrite,
}

impl Partition {
    /// Whether atoms in this partition are observations.
    pub fn is_observed(self) -> bool {
        matches!(self, Partition::Read | Partition::SpecialRead)
    }

    pub fn is_special(self) -> bool {
        matches!(self, Partition::SpecialRead | Partition::SpecialWrite)
    }

    /// The parking partition new atoms of this partition go to.
    pub fn special(self) -> Self {
        match self {
            Partition::Read | Partition::SpecialRead => Partition::SpecialRead,
            Partition::Write | Partition::SpecialWrite => Partition::SpecialWrite,
        }
    }

    /// The partition a parked atom is merged into.
    pub fn merged(self) -> Self {
        match self {
            Partition::Read | Partition::SpecialRead => Partition::Read,
            Partition::Write | Partition::SpecialWrite => Partition::Write,
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Partition::Read => f.write_str("READ"),
            Partition::Write => f.write_str("WRITE"),
            Partition::SpecialRead => f.write_str("SPECIAL_READ"),
            Partition::SpecialWrite => f.write_str("SPECIAL_WRITE"),
        }
    }
}

impl std::str::FromStr for Partition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "READ" | "OBSERVATIONS" | "OBS" => Ok(Partition::Read),
            "WRITE" | "TARGETS" | "TARGET" => Ok(Partition::Write),
            "SPECIAL_READ" => Ok(Partition::SpecialRead),
            "SPECIAL_WRITE" => Ok(Partition::SpecialWrite),
            other => Err(format!("unknown partition \"{other}\"")),
        }
    }
}

/// A stored fact: where it lives and its truth value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub partition: Partition,
    pub value: f32,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FactTable {
    pub(crate) by_predicate: HashMap<PredicateId, HashMap<Vec<Constant>, Fact>>,
}

impl FactTable {
    fn get(&self, atom: &GroundAtom) -> Option<Fact> {
        self.by_predicate
            .get(&atom.predicate)
            .and_then(|m| m.get(&atom.args))
            .copied()
    }

    fn insert(&mut self, atom: GroundAtom, fact: Fact) -> Option<Fact> {
        self.by_predicate
            .entry(atom.predicate)
            .or_default()
            .insert(atom.args, fact)
    }

    fn remove(&mut self, atom: &GroundAtom) -> Option<Fact> {
        self.by_predicate
            .get_mut(&atom.predicate)
            .and_then(|m| m.remove(&atom.args))
    }

    fn len(&self) -> usize {
        self.by_predicate.values().map(HashMap::len).sum()
    }
}

/// In-memory partitioned fact store.
#[derive(Debug, Default)]
pub struct Database {
    facts: RwLock<FactTable>,
    version: AtomicU64,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a fact. An existing atom moves to `partition`.
    pub fn insert(&self, partition: Partition, atom: GroundAtom, value: f32) -> HlmrfResult<()> {
        check_value(&atom, value)?;
        self.write().insert(atom, Fact { partition, value });
        self.bump();
        Ok(())
    }

    pub fn get(&self, atom: &GroundAtom) -> Option<Fact> {
        self.read().get(atom)
    }

    pub fn contains(&self, atom: &GroundAtom) -> bool {
        self.get(atom).is_some()
    }

    pub fn remove(&self, atom: &GroundAtom) -> Option<Fact> {
        let removed = self.write().remove(atom);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    /// Change the value of an existing fact, keeping its partition.
    pub fn set_value(&self, atom: &GroundAtom, value: f32) -> HlmrfResult<()> {
        check_value(atom, value)?;
        let mut facts = self.write();
        let fact = facts
            .by_predicate
            .get_mut(&atom.predicate)
            .and_then(|m| m.get_mut(&atom.args))
            .ok_or_else(|| DatabaseError::MissingAtom {
                atom: atom.to_string(),
            })?;
        fact.value = value;
        drop(facts);
        self.bump();
        Ok(())
    }

    /// Write inferred values into `partition` in one step.
    pub fn commit(&self, atoms: &[(GroundAtom, f32)], partition: Partition) -> HlmrfResult<usize> {
        for (atom, value) in atoms {
            check_value(atom, *value)?;
        }
        let mut facts = self.write();
        for (atom, value) in atoms {
            facts.insert(
                atom.clone(),
                Fact {
                    partition,
                    value: *value,
                },
            );
        }
        drop(facts);
        self.bump();
        tracing::debug!(atoms = atoms.len(), %partition, "committed atoms");
        Ok(atoms.len())
    }

    /// Every fact of a partition, sorted by atom.
    pub fn atoms(&self, partition: Partition) -> Vec<(GroundAtom, f32)> {
        let facts = self.read();
        let mut out: Vec<(GroundAtom, f32)> = facts
            .by_predicate
            .iter()
            .flat_map(|(p, m)| {
                m.iter()
                    .filter(|(_, f)| f.partition == partition)
                    .map(|(args, f)| (GroundAtom::new(*p, args.clone()), f.value))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Every fact with its partition.
    pub fn entries(&self) -> Vec<(GroundAtom, Fact)> {
        let facts = self.read();
        facts
            .by_predicate
            .iter()
            .flat_map(|(p, m)| {
                m.iter()
                    .map(|(args, f)| (GroundAtom::new(*p, args.clone()), *f))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Predicates that currently have parked atoms.
    pub fn special_predicates(&self) -> BTreeSet<PredicateId> {
        let facts = self.read();
        facts
            .by_predicate
            .iter()
            .filter(|(_, m)| m.values().any(|f| f.partition.is_special()))
            .map(|(p, _)| *p)
            .collect()
    }

    pub fn has_special(&self) -> bool {
        !self.special_predicates().is_empty()
    }

    /// Move every parked atom into its READ/WRITE partition.
    ///
    /// Runs under one write lock: readers see either all parked atoms or none.
    pub fn merge_special(&self) -> usize {
        let mut facts = self.write();
        let mut moved = 0;
        for fact in facts.by_predicate.values_mut().flat_map(HashMap::values_mut) {
            if fact.partition.is_special() {
                fact.partition = fact.partition.merged();
                moved += 1;
            }
        }
        drop(facts);
        if moved > 0 {
            self.bump();
        }
        moved
    }

    /// Changes whenever any fact changes.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn read(&self) -> std::sync::RwLockReadGuard<'_, FactTable> {
        self.facts.read().expect("fact table lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, FactTable> {
        self.facts.write().expect("fact table lock poisoned")
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }
}

fn check_value(atom: &GroundAtom, value: f32) -> HlmrfResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(DatabaseError::ValueOutOfRange {
            atom: atom.to_string(),
            value,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(p: usize, args: &[&str]) -> GroundAtom {
        GroundAtom::new(
            PredicateId::from_index(p),
            args.iter().map(|a| (*a).into()).collect(),
        )
    }

    #[test]
    fn insert_get_remove() {
        let db = Database::new();
        let v0 = db.version();
        db.insert(Partition::Read, atom(0, &["a"]), 1.0).unwrap();
        assert!(db.version() > v0);
        assert_eq!(
            db.get(&atom(0, &["a"])),
            Some(Fact {
                partition: Partition::Read,
                value: 1.0
            })
        );
        assert!(db.remove(&atom(0, &["a"])).is_some());
        assert!(db.is_empty());
    }

    #[test]
    fn value_out_of_range_is_rejected() {
        let db = Database::new();
        assert!(db.insert(Partition::Read, atom(0, &["a"]), 1.5).is_err());
        assert!(db.set_value(&atom(0, &["a"]), 0.5).is_err());
    }

    #[test]
    fn merge_special_moves_everything() {
        let db = Database::new();
        db.insert(Partition::Read, atom(0, &["a"]), 1.0).unwrap();
        db.insert(Partition::SpecialRead, atom(0, &["b"]), 1.0).unwrap();
        db.insert(Partition::SpecialWrite, atom(1, &["a", "b"]), 0.0).unwrap();
        assert_eq!(db.special_predicates().len(), 2);
        assert_eq!(db.merge_special(), 2);
        assert!(!db.has_special());
        assert_eq!(db.atoms(Partition::Read).len(), 2);
        assert_eq!(db.atoms(Partition::Write).len(), 1);
    }

    #[test]
    fn commit_overwrites_values() {
        let db = Database::new();
        db.insert(Partition::Write, atom(1, &["a", "b"]), 0.0).unwrap();
        db.commit(&[(atom(1, &["a", "b"]), 0.75)], Partition::Write)
            .unwrap();
        assert_eq!(db.get(&atom(1, &["a", "b"])).unwrap().value, 0.75);
    }

    #[test]
    fn partition_parsing() {
        assert_eq!("read".parse::<Partition>().unwrap(), Partition::Read);
        assert_eq!("TARGETS".parse::<Partition>().unwrap(), Partition::Write);
        assert!("nowhere".parse::<Partition>().is_err());
        assert_eq!(Partition::Write.special(), Partition::SpecialWrite);
        assert_eq!(Partition::SpecialRead.merged(), Partition::Read);
    }
}
