//! Dense index over ground atoms with a packed value array.
//!
//! Every term refers to atoms solely through indices into exactly one
//! `AtomStore`. Lookup by identity goes through a sharded `DashMap`, so
//! parallel grounding workers can intern atoms without a global lock; the
//! record and value arrays sit behind `RwLock`s and are only written when a
//! new atom is appended or a reasoner syncs its results.

use std::sync::RwLock;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::model::atom::clamp_value;
use crate::model::{AtomKind, GroundAtom};

/// Initial allocation for the record and value arrays.
pub const MIN_ALLOCATION: usize = 100;

/// Bookkeeping for one interned atom.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomRecord {
    pub atom: GroundAtom,
    pub kind: AtomKind,
    /// Deleted atoms keep their slot until [`AtomStore::compact`].
    pub deleted: bool,
}

/// Bidirectional index ↔ ground-atom table.
pub struct AtomStore {
    lookup: DashMap<GroundAtom, u32>,
    records: RwLock<Vec<AtomRecord>>,
    values: RwLock<Vec<f32>>,
}

impl AtomStore {
    pub fn new() -> Self {
        Self::with_capacity(MIN_ALLOCATION)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_ALLOCATION);
        Self {
            lookup: DashMap::with_capacity(capacity),
            records: RwLock::new(Vec::with_capacity(capacity)),
            values: RwLock::new(Vec::with_capacity(capacity)),
        }
    }

    /// Index of an atom, interning it with `kind` and `value` if absent.
    ///
    /// Amortized O(1). Safe to call from many grounding workers at once; an
    /// atom raced by two workers is interned exactly once.
    pub fn intern(&self, atom: &GroundAtom, kind: AtomKind, value: f32) -> u32 {
        if let Some(index) = self.lookup.get(atom) {
            return *index;
        }
        match self.lookup.entry(atom.clone()) {
            Entry::Occupied(e) => *e.get(),
            Entry::Vacant(e) => {
                let mut records = self.records.write().expect("atom records lock poisoned");
                let mut values = self.values.write().expect("atom values lock poisoned");
                let index = records.len() as u32;
                grow(&mut records, index as usize + 1);
                grow(&mut values, index as usize + 1);
                records.push(AtomRecord {
                    atom: atom.clone(),
                    kind,
                    deleted: false,
                });
                values.push(clamp_value(value));
                e.insert(index);
                index
            }
        }
    }

    /// Index of an already interned atom.
    pub fn get_index(&self, atom: &GroundAtom) -> Option<u32> {
        self.lookup.get(atom).map(|i| *i)
    }

    /// Pre-size the arrays so no reallocation happens during a parallel phase.
    pub fn ensure_capacity(&self, capacity: usize) {
        grow(
            &mut self.records.write().expect("atom records lock poisoned"),
            capacity,
        );
        grow(
            &mut self.values.write().expect("atom values lock poisoned"),
            capacity,
        );
    }

    pub fn len(&self) -> usize {
        self.records.read().expect("atom records lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The record at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` does not belong to this store.
    pub fn get_atom(&self, index: u32) -> AtomRecord {
        let records = self.records.read().expect("atom records lock poisoned");
        assert!(
            (index as usize) < records.len(),
            "atom index {index} does not belong to this store ({} atoms)",
            records.len()
        );
        records[index as usize].clone()
    }

    pub fn kind(&self, index: u32) -> AtomKind {
        self.get_atom(index).kind
    }

    pub fn is_random_variable(&self, index: u32) -> bool {
        let records = self.records.read().expect("atom records lock poisoned");
        records
            .get(index as usize)
            .is_some_and(|r| r.kind.is_random_variable() && !r.deleted)
    }

    pub fn is_deleted(&self, index: u32) -> bool {
        self.get_atom(index).deleted
    }

    pub fn get_value(&self, index: u32) -> f32 {
        let values = self.values.read().expect("atom values lock poisoned");
        assert!(
            (index as usize) < values.len(),
            "atom index {index} does not belong to this store"
        );
        values[index as usize]
    }

    /// Set a value, clamped to `[0, 1]`.
    pub fn set_value(&self, index: u32, value: f32) {
        let mut values = self.values.write().expect("atom values lock poisoned");
        assert!(
            (index as usize) < values.len(),
            "atom index {index} does not belong to this store"
        );
        values[index as usize] = clamp_value(value);
    }

    /// Snapshot of the whole value array.
    pub fn values(&self) -> Vec<f32> {
        self.values.read().expect("atom values lock poisoned").clone()
    }

    /// Write working values back for every live random variable in one step.
    ///
    /// Returns the root-mean-square movement over those atoms.
    pub fn write_back(&self, working: &[f32]) -> f32 {
        let records = self.records.read().expect("atom records lock poisoned");
        let mut values = self.values.write().expect("atom values lock poisoned");
        let mut movement = 0.0f64;
        let mut count = 0usize;
        for (i, record) in records.iter().enumerate() {
            if !record.kind.is_random_variable() || record.deleted || i >= working.len() {
                continue;
            }
            let new = clamp_value(working[i]);
            let diff = f64::from(new - values[i]);
            movement += diff * diff;
            count += 1;
            values[i] = new;
        }
        if count == 0 {
            0.0
        } else {
            (movement / count as f64).sqrt() as f32
        }
    }

    /// Turn a random variable into an observation with a fixed value.
    pub fn observe(&self, index: u32, value: f32) {
        {
            let mut records = self.records.write().expect("atom records lock poisoned");
            records[index as usize].kind = AtomKind::Observed;
        }
        self.set_value(index, value);
    }

    /// Reclassify an atom, e.g. a lazily created target that data now observes.
    pub fn set_kind(&self, index: u32, kind: AtomKind) {
        let mut records = self.records.write().expect("atom records lock poisoned");
        records[index as usize].kind = kind;
    }

    /// Mark an atom deleted. Its slot stays until [`AtomStore::compact`].
    pub fn delete(&self, index: u32) {
        let atom = {
            let mut records = self.records.write().expect("atom records lock poisoned");
            match records.get_mut(index as usize) {
                Some(record) => {
                    record.deleted = true;
                    record.atom.clone()
                }
                None => return,
            }
        };
        self.lookup.remove(&atom);
    }

    /// Clamp every value and return `(atom, value)` for the live random variables.
    ///
    /// This is the hand-off to persistence: callers commit the returned pairs
    /// into the target partition.
    pub fn sync(&self) -> Vec<(GroundAtom, f32)> {
        let records = self.records.read().expect("atom records lock poisoned");
        let mut values = self.values.write().expect("atom values lock poisoned");
        records
            .iter()
            .zip(values.iter_mut())
            .filter(|(r, _)| r.kind.is_random_variable() && !r.deleted)
            .map(|(r, v)| {
                *v = clamp_value(*v);
                (r.atom.clone(), *v)
            })
            .collect()
    }

    /// Indices of live random-variable atoms.
    pub fn random_variables(&self) -> Vec<u32> {
        let records = self.records.read().expect("atom records lock poisoned");
        records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.kind.is_random_variable() && !r.deleted)
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Drop deleted slots and repack indices.
    ///
    /// Returns the old → new remapping; `None` marks a dropped atom. Terms
    /// must be remapped with it before they are used again. Must not run
    /// concurrently with [`AtomStore::intern`].
    pub fn compact(&self) -> Vec<Option<u32>> {
        let mut remap = Vec::new();
        let mut live = Vec::new();
        {
            let mut records = self.records.write().expect("atom records lock poisoned");
            let mut values = self.values.write().expect("atom values lock poisoned");
            let old_records = std::mem::take(&mut *records);
            let old_values = std::mem::take(&mut *values);
            remap.reserve(old_records.len());
            for (record, value) in old_records.into_iter().zip(old_values) {
                if record.deleted {
                    remap.push(None);
                    continue;
                }
                let next = records.len() as u32;
                live.push((record.atom.clone(), next));
                records.push(record);
                values.push(value);
                remap.push(Some(next));
            }
        }
        self.lookup.clear();
        for (atom, index) in live {
            self.lookup.insert(atom, index);
        }
        remap
    }

    /// Deep copy that preserves index alignment.
    pub fn copy(&self) -> Self {
        let records = self.records.read().expect("atom records lock poisoned").clone();
        let values = self.values.read().expect("atom values lock poisoned").clone();
        let lookup = DashMap::with_capacity(records.len());
        for (i, r) in records.iter().enumerate() {
            if !r.deleted {
                lookup.insert(r.atom.clone(), i as u32);
            }
        }
        Self {
            lookup,
            records: RwLock::new(records),
            values: RwLock::new(values),
        }
    }

    /// Release every atom.
    pub fn close(&self) {
        self.lookup.clear();
        self.records.write().expect("atom records lock poisoned").clear();
        self.values.write().expect("atom values lock poisoned").clear();
    }
}

impl Default for AtomStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AtomStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomStore").field("atoms", &self.len()).finish()
    }
}

/// Double capacity (at least [`MIN_ALLOCATION`]) until `needed` fits.
fn grow<T>(vec: &mut Vec<T>, needed: usize) {
    if vec.capacity() >= needed {
        return;
    }
    let mut capacity = vec.capacity().max(MIN_ALLOCATION);
    while capacity < needed {
        capacity *= 2;
    }
    vec.reserve_exact(capacity - vec.len());
}
