//! Groups random variables into blocks for the discrete reasoners.
//!
//! A hard constraint `Σ xᵢ = 1` over unit coefficients is an exactly-one
//! block, `Σ xᵢ <= 1` an at-most-one block. Every other random variable
//! touched by a term becomes a singleton at-most-one block. A block's
//! settings are "atom i is 1, the rest 0" and, for at-most-one blocks,
//! "all 0". Observations are already folded into term constants, so a
//! categorical constraint whose constant dropped to 0 pins its atoms to 0.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::Rng;

use crate::database::AtomStore;
use crate::error::{HlmrfResult, TermError};
use crate::model::Comparator;
use crate::term::memory::MemoryTermStore;
use crate::term::store::{CursorMode, PageVisitor, ScratchKind, TermStore};
use crate::term::{Term, TermKind};

const UNIT_TOLERANCE: f32 = 1e-6;

/// One block of mutually exclusive random variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub atoms: Vec<u32>,
    pub exactly_one: bool,
    /// Indices of the weighted terms touching any atom of the block.
    pub incident: Vec<usize>,
}

impl Block {
    /// Number of distinct settings.
    pub fn settings(&self) -> usize {
        self.atoms.len() + usize::from(!self.exactly_one)
    }

    /// Write setting `setting` into `values`. `atoms.len()` means all zero.
    pub fn apply(&self, setting: usize, values: &mut [f32]) {
        for (i, &atom) in self.atoms.iter().enumerate() {
            values[atom as usize] = if i == setting { 1.0 } else { 0.0 };
        }
    }

    /// The setting `values` currently encodes, reading the largest atom as on.
    pub fn current(&self, values: &[f32]) -> usize {
        let mut best = self.atoms.len();
        let mut best_value = 0.5;
        for (i, &atom) in self.atoms.iter().enumerate() {
            if values[atom as usize] > best_value {
                best = i;
                best_value = values[atom as usize];
            }
        }
        if best == self.atoms.len() && self.exactly_one {
            0
        } else {
            best
        }
    }
}

/// In-memory terms plus a block decomposition over their random variables.
pub struct BlockerTermStore {
    inner: MemoryTermStore,
    blocks: Vec<Block>,
    block_of: Vec<Option<usize>>,
    pinned: Vec<u32>,
    /// Term count the blocks were built for.
    built_for: Option<usize>,
}

impl BlockerTermStore {
    pub fn new(atoms: Arc<AtomStore>) -> Self {
        Self {
            inner: MemoryTermStore::new(atoms),
            blocks: Vec::new(),
            block_of: Vec::new(),
            pinned: Vec::new(),
            built_for: None,
        }
    }

    pub fn term_slice(&self) -> &[Term] {
        self.inner.term_slice()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block_of(&self, atom: u32) -> Option<usize> {
        self.block_of.get(atom as usize).copied().flatten()
    }

    /// Atoms forced to 0 by a categorical constraint already satisfied by data.
    pub fn pinned(&self) -> &[u32] {
        &self.pinned
    }

    /// Build the blocks if terms changed since the last build.
    pub fn build(&mut self) -> HlmrfResult<()> {
        if self.built_for == Some(self.inner.len()) {
            return Ok(());
        }
        let atom_count = self.inner.atoms().len();
        let terms = self.inner.term_slice();
        let mut blocks: Vec<Block> = Vec::new();
        let mut block_of: Vec<Option<usize>> = vec![None; atom_count];
        let mut pinned = Vec::new();

        for term in terms {
            let TermKind::Constraint { comparator } = term.kind else {
                continue;
            };
            let categorical = matches!(comparator, Comparator::Eq | Comparator::Lte)
                && term
                    .coefficients
                    .iter()
                    .all(|c| (c - 1.0).abs() < UNIT_TOLERANCE);
            if !categorical {
                return Err(unsupported(term, "only 1-of-k and at-most-1-of-k constraints with unit coefficients are supported"));
            }
            let pinned_block = term.constant.abs() < UNIT_TOLERANCE;
            if !pinned_block && (term.constant - 1.0).abs() >= UNIT_TOLERANCE {
                return Err(unsupported(term, "categorical constraints must sum to 1"));
            }
            for &atom in &term.atoms {
                if block_of[atom as usize].is_some() || pinned.contains(&atom) {
                    return Err(unsupported(term, "an atom may take part in only one categorical constraint"));
                }
            }
            if pinned_block {
                pinned.extend(term.atoms.iter().copied());
                continue;
            }
            let index = blocks.len();
            for &atom in &term.atoms {
                block_of[atom as usize] = Some(index);
            }
            blocks.push(Block {
                atoms: term.atoms.clone(),
                exactly_one: comparator == Comparator::Eq,
                incident: Vec::new(),
            });
        }

        // Free random variables become singletons.
        let mut free = BTreeSet::new();
        for term in terms.iter().filter(|t| !t.is_constraint()) {
            for &atom in &term.atoms {
                if block_of[atom as usize].is_none() && !pinned.contains(&atom) {
                    free.insert(atom);
                }
            }
        }
        for atom in free {
            block_of[atom as usize] = Some(blocks.len());
            blocks.push(Block {
                atoms: vec![atom],
                exactly_one: false,
                incident: Vec::new(),
            });
        }

        for (index, term) in terms.iter().enumerate() {
            if term.is_constraint() {
                continue;
            }
            let touched: BTreeSet<usize> = term
                .atoms
                .iter()
                .filter_map(|&a| block_of[a as usize])
                .collect();
            for block in touched {
                blocks[block].incident.push(index);
            }
        }

        tracing::debug!(
            blocks = blocks.len(),
            pinned = pinned.len(),
            terms = terms.len(),
            "built atom blocks"
        );
        self.blocks = blocks;
        self.block_of = block_of;
        self.pinned = pinned;
        self.built_for = Some(self.inner.len());
        Ok(())
    }

    /// Put every block in a uniformly random setting and zero pinned atoms.
    pub fn randomly_initialize<R: Rng>(&self, rng: &mut R, values: &mut [f32]) {
        for block in &self.blocks {
            let setting = rng.gen_range(0..block.settings());
            block.apply(setting, values);
        }
        for &atom in &self.pinned {
            values[atom as usize] = 0.0;
        }
    }
}

fn unsupported(term: &Term, reason: &str) -> crate::error::HlmrfError {
    TermError::UnsupportedShape {
        ground_rule: term.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

impl TermStore for BlockerTermStore {
    fn name(&self) -> &'static str {
        "blocker"
    }

    fn atoms(&self) -> &Arc<AtomStore> {
        self.inner.atoms()
    }

    fn add(&mut self, term: Term) -> HlmrfResult<usize> {
        self.inner.add(term)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn refresh(&mut self) -> HlmrfResult<()> {
        self.build()
    }

    fn ensure_capacity(&mut self, terms: usize) {
        self.inner.ensure_capacity(terms);
    }

    fn prepare_scratch(&mut self, kind: ScratchKind) -> HlmrfResult<bool> {
        self.inner.prepare_scratch(kind)
    }

    fn scratch_kind(&self) -> ScratchKind {
        self.inner.scratch_kind()
    }

    fn visit_pages(&mut self, mode: CursorMode, visitor: &mut PageVisitor<'_>) -> HlmrfResult<()> {
        self.inner.visit_pages(mode, visitor)
    }

    fn clear(&mut self) -> HlmrfResult<()> {
        self.blocks.clear();
        self.block_of.clear();
        self.pinned.clear();
        self.built_for = None;
        self.inner.clear()
    }

    fn close(&mut self) -> HlmrfResult<()> {
        self.clear()?;
        self.inner.close()
    }

    fn copy_store(&mut self) -> HlmrfResult<Box<dyn TermStore>> {
        let mut copy = BlockerTermStore::new(Arc::new(self.atoms().copy()));
        for term in self.inner.term_slice() {
            copy.inner.add(term.clone())?;
        }
        copy.build()?;
        Ok(Box::new(copy))
    }

    fn as_blocker(&mut self) -> Option<&mut BlockerTermStore> {
        Some(self)
    }
}

impl std::fmt::Debug for BlockerTermStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockerTermStore")
            .field("terms", &self.inner.len())
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AtomKind, GroundAtom, PredicateId, RuleId};
    use crate::term::Shape;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn store(atoms: usize) -> BlockerTermStore {
        let store = Arc::new(AtomStore::new());
        for i in 0..atoms {
            store.intern(
                &GroundAtom::new(PredicateId::from_index(0), vec![format!("a{i}").into()]),
                AtomKind::RandomVariable,
                0.0,
            );
        }
        BlockerTermStore::new(store)
    }

    fn constraint(atoms: Vec<u32>, comparator: Comparator, constant: f32) -> Term {
        let n = atoms.len();
        Term::new(RuleId::new(0), atoms, vec![1.0; n], constant, TermKind::Constraint { comparator })
    }

    fn potential(atoms: Vec<u32>) -> Term {
        let n = atoms.len();
        Term::new(
            RuleId::new(1),
            atoms,
            vec![-1.0; n],
            -1.0,
            TermKind::Potential {
                weight: 1.0,
                shape: Shape::Hinge,
            },
        )
    }

    #[test]
    fn categorical_constraints_become_blocks() {
        let mut store = store(5);
        store.add(constraint(vec![0, 1, 2], Comparator::Eq, 1.0)).unwrap();
        store.add(potential(vec![0])).unwrap();
        store.add(potential(vec![3])).unwrap();
        store.add(potential(vec![2, 4])).unwrap();
        store.build().unwrap();

        let blocks = store.blocks();
        assert_eq!(blocks.len(), 3);
        assert!(blocks[0].exactly_one);
        assert_eq!(blocks[0].atoms, vec![0, 1, 2]);
        assert_eq!(blocks[0].incident, vec![1, 3]);
        assert_eq!(blocks[0].settings(), 3);
        // Singletons for the free atoms 3 and 4.
        assert_eq!(store.block_of(3), Some(1));
        assert_eq!(store.block_of(4), Some(2));
        assert_eq!(blocks[1].settings(), 2);
    }

    #[test]
    fn zero_constant_pins_atoms() {
        let mut store = store(2);
        store.add(constraint(vec![0, 1], Comparator::Lte, 0.0)).unwrap();
        store.add(potential(vec![0, 1])).unwrap();
        store.build().unwrap();
        assert!(store.blocks().is_empty());
        assert_eq!(store.pinned(), &[0, 1]);
    }

    #[test]
    fn non_categorical_constraint_is_rejected() {
        let mut store = store(2);
        store
            .add(Term::new(
                RuleId::new(0),
                vec![0, 1],
                vec![1.0, -1.0],
                0.0,
                TermKind::Constraint {
                    comparator: Comparator::Lte,
                },
            ))
            .unwrap();
        assert!(store.build().is_err());
    }

    #[test]
    fn overlapping_blocks_are_rejected() {
        let mut store = store(3);
        store.add(constraint(vec![0, 1], Comparator::Eq, 1.0)).unwrap();
        store.add(constraint(vec![1, 2], Comparator::Eq, 1.0)).unwrap();
        assert!(store.build().is_err());
    }

    #[test]
    fn random_initialization_respects_blocks() {
        let mut store = store(4);
        store.add(constraint(vec![0, 1, 2], Comparator::Eq, 1.0)).unwrap();
        store.add(potential(vec![3])).unwrap();
        store.build().unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            let mut values = vec![0.3; 4];
            store.randomly_initialize(&mut rng, &mut values);
            let on: f32 = values[..3].iter().sum();
            assert_eq!(on, 1.0);
            assert!(values[3] == 0.0 || values[3] == 1.0);
        }
    }

    #[test]
    fn current_setting_reads_values() {
        let block = Block {
            atoms: vec![0, 1],
            exactly_one: false,
            incident: vec![],
        };
        let mut values = vec![0.0; 2];
        assert_eq!(block.current(&values), 2);
        block.apply(1, &mut values);
        assert_eq!(values, vec![0.0, 1.0]);
        assert_eq!(block.current(&values), 1);
    }
}
