//! The in-memory term store: every term in one contiguous vector.

use std::sync::Arc;

use crate::database::AtomStore;
use crate::error::HlmrfResult;
use crate::term::store::{CursorMode, PageView, PageVisitor, ScratchKind, TermStore};
use crate::term::Term;

/// Simple term store. Its single page is the whole term list.
pub struct MemoryTermStore {
    atoms: Arc<AtomStore>,
    terms: Vec<Term>,
    scratch: Vec<f32>,
    kind: ScratchKind,
    /// Scratch length each term was laid out with; stale after `add`.
    laid_out: usize,
}

impl MemoryTermStore {
    pub fn new(atoms: Arc<AtomStore>) -> Self {
        Self {
            atoms,
            terms: Vec::new(),
            scratch: Vec::new(),
            kind: ScratchKind::None,
            laid_out: 0,
        }
    }

    /// Direct read access to the terms.
    pub fn term_slice(&self) -> &[Term] {
        &self.terms
    }

    /// Repack the atom store after deletions and rewrite term indices.
    ///
    /// Terms that referenced a dropped atom are removed. Returns how many.
    pub fn compact(&mut self) -> usize {
        let remap = self.atoms.compact();
        let before = self.terms.len();
        self.terms.retain_mut(|t| t.remap(&remap));
        self.kind = ScratchKind::None;
        self.scratch.clear();
        self.laid_out = 0;
        before - self.terms.len()
    }

    fn scratch_len(&self, kind: ScratchKind) -> usize {
        self.terms.iter().map(|t| kind.width(t.size())).sum()
    }
}

impl TermStore for MemoryTermStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn atoms(&self) -> &Arc<AtomStore> {
        &self.atoms
    }

    fn add(&mut self, term: Term) -> HlmrfResult<usize> {
        debug_assert!(
            term.atoms.iter().all(|&a| (a as usize) < self.atoms.len()),
            "term references an atom outside this store"
        );
        self.terms.push(term);
        Ok(self.terms.len())
    }

    fn len(&self) -> usize {
        self.terms.len()
    }

    fn ensure_capacity(&mut self, terms: usize) {
        self.terms.reserve(terms.saturating_sub(self.terms.len()));
    }

    fn prepare_scratch(&mut self, kind: ScratchKind) -> HlmrfResult<bool> {
        if kind == self.kind && self.laid_out == self.terms.len() {
            return Ok(false);
        }
        if kind == self.kind && self.laid_out < self.terms.len() {
            // New terms start at zero; existing scratch is kept.
            let len = self.scratch_len(kind);
            self.scratch.resize(len, 0.0);
            self.laid_out = self.terms.len();
            return Ok(false);
        }
        self.scratch = vec![0.0; self.scratch_len(kind)];
        self.kind = kind;
        self.laid_out = self.terms.len();
        Ok(true)
    }

    fn scratch_kind(&self) -> ScratchKind {
        self.kind
    }

    fn visit_pages(&mut self, mode: CursorMode, visitor: &mut PageVisitor<'_>) -> HlmrfResult<()> {
        if self.laid_out != self.terms.len() {
            self.prepare_scratch(self.kind)?;
        }
        if self.terms.is_empty() {
            return Ok(());
        }
        match mode {
            CursorMode::ReadWrite => visitor(PageView {
                first_term: 0,
                terms: &self.terms,
                scratch: &mut self.scratch,
                kind: self.kind,
            }),
            CursorMode::ReadOnly => {
                let mut scratch = self.scratch.clone();
                visitor(PageView {
                    first_term: 0,
                    terms: &self.terms,
                    scratch: &mut scratch,
                    kind: self.kind,
                })
            }
        }
    }

    fn clear(&mut self) -> HlmrfResult<()> {
        self.terms.clear();
        self.scratch.clear();
        self.laid_out = 0;
        Ok(())
    }

    fn close(&mut self) -> HlmrfResult<()> {
        self.clear()?;
        self.atoms.close();
        Ok(())
    }

    fn copy_store(&mut self) -> HlmrfResult<Box<dyn TermStore>> {
        Ok(Box::new(MemoryTermStore {
            atoms: Arc::new(self.atoms.copy()),
            terms: self.terms.clone(),
            scratch: self.scratch.clone(),
            kind: self.kind,
            laid_out: self.laid_out,
        }))
    }
}

impl std::fmt::Debug for MemoryTermStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTermStore")
            .field("terms", &self.terms.len())
            .field("atoms", &self.atoms.len())
            .field("scratch", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AtomKind, Comparator, GroundAtom, PredicateId, RuleId};
    use crate::term::{Shape, TermKind};

    fn store_with_terms(n: usize) -> MemoryTermStore {
        let atoms = Arc::new(AtomStore::new());
        for i in 0..3 {
            atoms.intern(
                &GroundAtom::new(PredicateId::from_index(0), vec![format!("a{i}").into()]),
                AtomKind::RandomVariable,
                0.0,
            );
        }
        let mut store = MemoryTermStore::new(atoms);
        for i in 0..n {
            store
                .add(Term::new(
                    RuleId::new(0),
                    vec![(i % 3) as u32, ((i + 1) % 3) as u32],
                    vec![1.0, -1.0],
                    0.0,
                    TermKind::Potential {
                        weight: 1.0,
                        shape: Shape::Hinge,
                    },
                ))
                .unwrap();
        }
        store
    }

    #[test]
    fn scratch_is_zeroed_then_kept() {
        let mut store = store_with_terms(4);
        assert!(store.prepare_scratch(ScratchKind::Admm).unwrap());
        store
            .visit_pages(CursorMode::ReadWrite, &mut |page| {
                for slot in page.slots() {
                    assert!(slot.scratch.iter().all(|v| *v == 0.0));
                    slot.scratch.fill(1.0);
                }
                Ok(())
            })
            .unwrap();
        assert!(!store.prepare_scratch(ScratchKind::Admm).unwrap());
        let state = store.save_state().unwrap();
        assert!(state.terms.iter().all(|t| t.scratch == vec![1.0; 4]));
        // Switching kinds starts over.
        assert!(store.prepare_scratch(ScratchKind::DualLcqp).unwrap());
    }

    #[test]
    fn read_only_discards_changes() {
        let mut store = store_with_terms(2);
        store.prepare_scratch(ScratchKind::Admm).unwrap();
        store
            .visit_pages(CursorMode::ReadOnly, &mut |page| {
                page.scratch.fill(9.0);
                Ok(())
            })
            .unwrap();
        let state = store.save_state().unwrap();
        assert!(state.terms.iter().all(|t| t.scratch.iter().all(|v| *v == 0.0)));
    }

    #[test]
    fn save_and_load_state() {
        let mut store = store_with_terms(3);
        store.prepare_scratch(ScratchKind::Admm).unwrap();
        let saved = store.save_state().unwrap();
        store
            .visit_pages(CursorMode::ReadWrite, &mut |page| {
                page.scratch.fill(0.5);
                Ok(())
            })
            .unwrap();
        store.atoms().set_value(0, 0.7);
        store.load_state(&saved).unwrap();
        assert_eq!(store.save_state().unwrap(), saved);
        assert_eq!(store.atoms().get_value(0), 0.0);
    }

    #[test]
    fn load_state_rejects_other_stores() {
        let mut a = store_with_terms(3);
        let mut b = store_with_terms(2);
        let saved = a.save_state().unwrap();
        assert!(b.load_state(&saved).is_err());
    }

    #[test]
    fn copy_is_independent() {
        let mut store = store_with_terms(3);
        let mut copy = store.copy_store().unwrap();
        copy.atoms().set_value(1, 0.9);
        assert_eq!(store.atoms().get_value(1), 0.0);
        assert_eq!(copy.terms().unwrap(), store.terms().unwrap());
    }

    #[test]
    fn compact_drops_terms_on_deleted_atoms() {
        let mut store = store_with_terms(3);
        store.atoms().delete(2);
        // Terms (0,1), (1,2), (2,0): two touch atom 2.
        assert_eq!(store.compact(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.atoms().len(), 2);
        let _ = Comparator::Lte;
    }
}
