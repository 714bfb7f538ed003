//! The term store contract shared by every store variant.
//!
//! Stores hand their terms to reasoners a page at a time through
//! [`TermStore::visit_pages`]. Each page comes with a mutable scratch buffer
//! holding reasoner-private per-term state (ADMM local copies and duals, or
//! dual-LCQP variables). Scratch survives paging but not a process restart.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::database::AtomStore;
use crate::error::{HlmrfResult, StoreError};
use crate::term::Term;
use crate::term::blocker::BlockerTermStore;
use crate::term::dual::{DualAtom, DualTermStore};

/// Layout of the per-term scratch buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScratchKind {
    None,
    /// Local copy `x` then unscaled dual `y`, `size` floats each.
    Admm,
    /// Term dual variable then slack-bound dual.
    DualLcqp,
}

impl ScratchKind {
    /// Scratch floats for a term of `size` atoms.
    pub fn width(self, size: usize) -> usize {
        match self {
            ScratchKind::None => 0,
            ScratchKind::Admm => 2 * size,
            ScratchKind::DualLcqp => 2,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            ScratchKind::None => 0,
            ScratchKind::Admm => 1,
            ScratchKind::DualLcqp => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ScratchKind::None),
            1 => Some(ScratchKind::Admm),
            2 => Some(ScratchKind::DualLcqp),
            _ => None,
        }
    }
}

/// Whether a pass writes scratch back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMode {
    /// Scratch changes are persisted after each page.
    ReadWrite,
    /// Scratch is visible but changes are discarded.
    ReadOnly,
}

/// One page of terms and its scratch.
pub struct PageView<'a> {
    /// Store-wide index of `terms[0]`.
    pub first_term: usize,
    pub terms: &'a [Term],
    pub scratch: &'a mut [f32],
    pub kind: ScratchKind,
}

/// A term with its slice of the page scratch.
pub struct TermSlot<'a> {
    pub index: usize,
    pub term: &'a Term,
    pub scratch: &'a mut [f32],
}

impl<'a> PageView<'a> {
    /// Split the page into per-term slots, ready for a parallel pass.
    pub fn slots(self) -> Vec<TermSlot<'a>> {
        let mut rest = self.scratch;
        let mut out = Vec::with_capacity(self.terms.len());
        for (i, term) in self.terms.iter().enumerate() {
            let width = self.kind.width(term.size());
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(width);
            rest = tail;
            out.push(TermSlot {
                index: self.first_term + i,
                term,
                scratch: head,
            });
        }
        out
    }
}

/// Called once per page.
pub type PageVisitor<'v> = dyn FnMut(PageView<'_>) -> HlmrfResult<()> + 'v;

/// Saved scratch of one term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermState {
    pub scratch: Vec<f32>,
}

/// Everything needed to warm-start a later optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    pub kind: ScratchKind,
    pub terms: Vec<TermState>,
    pub atom_values: Vec<f32>,
    /// Per-atom dual state, only for the dual-augmented store.
    #[serde(default)]
    pub dual_atoms: Vec<DualAtom>,
}

/// A collection of terms plus the atom store they index into.
pub trait TermStore: Send {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    fn atoms(&self) -> &Arc<AtomStore>;

    /// Append a term. Returns the number of terms held afterwards.
    fn add(&mut self, term: Term) -> HlmrfResult<usize>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bring the terms up to date with their source before a pass.
    ///
    /// Stores that ground lazily re-ground here when the facts changed.
    fn refresh(&mut self) -> HlmrfResult<()> {
        Ok(())
    }

    /// Pre-size storage for `terms` terms.
    fn ensure_capacity(&mut self, terms: usize);

    /// Make sure every term has scratch of `kind`.
    ///
    /// Returns `true` when the scratch was (re)initialized to zero, `false`
    /// when existing scratch of that kind was kept for a warm start.
    fn prepare_scratch(&mut self, kind: ScratchKind) -> HlmrfResult<bool>;

    fn scratch_kind(&self) -> ScratchKind;

    /// Visit every active term, page by page, in a stable order.
    fn visit_pages(&mut self, mode: CursorMode, visitor: &mut PageVisitor<'_>) -> HlmrfResult<()>;

    /// Drop every term. The atom store is kept.
    fn clear(&mut self) -> HlmrfResult<()>;

    /// Drop every term and release the atoms and any files.
    fn close(&mut self) -> HlmrfResult<()>;

    /// Snapshot term scratch and atom values.
    fn save_state(&mut self) -> HlmrfResult<StoreState> {
        let kind = self.scratch_kind();
        let mut terms = vec![TermState { scratch: Vec::new() }; self.len()];
        self.visit_pages(CursorMode::ReadOnly, &mut |page| {
            for slot in page.slots() {
                terms[slot.index].scratch = slot.scratch.to_vec();
            }
            Ok(())
        })?;
        Ok(StoreState {
            kind,
            terms,
            atom_values: self.atoms().values(),
            dual_atoms: Vec::new(),
        })
    }

    /// Restore a snapshot taken from this store or a copy of it.
    fn load_state(&mut self, state: &StoreState) -> HlmrfResult<()> {
        if state.terms.len() != self.len() {
            return Err(StoreError::StateMismatch {
                message: format!(
                    "snapshot has {} terms, store has {}",
                    state.terms.len(),
                    self.len()
                ),
            }
            .into());
        }
        if state.atom_values.len() != self.atoms().len() {
            return Err(StoreError::StateMismatch {
                message: format!(
                    "snapshot has {} atoms, store has {}",
                    state.atom_values.len(),
                    self.atoms().len()
                ),
            }
            .into());
        }
        self.prepare_scratch(state.kind)?;
        self.visit_pages(CursorMode::ReadWrite, &mut |page| {
            for slot in page.slots() {
                let saved = &state.terms[slot.index].scratch;
                if saved.len() != slot.scratch.len() {
                    return Err(StoreError::StateMismatch {
                        message: format!(
                            "term {} has {} scratch values, snapshot has {}",
                            slot.index,
                            slot.scratch.len(),
                            saved.len()
                        ),
                    }
                    .into());
                }
                slot.scratch.copy_from_slice(saved);
            }
            Ok(())
        })?;
        self.atoms().write_back(&state.atom_values);
        Ok(())
    }

    /// Deep copy with its own atom store.
    fn copy_store(&mut self) -> HlmrfResult<Box<dyn TermStore>>;

    /// Visit every term read-only with its store-wide index.
    fn for_each_term(&mut self, f: &mut dyn FnMut(usize, &Term)) -> HlmrfResult<()> {
        self.visit_pages(CursorMode::ReadOnly, &mut |page| {
            for (i, term) in page.terms.iter().enumerate() {
                f(page.first_term + i, term);
            }
            Ok(())
        })
    }

    /// Every term, cloned. Intended for small stores and tests.
    fn terms(&mut self) -> HlmrfResult<Vec<Term>> {
        let mut out = Vec::with_capacity(self.len());
        self.for_each_term(&mut |_, t| out.push(t.clone()))?;
        Ok(out)
    }

    fn as_dual(&mut self) -> Option<&mut DualTermStore> {
        None
    }

    fn as_blocker(&mut self) -> Option<&mut BlockerTermStore> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Comparator, RuleId};
    use crate::term::TermKind;

    fn term(size: usize) -> Term {
        Term::new(
            RuleId::new(0),
            (0..size as u32).collect(),
            vec![1.0; size],
            1.0,
            TermKind::Constraint {
                comparator: Comparator::Lte,
            },
        )
    }

    #[test]
    fn slots_partition_the_scratch() {
        let terms = vec![term(1), term(3), term(2)];
        let mut scratch = vec![0.0; 12];
        let view = PageView {
            first_term: 10,
            terms: &terms,
            scratch: &mut scratch,
            kind: ScratchKind::Admm,
        };
        let slots = view.slots();
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].index, 10);
        assert_eq!(slots[1].scratch.len(), 6);
        assert_eq!(slots[2].scratch.len(), 4);
        for slot in slots {
            slot.scratch.fill(slot.index as f32);
        }
        assert_eq!(scratch[0], 10.0);
        assert_eq!(scratch[2], 11.0);
        assert_eq!(scratch[11], 12.0);
    }

    #[test]
    fn scratch_tags_round_trip() {
        for kind in [ScratchKind::None, ScratchKind::Admm, ScratchKind::DualLcqp] {
            assert_eq!(ScratchKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(ScratchKind::from_tag(9), None);
        assert_eq!(ScratchKind::DualLcqp.width(5), 2);
    }
}
