//! Term store augmented with per-atom dual state for the dual LCQP reasoner.
//!
//! Per-term dual variables live in the wrapped store's scratch
//! ([`ScratchKind::DualLcqp`]: term dual, then slack-bound dual). Per-atom
//! state cannot be paged with terms, so it is kept here, aligned with the
//! atom store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::database::AtomStore;
use crate::error::{HlmrfResult, StoreError};
use crate::term::Term;
use crate::term::store::{CursorMode, PageVisitor, ScratchKind, StoreState, TermStore};

/// Dual variables below this are treated as zero when clipping partials.
pub const STRICT_EPSILON: f64 = 1e-8;

/// Dual state of one atom.
///
/// `message` is the atom's total influence on the dual objective:
/// `Σ term dual · coefficient − lower_bound_dual + upper_bound_dual`.
/// Every change to a dual variable touching the atom must go through
/// [`DualAtom::update`] or the bound setters to keep it consistent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DualAtom {
    pub message: f64,
    pub lower_bound_dual: f64,
    pub upper_bound_dual: f64,
}

impl DualAtom {
    /// Primal value recovered from the message.
    pub fn primal(&self, regularization: f64) -> f32 {
        (-self.message / (2.0 * regularization)) as f32
    }

    pub fn lower_bound_partial(&self, regularization: f64) -> f64 {
        let partial = -self.message / regularization;
        if self.lower_bound_dual.abs() < STRICT_EPSILON && partial > 0.0 {
            0.0
        } else {
            partial
        }
    }

    pub fn upper_bound_partial(&self, regularization: f64) -> f64 {
        let partial = self.message / regularization + 2.0;
        if self.upper_bound_dual.abs() < STRICT_EPSILON && partial > 0.0 {
            0.0
        } else {
            partial
        }
    }

    /// Account for a term dual change and take a projected step on both
    /// bound duals. Partials are taken before the message moves.
    pub fn update(&mut self, term_dual_delta: f64, coefficient: f64, regularization: f64, step: f64) {
        let lower = self.lower_bound_partial(regularization);
        let upper = self.upper_bound_partial(regularization);
        self.message += term_dual_delta * coefficient;
        self.set_lower_bound_dual((self.lower_bound_dual - step * lower).max(0.0));
        self.set_upper_bound_dual((self.upper_bound_dual - step * upper).max(0.0));
    }

    pub fn set_lower_bound_dual(&mut self, value: f64) {
        self.message -= value - self.lower_bound_dual;
        self.lower_bound_dual = value;
    }

    pub fn set_upper_bound_dual(&mut self, value: f64) {
        self.message += value - self.upper_bound_dual;
        self.upper_bound_dual = value;
    }

    /// Contribution of the `0 <= x <= 1` bound constraints to the dual objective.
    pub fn bound_objective(&self, regularization: f64) -> f64 {
        let lower = -self.message * self.lower_bound_dual / (2.0 * regularization);
        let upper = self.message * self.upper_bound_dual / (2.0 * regularization)
            + 2.0 * self.upper_bound_dual;
        lower + upper
    }
}

/// A term store plus one [`DualAtom`] per atom.
pub struct DualTermStore {
    inner: Box<dyn TermStore>,
    atoms: Vec<DualAtom>,
}

impl DualTermStore {
    pub fn new(inner: Box<dyn TermStore>) -> Self {
        let atoms = vec![DualAtom::default(); inner.atoms().len()];
        Self { inner, atoms }
    }

    pub fn inner(&mut self) -> &mut dyn TermStore {
        self.inner.as_mut()
    }

    pub fn dual_atoms(&self) -> &[DualAtom] {
        &self.atoms
    }

    /// Move the dual atoms out for an optimization pass, grown to cover
    /// every atom. Atoms new since the last pass start at zero.
    pub fn take_dual_atoms(&mut self) -> Vec<DualAtom> {
        let mut atoms = std::mem::take(&mut self.atoms);
        atoms.resize(self.inner.atoms().len(), DualAtom::default());
        atoms
    }

    pub fn restore_dual_atoms(&mut self, atoms: Vec<DualAtom>) {
        self.atoms = atoms;
    }
}

impl TermStore for DualTermStore {
    fn name(&self) -> &'static str {
        "dual"
    }

    fn atoms(&self) -> &Arc<AtomStore> {
        self.inner.atoms()
    }

    fn add(&mut self, term: Term) -> HlmrfResult<usize> {
        // A new term's dual is zero, so no message changes.
        self.inner.add(term)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn refresh(&mut self) -> HlmrfResult<()> {
        self.inner.refresh()
    }

    fn ensure_capacity(&mut self, terms: usize) {
        self.inner.ensure_capacity(terms);
    }

    fn prepare_scratch(&mut self, kind: ScratchKind) -> HlmrfResult<bool> {
        let reset = self.inner.prepare_scratch(kind)?;
        if reset {
            self.atoms = vec![DualAtom::default(); self.inner.atoms().len()];
        }
        Ok(reset)
    }

    fn scratch_kind(&self) -> ScratchKind {
        self.inner.scratch_kind()
    }

    fn visit_pages(&mut self, mode: CursorMode, visitor: &mut PageVisitor<'_>) -> HlmrfResult<()> {
        self.inner.visit_pages(mode, visitor)
    }

    fn clear(&mut self) -> HlmrfResult<()> {
        self.atoms.clear();
        self.inner.clear()
    }

    fn close(&mut self) -> HlmrfResult<()> {
        self.atoms.clear();
        self.inner.close()
    }

    fn save_state(&mut self) -> HlmrfResult<StoreState> {
        let mut state = self.inner.save_state()?;
        let mut atoms = self.atoms.clone();
        atoms.resize(state.atom_values.len(), DualAtom::default());
        state.dual_atoms = atoms;
        Ok(state)
    }

    fn load_state(&mut self, state: &StoreState) -> HlmrfResult<()> {
        if !state.dual_atoms.is_empty() && state.dual_atoms.len() != state.atom_values.len() {
            return Err(StoreError::StateMismatch {
                message: format!(
                    "snapshot has {} dual atoms for {} atoms",
                    state.dual_atoms.len(),
                    state.atom_values.len()
                ),
            }
            .into());
        }
        self.inner.load_state(state)?;
        self.atoms = if state.dual_atoms.is_empty() {
            vec![DualAtom::default(); state.atom_values.len()]
        } else {
            state.dual_atoms.clone()
        };
        Ok(())
    }

    fn copy_store(&mut self) -> HlmrfResult<Box<dyn TermStore>> {
        let state = self.save_state()?;
        let mut copy = DualTermStore::new(self.inner.copy_store()?);
        copy.load_state(&state)?;
        Ok(Box::new(copy))
    }

    fn as_dual(&mut self) -> Option<&mut DualTermStore> {
        Some(self)
    }
}

impl std::fmt::Debug for DualTermStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualTermStore")
            .field("inner", &self.inner.name())
            .field("terms", &self.inner.len())
            .field("dual_atoms", &self.atoms.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AtomKind, GroundAtom, PredicateId, RuleId};
    use crate::term::memory::MemoryTermStore;
    use crate::term::{Shape, TermKind};

    fn dual_store() -> DualTermStore {
        let atoms = Arc::new(AtomStore::new());
        for name in ["a", "b"] {
            atoms.intern(
                &GroundAtom::new(PredicateId::from_index(0), vec![name.into()]),
                AtomKind::RandomVariable,
                0.0,
            );
        }
        let mut inner = MemoryTermStore::new(atoms);
        inner
            .add(Term::new(
                RuleId::new(0),
                vec![0, 1],
                vec![1.0, -1.0],
                0.0,
                TermKind::Potential {
                    weight: 1.0,
                    shape: Shape::Hinge,
                },
            ))
            .unwrap();
        DualTermStore::new(Box::new(inner))
    }

    #[test]
    fn bound_setters_keep_message_consistent() {
        let mut atom = DualAtom::default();
        atom.set_upper_bound_dual(0.5);
        atom.set_lower_bound_dual(0.2);
        assert!((atom.message - 0.3).abs() < 1e-12);
        atom.set_upper_bound_dual(0.0);
        assert!((atom.message + 0.2).abs() < 1e-12);
        assert!((atom.primal(0.1) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_duals_clip_positive_partials() {
        let atom = DualAtom::default();
        // Upper partial is message/reg + 2 = 2 > 0 at a zero dual.
        assert_eq!(atom.upper_bound_partial(0.01), 0.0);
        let atom = DualAtom {
            message: 1.0,
            ..DualAtom::default()
        };
        // Lower partial is -message/reg < 0, never clipped.
        assert!(atom.lower_bound_partial(0.5) < 0.0);
    }

    #[test]
    fn update_moves_message_by_term_delta() {
        let mut atom = DualAtom::default();
        atom.update(0.4, -1.0, 0.01, 0.0);
        assert!((atom.message + 0.4).abs() < 1e-12);
        assert_eq!(atom.lower_bound_dual, 0.0);
    }

    #[test]
    fn state_round_trip_includes_dual_atoms() {
        let mut store = dual_store();
        store.prepare_scratch(ScratchKind::DualLcqp).unwrap();
        let mut atoms = store.take_dual_atoms();
        atoms[1].set_upper_bound_dual(0.25);
        store.restore_dual_atoms(atoms);
        let saved = store.save_state().unwrap();
        assert_eq!(saved.dual_atoms.len(), 2);

        let mut atoms = store.take_dual_atoms();
        atoms[1] = DualAtom::default();
        store.restore_dual_atoms(atoms);
        store.load_state(&saved).unwrap();
        assert_eq!(store.dual_atoms()[1].upper_bound_dual, 0.25);
    }

    #[test]
    fn fresh_scratch_resets_dual_atoms() {
        let mut store = dual_store();
        store.prepare_scratch(ScratchKind::DualLcqp).unwrap();
        let mut atoms = store.take_dual_atoms();
        atoms[0].message = 3.0;
        store.restore_dual_atoms(atoms);
        assert!(!store.prepare_scratch(ScratchKind::DualLcqp).unwrap());
        assert_eq!(store.dual_atoms()[0].message, 3.0);
        assert!(store.prepare_scratch(ScratchKind::Admm).unwrap());
        assert_eq!(store.dual_atoms()[0], DualAtom::default());
    }

    #[test]
    fn as_dual_exposes_the_store() {
        let mut store = dual_store();
        assert!(store.as_dual().is_some());
        let mut copy = store.copy_store().unwrap();
        assert!(copy.as_dual().is_some());
    }
}
