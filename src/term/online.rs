//! Incrementally maintained paged term store.
//!
//! Each page holds the terms of exactly one rule, so rules can be activated,
//! deactivated and deleted by touching only their pages. Atoms added at
//! runtime are parked in the special partitions; the next refresh grounds
//! just the substitutions that use them, then merges them into the regular
//! partitions in one step. Mutations of atoms already in the model (value
//! changes of observations, deletions, RV → observation) invalidate every
//! rule mentioning the predicate, and those rules are re-ground in full.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::database::{AtomStore, Database, Partition};
use crate::error::{DatabaseError, HlmrfResult};
use crate::grounding::{AtomManager, Grounder, GroundingReport, PartialPlan};
use crate::model::{AtomKind, GroundAtom, Model, PredicateId, Rule, RuleId};
use crate::term::memory::MemoryTermStore;
use crate::term::store::{CursorMode, PageVisitor, ScratchKind, TermStore};
use crate::term::streaming::{PageMeta, PagedTerms, PagingConfig};
use crate::term::{Term, TermGenerator};

/// Outcome of an atom mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomChange {
    /// The atom was not known before.
    Added,
    /// An existing atom changed.
    Modified,
    /// The atom does not exist, nothing happened.
    Missing,
}

pub struct OnlineTermStore {
    model: Model,
    database: Arc<Database>,
    generator: TermGenerator,
    atoms: Arc<AtomStore>,
    paged: PagedTerms,
    grounded: bool,
    /// Predicates whose existing atoms changed since the last refresh.
    mutated: BTreeSet<PredicateId>,
    /// Rules to re-ground in full once active.
    stale: BTreeSet<RuleId>,
    /// What the last refresh that grounded anything produced.
    last_grounding: GroundingReport,
    /// Whether the special partitions hold atoms from [`Self::add_atom`], as
    /// opposed to activations only.
    special_added: bool,
}

impl OnlineTermStore {
    pub fn new(
        model: Model,
        database: Arc<Database>,
        atoms: Arc<AtomStore>,
        generator: TermGenerator,
        config: PagingConfig,
    ) -> HlmrfResult<Self> {
        Ok(Self {
            model,
            database,
            generator,
            atoms,
            paged: PagedTerms::new(config, true)?,
            grounded: false,
            mutated: BTreeSet::new(),
            stale: BTreeSet::new(),
            last_grounding: GroundingReport::default(),
            special_added: false,
        })
    }

    /// Counts from the last refresh that grounded anything: the initial
    /// grounding, or the partial and rebuilt rules of a later refresh.
    pub fn last_grounding(&self) -> &GroundingReport {
        &self.last_grounding
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn pages(&self) -> &[PageMeta] {
        self.paged.meta()
    }

    /// Whether the terms reflect every change made so far.
    pub fn is_current(&self) -> bool {
        self.grounded
            && self.mutated.is_empty()
            && !self.database.has_special()
            && self.stale.iter().all(|r| !self.model.is_active(*r))
    }

    // -----------------------------------------------------------------------
    // Rules
    // -----------------------------------------------------------------------

    /// Add a rule and ground it right away if the store is live.
    pub fn add_rule(&mut self, rule: Rule) -> HlmrfResult<RuleId> {
        let id = self.model.add_rule(rule)?;
        if self.grounded {
            self.stale.insert(id);
        }
        tracing::info!(rule = %id, "rule added");
        Ok(id)
    }

    /// Include a rule's pages in passes again.
    pub fn activate_rule(&mut self, id: RuleId) -> HlmrfResult<()> {
        self.model.set_active(id, true)?;
        let pages = self.paged.set_rule_active(id, true);
        tracing::debug!(rule = %id, pages, "rule activated");
        Ok(())
    }

    /// Skip a rule's pages without dropping them.
    pub fn deactivate_rule(&mut self, id: RuleId) -> HlmrfResult<()> {
        self.model.set_active(id, false)?;
        self.paged.flush()?;
        let pages = self.paged.set_rule_active(id, false);
        tracing::debug!(rule = %id, pages, "rule deactivated");
        Ok(())
    }

    /// Drop a rule and its pages.
    pub fn delete_rule(&mut self, id: RuleId) -> HlmrfResult<Rule> {
        let removed = self.paged.remove_rule(id)?;
        self.stale.remove(&id);
        let rule = self.model.remove_rule(id)?;
        tracing::info!(rule = %id, terms = removed, "rule deleted");
        Ok(rule)
    }

    // -----------------------------------------------------------------------
    // Atoms
    // -----------------------------------------------------------------------

    /// Add an atom to `partition` (READ or WRITE).
    ///
    /// An atom new to the model is parked for partial grounding. An atom the
    /// model already knows is replaced in place.
    pub fn add_atom(&mut self, partition: Partition, atom: GroundAtom, value: f32) -> HlmrfResult<AtomChange> {
        let partition = partition.merged();
        let known = self.database.contains(&atom) || self.atoms.get_index(&atom).is_some();
        if !self.grounded || !known {
            let target = if self.grounded { partition.special() } else { partition };
            self.special_added |= self.grounded;
            self.database.insert(target, atom, value)?;
            return Ok(AtomChange::Added);
        }
        self.database.insert(partition, atom.clone(), value)?;
        self.reclassify(&atom);
        self.mutated.insert(atom.predicate);
        Ok(AtomChange::Modified)
    }

    /// Store random variables that grounding created but the database does
    /// not hold yet, keeping their current values.
    ///
    /// The next refresh grounds the substitutions they newly match; ground
    /// rules that already reference them are left alone.
    pub fn activate_atoms(&mut self, atoms: &[(GroundAtom, f32)]) -> HlmrfResult<usize> {
        let mut activated = 0;
        for (atom, value) in atoms {
            if self.database.contains(atom) {
                continue;
            }
            let target = if self.grounded {
                Partition::SpecialWrite
            } else {
                Partition::Write
            };
            self.database.insert(target, atom.clone(), *value)?;
            activated += 1;
        }
        tracing::debug!(activated, "activated atoms");
        Ok(activated)
    }

    /// Remove an atom from the database and the model.
    pub fn delete_atom(&mut self, atom: &GroundAtom) -> HlmrfResult<AtomChange> {
        if self.database.remove(atom).is_none() {
            return Ok(AtomChange::Missing);
        }
        if let Some(index) = self.atoms.get_index(atom) {
            self.atoms.delete(index);
        }
        self.mutated.insert(atom.predicate);
        Ok(AtomChange::Modified)
    }

    /// Change an atom's value.
    ///
    /// A random variable's value is only a warm start. An observation's
    /// value is folded into term constants, so its rules are re-ground.
    pub fn update_atom(&mut self, atom: &GroundAtom, value: f32) -> HlmrfResult<AtomChange> {
        let Some(fact) = self.database.get(atom) else {
            return Ok(AtomChange::Missing);
        };
        self.database.set_value(atom, value)?;
        match self.atoms.get_index(atom) {
            Some(index) if self.atoms.kind(index) == AtomKind::RandomVariable => {
                self.atoms.set_value(index, value);
            }
            Some(index) => {
                self.atoms.set_value(index, value);
                self.mutated.insert(atom.predicate);
            }
            None if fact.partition.is_observed() => {
                self.mutated.insert(atom.predicate);
            }
            None => {}
        }
        Ok(AtomChange::Modified)
    }

    /// Turn a random variable into an observation.
    pub fn observe_atom(&mut self, atom: &GroundAtom, value: f32) -> HlmrfResult<AtomChange> {
        let Some(fact) = self.database.get(atom) else {
            return Err(DatabaseError::MissingAtom {
                atom: self.model.format_atom(atom),
            }
            .into());
        };
        if fact.partition.is_observed() {
            return self.update_atom(atom, value);
        }
        let partition = if fact.partition.is_special() {
            Partition::SpecialRead
        } else {
            Partition::Read
        };
        self.database.insert(partition, atom.clone(), value)?;
        if let Some(index) = self.atoms.get_index(atom) {
            self.atoms.observe(index, value);
            self.mutated.insert(atom.predicate);
        }
        Ok(AtomChange::Modified)
    }

    /// Current value of an atom: the inferred value for atoms in the model,
    /// the stored value otherwise.
    pub fn value(&self, atom: &GroundAtom) -> Option<f32> {
        match self.atoms.get_index(atom) {
            Some(index) => Some(self.atoms.get_value(index)),
            None => self.database.get(atom).map(|f| f.value),
        }
    }

    /// Apply the database classification of `atom` to its interned copy.
    fn reclassify(&self, atom: &GroundAtom) {
        let Some(index) = self.atoms.get_index(atom) else {
            return;
        };
        let manager = AtomManager::new(&self.model, self.database.as_ref(), &self.atoms);
        let (kind, value) = manager.classify(atom);
        self.atoms.set_kind(index, kind);
        self.atoms.set_value(index, value);
    }

    // -----------------------------------------------------------------------
    // Grounding
    // -----------------------------------------------------------------------

    fn ground_rules(&mut self, rules: &[RuleId]) -> HlmrfResult<GroundingReport> {
        let grounder = Grounder::new(&self.model, self.database.as_ref(), &self.atoms, &self.generator);
        let paged = &mut self.paged;
        let report = grounder.ground_rules(rules, &mut |rule, term| paged.push(rule, term))?;
        self.paged.flush()?;
        Ok(report)
    }

    fn ground_partial(
        &mut self,
        plan: &PartialPlan,
        new: &BTreeSet<PredicateId>,
    ) -> HlmrfResult<GroundingReport> {
        let grounder = Grounder::new(&self.model, self.database.as_ref(), &self.atoms, &self.generator);
        let paged = &mut self.paged;
        let mut report = GroundingReport::default();
        for &rule in &plan.partial {
            report.merge(grounder.ground_new(rule, new, &mut |rule, term| paged.push(rule, term))?);
        }
        self.paged.flush()?;
        Ok(report)
    }

    /// Rules (active or not) that mention any of `predicates`.
    fn rules_mentioning(&self, predicates: &BTreeSet<PredicateId>) -> BTreeSet<RuleId> {
        self.model
            .all_rules()
            .filter(|(_, rule)| rule.predicates().iter().any(|p| predicates.contains(p)))
            .map(|(id, _)| id)
            .collect()
    }

    fn initial_grounding(&mut self) -> HlmrfResult<()> {
        self.database.merge_special();
        let rules: Vec<RuleId> = self.model.rules().map(|(id, _)| id).collect();
        let report = self.ground_rules(&rules)?;
        self.grounded = true;
        self.mutated.clear();
        self.stale = self
            .model
            .all_rules()
            .map(|(id, _)| id)
            .filter(|id| !self.model.is_active(*id))
            .collect();
        tracing::info!(terms = report.terms, pages = self.paged.meta().len(), "online store ground");
        self.last_grounding = report;
        Ok(())
    }
}

impl TermStore for OnlineTermStore {
    fn name(&self) -> &'static str {
        "online"
    }

    fn atoms(&self) -> &Arc<AtomStore> {
        &self.atoms
    }

    fn add(&mut self, term: Term) -> HlmrfResult<usize> {
        self.paged.push(term.rule, term)?;
        Ok(self.paged.len())
    }

    fn len(&self) -> usize {
        self.paged.len()
    }

    fn refresh(&mut self) -> HlmrfResult<()> {
        if !self.grounded {
            return self.initial_grounding();
        }

        let new = self.database.special_predicates();
        let mut grounding = GroundingReport::default();
        if !new.is_empty() {
            let plan = if self.special_added {
                PartialPlan::new(&self.model, &new)
            } else {
                PartialPlan::for_activation(&self.model, &new)
            };
            self.special_added = false;
            self.stale.extend(plan.full.iter().copied());
            // Inactive rules miss the partial pass and are rebuilt on activation.
            let inactive: BTreeSet<RuleId> = self
                .rules_mentioning(&new)
                .into_iter()
                .filter(|id| !self.model.is_active(*id))
                .collect();
            self.stale.extend(inactive);
            let plan = PartialPlan {
                partial: plan
                    .partial
                    .into_iter()
                    .filter(|r| !self.stale.contains(r))
                    .collect(),
                full: Vec::new(),
            };
            grounding = self.ground_partial(&plan, &new)?;
            let merged = self.database.merge_special();
            tracing::debug!(merged, terms = grounding.terms, "partial grounding merged");
        }

        let mutated = std::mem::take(&mut self.mutated);
        self.stale.extend(self.rules_mentioning(&mutated));

        let rebuild: Vec<RuleId> = self
            .stale
            .iter()
            .copied()
            .filter(|id| self.model.is_active(*id))
            .collect();
        if !rebuild.is_empty() {
            for &rule in &rebuild {
                self.paged.remove_rule(rule)?;
                self.stale.remove(&rule);
            }
            let report = self.ground_rules(&rebuild)?;
            tracing::debug!(rules = rebuild.len(), terms = report.terms, "re-ground rules");
            grounding.merge(report);
        }
        if !new.is_empty() || !rebuild.is_empty() {
            tracing::info!(
                new_predicates = new.len(),
                partial_terms = grounding.terms,
                rebuilt_rules = rebuild.len(),
                terms = self.paged.len(),
                "online store refreshed"
            );
            self.last_grounding = grounding;
        }
        Ok(())
    }

    fn ensure_capacity(&mut self, terms: usize) {
        self.paged.reserve(terms);
    }

    fn prepare_scratch(&mut self, kind: ScratchKind) -> HlmrfResult<bool> {
        self.paged.prepare_scratch(kind)
    }

    fn scratch_kind(&self) -> ScratchKind {
        self.paged.kind()
    }

    fn visit_pages(&mut self, mode: CursorMode, visitor: &mut PageVisitor<'_>) -> HlmrfResult<()> {
        let mut cursor = self.paged.cursor(mode);
        while cursor.next_page(visitor)? {}
        cursor.close()
    }

    fn clear(&mut self) -> HlmrfResult<()> {
        self.paged.clear()?;
        self.grounded = false;
        self.special_added = false;
        self.stale.clear();
        self.mutated.clear();
        Ok(())
    }

    fn close(&mut self) -> HlmrfResult<()> {
        self.clear()?;
        self.atoms.close();
        Ok(())
    }

    /// Copies are held in memory.
    fn copy_store(&mut self) -> HlmrfResult<Box<dyn TermStore>> {
        let state = self.save_state()?;
        let terms = self.paged.load_all()?;
        let mut copy = MemoryTermStore::new(Arc::new(self.atoms.copy()));
        copy.ensure_capacity(terms.len());
        for term in terms {
            copy.add(term)?;
        }
        copy.load_state(&state)?;
        Ok(Box::new(copy))
    }
}

impl std::fmt::Debug for OnlineTermStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnlineTermStore")
            .field("paged", &self.paged)
            .field("grounded", &self.grounded)
            .field("stale", &self.stale)
            .finish()
    }
}
