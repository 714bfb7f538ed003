//! The model context: predicate and rule tables.
//!
//! A [`Model`] is passed explicitly to grounding and term-store construction.
//! It owns every predicate and rule with a clear lifetime, so concurrent
//! inference runs never share hidden mutable registries.

pub mod atom;
pub mod document;
pub mod formula;
pub mod predicate;
pub mod rule;

use std::collections::HashMap;

use crate::error::{HlmrfResult, ModelError};

pub use atom::{AtomKind, Constant, GroundAtom};
pub use document::ModelDocument;
pub use formula::{Arg, Filter, Formula, Literal, QueryAtom};
pub use predicate::{Predicate, PredicateId};
pub use rule::{ArithmeticRule, Coefficient, Comparator, LogicalRule, Rule, RuleId, Summand};

#[derive(Debug, Clone)]
struct RuleEntry {
    rule: Rule,
    active: bool,
}

/// Predicate and rule tables for one inference problem.
#[derive(Debug, Clone, Default)]
pub struct Model {
    predicates: Vec<Predicate>,
    by_name: HashMap<String, PredicateId>,
    /// Deleted rules leave a `None` so ids stay stable.
    rules: Vec<Option<RuleEntry>>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a predicate. Closed predicates are fully observed.
    pub fn add_predicate(
        &mut self,
        name: impl Into<String>,
        arity: usize,
        closed: bool,
    ) -> HlmrfResult<PredicateId> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(ModelError::DuplicatePredicate { name }.into());
        }
        let id = PredicateId::from_index(self.predicates.len());
        self.predicates.push(Predicate {
            id,
            name: name.clone(),
            arity,
            closed,
        });
        self.by_name.insert(name, id);
        Ok(id)
    }

    pub fn predicate(&self, id: PredicateId) -> &Predicate {
        &self.predicates[id.index()]
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Look up a predicate by name.
    pub fn lookup(&self, name: &str) -> HlmrfResult<PredicateId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| ModelError::UnknownPredicate { name: name.into() }.into())
    }

    /// Build a ground atom, checking arity.
    pub fn atom<S: AsRef<str>>(&self, predicate: &str, args: &[S]) -> HlmrfResult<GroundAtom> {
        let id = self.lookup(predicate)?;
        let declared = self.predicate(id);
        if declared.arity != args.len() {
            return Err(ModelError::ArityMismatch {
                predicate: declared.name.clone(),
                expected: declared.arity,
                actual: args.len(),
            }
            .into());
        }
        Ok(GroundAtom::new(
            id,
            args.iter().map(|a| Constant::new(a.as_ref())).collect(),
        ))
    }

    /// Validate and register a rule. New rules start active.
    pub fn add_rule(&mut self, rule: Rule) -> HlmrfResult<RuleId> {
        rule.validate(&self.predicates)?;
        let id = RuleId::new(self.rules.len() as u32);
        tracing::debug!(rule = %id, weighted = rule.is_weighted(), "registered rule");
        self.rules.push(Some(RuleEntry { rule, active: true }));
        Ok(id)
    }

    pub fn rule(&self, id: RuleId) -> HlmrfResult<&Rule> {
        self.entry(id).map(|e| &e.rule)
    }

    pub fn is_active(&self, id: RuleId) -> bool {
        self.entry(id).map(|e| e.active).unwrap_or(false)
    }

    pub fn set_active(&mut self, id: RuleId, active: bool) -> HlmrfResult<()> {
        let entry = self
            .rules
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(ModelError::UnknownRule { rule: id.get() })?;
        entry.active = active;
        Ok(())
    }

    /// Remove a rule. Its id is never reused.
    pub fn remove_rule(&mut self, id: RuleId) -> HlmrfResult<Rule> {
        self.rules
            .get_mut(id.index())
            .and_then(Option::take)
            .map(|e| e.rule)
            .ok_or_else(|| ModelError::UnknownRule { rule: id.get() }.into())
    }

    /// Active rules in id order.
    pub fn rules(&self) -> impl Iterator<Item = (RuleId, &Rule)> {
        self.all_rules()
            .filter(|(id, _)| self.is_active(*id))
    }

    /// Every registered rule, active or not.
    pub fn all_rules(&self) -> impl Iterator<Item = (RuleId, &Rule)> {
        self.rules.iter().enumerate().filter_map(|(i, e)| {
            e.as_ref().map(|e| (RuleId::new(i as u32), &e.rule))
        })
    }

    /// Render an atom with predicate names, e.g. `Friends(alice, bob)`.
    pub fn format_atom(&self, atom: &GroundAtom) -> String {
        let args: Vec<&str> = atom.args.iter().map(Constant::as_str).collect();
        let name = self
            .predicates
            .get(atom.predicate.index())
            .map(|p| p.name.as_str())
            .unwrap_or("?");
        format!("{name}({})", args.join(", "))
    }

    fn entry(&self, id: RuleId) -> HlmrfResult<&RuleEntry> {
        self.rules
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| ModelError::UnknownRule { rule: id.get() }.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_are_interned_per_model() {
        let mut a = Model::new();
        let mut b = Model::new();
        let nice_a = a.add_predicate("Nice", 1, true).unwrap();
        b.add_predicate("Other", 2, false).unwrap();
        let nice_b = b.add_predicate("Nice", 1, true).unwrap();
        assert_ne!(nice_a, nice_b);
        assert_eq!(a.lookup("Nice").unwrap(), nice_a);
        assert!(a.lookup("Other").is_err());
    }

    #[test]
    fn duplicate_predicate_is_rejected() {
        let mut m = Model::new();
        m.add_predicate("Nice", 1, true).unwrap();
        assert!(m.add_predicate("Nice", 2, false).is_err());
    }

    #[test]
    fn rule_lifecycle() {
        let mut m = Model::new();
        let nice = m.add_predicate("Nice", 1, true).unwrap();
        let happy = m.add_predicate("Happy", 1, false).unwrap();
        let rule = Rule::Logical(
            LogicalRule::new(
                Some(1.0),
                false,
                &Formula::atom(nice, vec![Arg::var("A")]),
                &Formula::atom(happy, vec![Arg::var("A")]),
            )
            .unwrap(),
        );
        let id = m.add_rule(rule).unwrap();
        assert_eq!(m.rules().count(), 1);
        m.set_active(id, false).unwrap();
        assert_eq!(m.rules().count(), 0);
        assert_eq!(m.all_rules().count(), 1);
        m.remove_rule(id).unwrap();
        assert!(m.rule(id).is_err());
        assert!(m.remove_rule(id).is_err());
    }

    #[test]
    fn atom_checks_arity() {
        let mut m = Model::new();
        m.add_predicate("Friends", 2, false).unwrap();
        let atom = m.atom("Friends", &["a", "b"]).unwrap();
        assert_eq!(m.format_atom(&atom), "Friends(a, b)");
        assert!(m.atom("Friends", &["a"]).is_err());
    }
}
