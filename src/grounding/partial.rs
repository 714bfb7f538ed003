//! Partial grounding for atoms added at runtime.
//!
//! New atoms sit in the special partitions while this runs. A rule whose
//! grounding query mentions a predicate with new atoms only needs the
//! substitutions that use at least one of them: the query is split with
//! [`Query::partial_queries`] so each such substitution is produced exactly
//! once and nothing already grounded is repeated. A rule that mentions the
//! predicate anywhere else (a head, a negated body literal, a summation) can
//! change shape for existing substitutions, so it is re-ground in full.
//! Atoms that ground rules already referenced before they were stored are the
//! exception; see [`PartialPlan::for_activation`].

use std::collections::BTreeSet;

use crate::database::Query;
use crate::error::HlmrfResult;
use crate::grounding::{Grounder, GroundingReport, TermSink};
use crate::model::{Model, PredicateId, Rule, RuleId};

/// Which rules a set of new predicates affects, and how.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialPlan {
    /// Rules that only need the new substitutions.
    pub partial: Vec<RuleId>,
    /// Rules that must drop their terms and be re-ground.
    pub full: Vec<RuleId>,
}

impl PartialPlan {
    pub fn new(model: &Model, new_predicates: &BTreeSet<PredicateId>) -> Self {
        let mut plan = PartialPlan::default();
        for (id, rule) in model.rules() {
            let touches = |atoms: Vec<&crate::model::QueryAtom>| {
                atoms
                    .into_iter()
                    .any(|a| new_predicates.contains(&a.predicate))
            };
            if touches(rule.non_query_atoms()) {
                plan.full.push(id);
            } else if touches(rule.query_atoms()) {
                plan.partial.push(id);
            }
        }
        plan
    }

    /// Plan for atoms that grounding already referenced as random variables
    /// before they were stored, as lazy inference activates them.
    ///
    /// Existing ground rules already point at these atoms, so heads and
    /// negated literals need nothing: only substitutions matching them in the
    /// query are new. An arithmetic rule summing over the predicate still
    /// sees its ranges grow and is re-ground.
    pub fn for_activation(model: &Model, new_predicates: &BTreeSet<PredicateId>) -> Self {
        let mut plan = PartialPlan::default();
        for (id, rule) in model.rules() {
            let touches = |atoms: Vec<&crate::model::QueryAtom>| {
                atoms
                    .into_iter()
                    .any(|a| new_predicates.contains(&a.predicate))
            };
            if matches!(rule, Rule::Arithmetic(_)) && touches(rule.non_query_atoms()) {
                plan.full.push(id);
            } else if touches(rule.query_atoms()) {
                plan.partial.push(id);
            }
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.partial.is_empty() && self.full.is_empty()
    }
}

impl Grounder<'_> {
    /// Ground only the substitutions of `rule` that use a new atom.
    pub fn ground_new(
        &self,
        rule: RuleId,
        new_predicates: &BTreeSet<PredicateId>,
        sink: &mut TermSink<'_>,
    ) -> HlmrfResult<GroundingReport> {
        let query = Query::for_rule(self.model.rule(rule)?);
        let mut report = GroundingReport::default();
        for partial in query.partial_queries(new_predicates) {
            let result = self.manager.engine().execute_query(&partial)?;
            report.merge(self.ground_result(rule, &result, sink)?);
        }
        tracing::debug!(rule = %rule, terms = report.terms, "partial grounding pass");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{AtomStore, Database, Partition};
    use crate::model::document::ModelDocument;
    use crate::term::{GeneratorConfig, TermGenerator};

    const MODEL: &str = r#"{
        "predicates": [
            {"name": "Nice", "arity": 1, "closed": true},
            {"name": "Friends", "arity": 2}
        ],
        "rules": [
            {"kind": "logical", "weight": 5.0, "squared": true,
             "body": [{"predicate": "Nice", "args": ["A"]}, {"predicate": "Nice", "args": ["B"]}],
             "filters": [{"left": "A", "op": "!=", "right": "B"}],
             "head": [{"predicate": "Friends", "args": ["A", "B"]}]},
            {"kind": "logical", "weight": 1.0,
             "body": [{"predicate": "Friends", "args": ["A", "B"]}],
             "head": [{"predicate": "Friends", "args": ["B", "A"]}]}
        ]
    }"#;

    #[test]
    fn plan_separates_query_and_head_predicates() {
        let model = ModelDocument::from_json(MODEL).unwrap().build().unwrap();
        let nice = model.lookup("Nice").unwrap();
        let friends = model.lookup("Friends").unwrap();

        let plan = PartialPlan::new(&model, &BTreeSet::from([nice]));
        assert_eq!(plan.partial, vec![RuleId::new(0)]);
        assert!(plan.full.is_empty());

        // Friends is in rule 0's head and in both positions of rule 1.
        let plan = PartialPlan::new(&model, &BTreeSet::from([friends]));
        assert_eq!(plan.full, vec![RuleId::new(0), RuleId::new(1)]);
    }

    #[test]
    fn activation_plan_grounds_query_matches_only() {
        let model = ModelDocument::from_json(MODEL).unwrap().build().unwrap();
        let friends = model.lookup("Friends").unwrap();
        let plan = PartialPlan::for_activation(&model, &BTreeSet::from([friends]));
        // Rule 0 only has Friends in its head; rule 1 matches it in the body.
        assert_eq!(plan.partial, vec![RuleId::new(1)]);
        assert!(plan.full.is_empty());
    }

    #[test]
    fn new_substitutions_only() {
        let model = ModelDocument::from_json(MODEL).unwrap().build().unwrap();
        let db = Database::new();
        for p in ["a", "b", "c"] {
            db.insert(Partition::Read, model.atom("Nice", &[p]).unwrap(), 1.0)
                .unwrap();
        }
        db.insert(Partition::SpecialRead, model.atom("Nice", &["d"]).unwrap(), 1.0)
            .unwrap();

        let atoms = AtomStore::new();
        let generator = TermGenerator::new(GeneratorConfig::default());
        let grounder = Grounder::new(&model, &db, &atoms, &generator);
        let new = db.special_predicates();
        let mut count = 0;
        let report = grounder
            .ground_new(RuleId::new(0), &new, &mut |_, _| {
                count += 1;
                Ok(())
            })
            .unwrap();
        // 4·3 ordered pairs minus the 3·2 pairs among old people.
        assert_eq!(report.terms, 6);
        assert_eq!(count, 6);
    }
}
