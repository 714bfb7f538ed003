//! Rule instantiation against the fact database.
//!
//! For each active rule the grounder runs the rule's conjunctive query,
//! substitutes every result row into the rule's atom templates, resolves the
//! atoms through the [`AtomManager`] and hands the resulting [`GroundRule`]s to
//! the [`TermGenerator`]. Rules sharing an identical query execute it once.
//! Rows are instantiated in parallel; terms reach the sink in a deterministic
//! order, grouped by rule.

pub mod atom_manager;
pub mod partial;

use std::collections::{BTreeMap, HashMap};

use rayon::prelude::*;

use crate::database::{AtomStore, Query, QueryEngine, QueryResult};
use crate::error::{GroundingError, HlmrfResult};
use crate::model::{
    Arg, ArithmeticRule, Comparator, Constant, GroundAtom, Literal, Model, QueryAtom, Rule, RuleId,
};
use crate::term::{Term, TermGenerator};

pub use atom_manager::AtomManager;
pub use partial::PartialPlan;

/// A literal resolved to an atom index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroundLiteral {
    pub atom: u32,
    pub negated: bool,
}

/// One rule instantiated under one substitution.
#[derive(Debug, Clone, PartialEq)]
pub enum GroundRule {
    Logical {
        rule: RuleId,
        weight: Option<f32>,
        squared: bool,
        body: Vec<GroundLiteral>,
        head: Vec<GroundLiteral>,
    },
    Arithmetic {
        rule: RuleId,
        weight: Option<f32>,
        squared: bool,
        /// `(coefficient, atom)` pairs, summations already expanded.
        summands: Vec<(f32, u32)>,
        comparator: Comparator,
        constant: f32,
    },
}

impl GroundRule {
    pub fn rule(&self) -> RuleId {
        match self {
            GroundRule::Logical { rule, .. } | GroundRule::Arithmetic { rule, .. } => *rule,
        }
    }

    pub fn weight(&self) -> Option<f32> {
        match self {
            GroundRule::Logical { weight, .. } | GroundRule::Arithmetic { weight, .. } => *weight,
        }
    }

    /// Render with atom identities, for diagnostics.
    pub fn describe(&self, atoms: &AtomStore) -> String {
        let name = |i: u32| atoms.get_atom(i).atom.to_string();
        let literal = |l: &GroundLiteral| {
            format!("{}{}", if l.negated { "!" } else { "" }, name(l.atom))
        };
        match self {
            GroundRule::Logical {
                rule, body, head, ..
            } => {
                let body: Vec<String> = body.iter().map(literal).collect();
                let head: Vec<String> = head.iter().map(literal).collect();
                format!("{rule}: {} -> {}", body.join(" & "), head.join(" | "))
            }
            GroundRule::Arithmetic {
                rule,
                summands,
                comparator,
                constant,
                ..
            } => {
                let lhs: Vec<String> = summands
                    .iter()
                    .map(|(c, a)| format!("{c} * {}", name(*a)))
                    .collect();
                format!("{rule}: {} {comparator} {constant}", lhs.join(" + "))
            }
        }
    }
}

/// Term counts from one grounding pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroundingReport {
    /// Ground rules instantiated, before generation.
    pub ground_rules: usize,
    /// Terms handed to the sink.
    pub terms: usize,
    pub per_rule: BTreeMap<RuleId, usize>,
}

impl GroundingReport {
    pub fn dropped(&self) -> usize {
        self.ground_rules - self.terms
    }

    pub(crate) fn merge(&mut self, other: GroundingReport) {
        self.ground_rules += other.ground_rules;
        self.terms += other.terms;
        for (rule, n) in other.per_rule {
            *self.per_rule.entry(rule).or_default() += n;
        }
    }
}

/// Receives generated terms, in rule order.
pub type TermSink<'s> = dyn FnMut(RuleId, Term) -> HlmrfResult<()> + 's;

/// Grounds rules of one model against one query engine into one atom store.
pub struct Grounder<'a> {
    model: &'a Model,
    manager: AtomManager<'a>,
    generator: &'a TermGenerator,
}

impl<'a> Grounder<'a> {
    pub fn new(
        model: &'a Model,
        engine: &'a dyn QueryEngine,
        atoms: &'a AtomStore,
        generator: &'a TermGenerator,
    ) -> Self {
        Self {
            model,
            manager: AtomManager::new(model, engine, atoms),
            generator,
        }
    }

    pub fn manager(&self) -> &AtomManager<'a> {
        &self.manager
    }

    /// Ground every active rule.
    pub fn ground_all(&self, sink: &mut TermSink<'_>) -> HlmrfResult<GroundingReport> {
        let rules: Vec<RuleId> = self.model.rules().map(|(id, _)| id).collect();
        self.ground_rules(&rules, sink)
    }

    /// Ground the given rules, executing each distinct query once.
    pub fn ground_rules(
        &self,
        rules: &[RuleId],
        sink: &mut TermSink<'_>,
    ) -> HlmrfResult<GroundingReport> {
        let mut groups: Vec<(Query, Vec<RuleId>)> = Vec::new();
        let mut by_query: HashMap<Query, usize> = HashMap::new();
        for &id in rules {
            let query = Query::for_rule(self.model.rule(id)?);
            match by_query.get(&query) {
                Some(&g) => groups[g].1.push(id),
                None => {
                    by_query.insert(query.clone(), groups.len());
                    groups.push((query, vec![id]));
                }
            }
        }

        let mut report = GroundingReport::default();
        for (query, ids) in &groups {
            let result = self.manager.engine().execute_query(query)?;
            if ids.len() > 1 {
                tracing::debug!(rules = ids.len(), rows = result.len(), "shared grounding query");
            }
            for &id in ids {
                report.merge(self.ground_result(id, &result, sink)?);
            }
        }
        tracing::info!(
            rules = rules.len(),
            ground_rules = report.ground_rules,
            terms = report.terms,
            "grounding complete"
        );
        Ok(report)
    }

    /// Instantiate one rule for every row of an already executed query.
    pub fn ground_result(
        &self,
        id: RuleId,
        result: &QueryResult,
        sink: &mut TermSink<'_>,
    ) -> HlmrfResult<GroundingReport> {
        let rule = self.model.rule(id)?;
        let generated: Vec<HlmrfResult<(usize, Vec<Term>)>> = result
            .rows
            .par_iter()
            .map(|row| {
                let ground = self.instantiate(id, rule, result, row)?;
                let mut terms = Vec::with_capacity(ground.len());
                for g in &ground {
                    if let Some(term) = self.generator.generate(self.manager.atoms(), g)? {
                        terms.push(term);
                    }
                }
                Ok((ground.len(), terms))
            })
            .collect();

        let mut report = GroundingReport::default();
        let mut emitted = 0;
        for item in generated {
            let (ground, terms) = item?;
            report.ground_rules += ground;
            for term in terms {
                sink(id, term)?;
                emitted += 1;
            }
        }
        report.terms = emitted;
        report.per_rule.insert(id, emitted);
        if result.is_empty() {
            tracing::debug!(rule = %id, "rule has no groundings");
        } else {
            tracing::debug!(rule = %id, rows = result.len(), terms = emitted, "grounded rule");
        }
        Ok(report)
    }

    /// Substitute one query row into a rule.
    ///
    /// Weighted arithmetic equalities become two ground rules (`<=` and `>=`).
    pub fn instantiate(
        &self,
        id: RuleId,
        rule: &Rule,
        result: &QueryResult,
        row: &[Constant],
    ) -> HlmrfResult<Vec<GroundRule>> {
        match rule {
            Rule::Logical(r) => {
                let resolve = |l: &Literal| -> HlmrfResult<GroundLiteral> {
                    let atom = substitute(&l.atom, result, row)?;
                    Ok(GroundLiteral {
                        atom: self.manager.resolve(&atom),
                        negated: l.negated,
                    })
                };
                Ok(vec![GroundRule::Logical {
                    rule: id,
                    weight: r.weight,
                    squared: r.squared,
                    body: r.body.iter().map(resolve).collect::<HlmrfResult<_>>()?,
                    head: r.head.iter().map(resolve).collect::<HlmrfResult<_>>()?,
                }])
            }
            Rule::Arithmetic(r) => {
                let engine = self.manager.engine();
                let mut ranges: HashMap<String, Vec<Constant>> = HashMap::new();
                for var in r.summation_variables() {
                    ranges.insert(var.to_string(), summation_range(r, var, result, row, engine)?);
                }
                let cardinalities: HashMap<String, usize> = ranges
                    .iter()
                    .map(|(var, constants)| (var.clone(), constants.len()))
                    .collect();

                let mut expanded = Vec::new();
                for summand in &r.lhs {
                    let coefficient = summand.coefficient.evaluate(&cardinalities);
                    for atom in expand(&summand.atom, result, row, &ranges)? {
                        expanded.push((coefficient, atom));
                    }
                }
                let constant = r.rhs.evaluate(&cardinalities);
                if !constant.is_finite() || expanded.iter().any(|(c, _)| !c.is_finite()) {
                    tracing::debug!(
                        rule = %id,
                        ?cardinalities,
                        "skipping grounding with a non-finite coefficient"
                    );
                    return Ok(Vec::new());
                }
                let summands: Vec<(f32, u32)> = expanded
                    .iter()
                    .map(|(c, atom)| (*c, self.manager.resolve(atom)))
                    .collect();

                let ground = |comparator| GroundRule::Arithmetic {
                    rule: id,
                    weight: r.weight,
                    squared: r.squared,
                    summands: summands.clone(),
                    comparator,
                    constant,
                };
                if r.weight.is_some() && r.comparator == Comparator::Eq {
                    Ok(vec![ground(Comparator::Lte), ground(Comparator::Gte)])
                } else {
                    Ok(vec![ground(r.comparator)])
                }
            }
        }
    }
}

/// Replace the variables of a template with the row's constants.
fn substitute(atom: &QueryAtom, result: &QueryResult, row: &[Constant]) -> HlmrfResult<GroundAtom> {
    let args = atom
        .args
        .iter()
        .map(|arg| substitute_arg(arg, result, row))
        .collect::<HlmrfResult<Vec<_>>>()?;
    Ok(GroundAtom::new(atom.predicate, args))
}

fn substitute_arg(arg: &Arg, result: &QueryResult, row: &[Constant]) -> HlmrfResult<Constant> {
    match arg {
        Arg::Const(c) => Ok(c.clone()),
        Arg::Var(name) | Arg::Sum(name) => result
            .variables
            .get(name)
            .map(|i| row[i].clone())
            .ok_or_else(|| {
                GroundingError::UnboundVariable {
                    variable: name.clone(),
                }
                .into()
            }),
    }
}

/// Every ground atom a template stands for: one atom, or one per constant in
/// the range of its summation variable.
fn expand(
    atom: &QueryAtom,
    result: &QueryResult,
    row: &[Constant],
    ranges: &HashMap<String, Vec<Constant>>,
) -> HlmrfResult<Vec<GroundAtom>> {
    let Some(var) = atom.summation_variable() else {
        return Ok(vec![substitute(atom, result, row)?]);
    };
    let constants = ranges.get(var).map(Vec::as_slice).unwrap_or_default();
    constants
        .iter()
        .map(|constant| {
            let args = atom
                .args
                .iter()
                .map(|arg| match arg {
                    Arg::Sum(_) => Ok(constant.clone()),
                    other => substitute_arg(other, result, row),
                })
                .collect::<HlmrfResult<Vec<_>>>()?;
            Ok(GroundAtom::new(atom.predicate, args))
        })
        .collect()
}

/// The constants summation variable `var` ranges over under one row.
///
/// The row's variables are fixed and the variable's select (or the atoms
/// that sum over it) is run as a query. A constant is dropped when a negated
/// select literal holds for it in the database.
fn summation_range(
    rule: &ArithmeticRule,
    var: &str,
    result: &QueryResult,
    row: &[Constant],
    engine: &dyn QueryEngine,
) -> HlmrfResult<Vec<Constant>> {
    let literals: Vec<Literal> = match rule.selects.get(var) {
        Some(select) => select.clone(),
        None => rule
            .summation_atoms(var)
            .map(|atom| Literal::positive(atom.clone()))
            .collect(),
    };
    let bind = |atom: &QueryAtom| {
        let args = atom
            .args
            .iter()
            .map(|arg| match arg {
                Arg::Const(c) => Arg::Const(c.clone()),
                Arg::Var(name) | Arg::Sum(name) => match result.variables.get(name) {
                    Some(i) => Arg::Const(row[i].clone()),
                    None => Arg::Var(name.clone()),
                },
            })
            .collect();
        QueryAtom::new(atom.predicate, args)
    };

    let (negative, positive): (Vec<&Literal>, Vec<&Literal>) =
        literals.iter().partition(|l| l.negated);
    let query = Query::new(positive.iter().map(|l| bind(&l.atom)).collect(), Vec::new());
    let found = engine.execute_query(&query)?;
    let Some(column) = found.variables.get(var) else {
        return Ok(Vec::new());
    };
    let negative: Vec<QueryAtom> = negative.iter().map(|l| bind(&l.atom)).collect();

    let mut constants = Vec::with_capacity(found.len());
    'rows: for sub in &found.rows {
        for atom in &negative {
            let atom = substitute(atom, &found, sub)?;
            if engine.lookup(&atom).is_some_and(|fact| fact.value > 0.0) {
                continue 'rows;
            }
        }
        constants.push(sub[column].clone());
    }
    constants.sort();
    constants.dedup();
    Ok(constants)
}
