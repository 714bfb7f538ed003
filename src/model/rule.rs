//! Rule templates: weighted or hard, logical or arithmetic.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::model::formula::{Arg, Filter, Formula, Literal, QueryAtom};
use crate::model::predicate::{Predicate, PredicateId};

/// Dense identifier of a rule inside one [`crate::model::Model`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RuleId(u32);

impl RuleId {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rule:{}", self.0)
    }
}

/// Comparison operator of an arithmetic rule or hard constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "=")]
    Eq,
}

impl Comparator {
    /// Whether `lhs OP rhs` holds within `tolerance`.
    pub fn holds(self, lhs: f32, rhs: f32, tolerance: f32) -> bool {
        match self {
            Comparator::Lte => lhs <= rhs + tolerance,
            Comparator::Gte => lhs + tolerance >= rhs,
            Comparator::Eq => (lhs - rhs).abs() <= tolerance,
        }
    }
}

impl std::fmt::Display for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Comparator::Lte => f.write_str("<="),
            Comparator::Gte => f.write_str(">="),
            Comparator::Eq => f.write_str("="),
        }
    }
}

/// Coefficient expression of an arithmetic rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Coefficient {
    Constant(f32),
    /// `|X|`: the number of groundings of summation variable `X`.
    Cardinality(String),
    Add(Box<Coefficient>, Box<Coefficient>),
    Sub(Box<Coefficient>, Box<Coefficient>),
    Mul(Box<Coefficient>, Box<Coefficient>),
    Div(Box<Coefficient>, Box<Coefficient>),
}

impl Coefficient {
    /// Evaluate against the cardinalities of the current grounding.
    ///
    /// Division by zero yields a non-finite value; the grounder skips ground
    /// rules that end up with one.
    pub fn evaluate(&self, cardinalities: &HashMap<String, usize>) -> f32 {
        match self {
            Coefficient::Constant(v) => *v,
            Coefficient::Cardinality(var) => cardinalities.get(var).copied().unwrap_or(0) as f32,
            Coefficient::Add(a, b) => a.evaluate(cardinalities) + b.evaluate(cardinalities),
            Coefficient::Sub(a, b) => a.evaluate(cardinalities) - b.evaluate(cardinalities),
            Coefficient::Mul(a, b) => a.evaluate(cardinalities) * b.evaluate(cardinalities),
            Coefficient::Div(a, b) => a.evaluate(cardinalities) / b.evaluate(cardinalities),
        }
    }

    fn cardinality_variables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Coefficient::Constant(_) => {}
            Coefficient::Cardinality(var) => out.push(var),
            Coefficient::Add(a, b)
            | Coefficient::Sub(a, b)
            | Coefficient::Mul(a, b)
            | Coefficient::Div(a, b) => {
                a.cardinality_variables(out);
                b.cardinality_variables(out);
            }
        }
    }
}

impl From<f32> for Coefficient {
    fn from(value: f32) -> Self {
        Coefficient::Constant(value)
    }
}

/// `coefficient * atom` on the left-hand side of an arithmetic rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summand {
    pub coefficient: Coefficient,
    pub atom: QueryAtom,
}

/// `w: body -> head ^2`, or a hard constraint when `weight` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalRule {
    pub weight: Option<f32>,
    pub squared: bool,
    pub body: Vec<Literal>,
    pub filters: Vec<Filter>,
    pub head: Vec<Literal>,
}

impl LogicalRule {
    /// Build a logical rule from a conjunctive body and a disjunctive head.
    pub fn new(
        weight: Option<f32>,
        squared: bool,
        body: &Formula,
        head: &Formula,
    ) -> Result<Self, ModelError> {
        let flat = body.flatten_conjunction().ok_or_else(|| ModelError::InvalidRule {
            message: "rule body must be a conjunction of literals and (in)equalities".into(),
        })?;
        let head = head.flatten_disjunction().ok_or_else(|| ModelError::InvalidRule {
            message: "rule head must be a disjunction of literals".into(),
        })?;
        Ok(Self {
            weight,
            squared,
            body: flat.literals,
            filters: flat.filters,
            head,
        })
    }
}

/// `w: sum(c_i * atom_i) OP rhs ^2`, or a hard constraint when `weight` is `None`.
///
/// Each summation variable ranges over one set of constants per grounding,
/// shared by every atom it appears in. The set comes from the variable's
/// select (`{B: Knows(A, B)}`) when one is given, and otherwise from the joint
/// matches of the atoms that mention it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArithmeticRule {
    pub weight: Option<f32>,
    pub squared: bool,
    pub lhs: Vec<Summand>,
    pub comparator: Comparator,
    pub rhs: Coefficient,
    pub filters: Vec<Filter>,
    /// Select statements keyed by summation variable. The variable appears
    /// as a plain variable inside its select.
    #[serde(default, rename = "select")]
    pub selects: BTreeMap<String, Vec<Literal>>,
}

impl ArithmeticRule {
    /// Distinct summation variables in order of first appearance.
    pub fn summation_variables(&self) -> Vec<&str> {
        let mut vars: Vec<&str> = Vec::new();
        for summand in &self.lhs {
            if let Some(var) = summand.atom.summation_variable()
                && !vars.contains(&var)
            {
                vars.push(var);
            }
        }
        vars
    }

    /// Summation atoms ranging over `var`.
    pub fn summation_atoms<'a>(&'a self, var: &'a str) -> impl Iterator<Item = &'a QueryAtom> {
        self.lhs
            .iter()
            .map(|s| &s.atom)
            .filter(move |a| a.summation_variable() == Some(var))
    }
}

/// A rule template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Rule {
    Logical(LogicalRule),
    Arithmetic(ArithmeticRule),
}

impl Rule {
    pub fn weight(&self) -> Option<f32> {
        match self {
            Rule::Logical(r) => r.weight,
            Rule::Arithmetic(r) => r.weight,
        }
    }

    pub fn is_weighted(&self) -> bool {
        self.weight().is_some()
    }

    pub fn squared(&self) -> bool {
        match self {
            Rule::Logical(r) => r.squared,
            Rule::Arithmetic(r) => r.squared,
        }
    }

    /// The atoms whose joint matches drive grounding.
    ///
    /// For logical rules these are the positive body literals. For arithmetic
    /// rules, every left-hand atom; summation positions match anything and
    /// are projected away.
    pub fn query_atoms(&self) -> Vec<&QueryAtom> {
        match self {
            Rule::Logical(r) => r
                .body
                .iter()
                .filter(|l| !l.negated)
                .map(|l| &l.atom)
                .collect(),
            Rule::Arithmetic(r) => r.lhs.iter().map(|s| &s.atom).collect(),
        }
    }

    /// Atom templates outside the grounding query: heads, negated body
    /// literals, summation atoms and select atoms.
    pub fn non_query_atoms(&self) -> Vec<&QueryAtom> {
        match self {
            Rule::Logical(r) => r
                .body
                .iter()
                .filter(|l| l.negated)
                .chain(&r.head)
                .map(|l| &l.atom)
                .collect(),
            Rule::Arithmetic(r) => r
                .lhs
                .iter()
                .map(|s| &s.atom)
                .filter(|a| a.summation_variable().is_some())
                .chain(r.selects.values().flatten().map(|l| &l.atom))
                .collect(),
        }
    }

    pub fn filters(&self) -> &[Filter] {
        match self {
            Rule::Logical(r) => &r.filters,
            Rule::Arithmetic(r) => &r.filters,
        }
    }

    /// Every atom template the rule mentions.
    pub fn atoms(&self) -> Vec<&QueryAtom> {
        match self {
            Rule::Logical(r) => r.body.iter().chain(&r.head).map(|l| &l.atom).collect(),
            Rule::Arithmetic(r) => r
                .lhs
                .iter()
                .map(|s| &s.atom)
                .chain(r.selects.values().flatten().map(|l| &l.atom))
                .collect(),
        }
    }

    /// Predicates appearing anywhere in the rule.
    pub fn predicates(&self) -> BTreeSet<PredicateId> {
        self.atoms().into_iter().map(|a| a.predicate).collect()
    }

    /// Predicates appearing in the grounding query.
    pub fn query_predicates(&self) -> BTreeSet<PredicateId> {
        self.query_atoms().into_iter().map(|a| a.predicate).collect()
    }

    /// Check arity and variable safety against the declared predicates.
    pub(crate) fn validate(&self, predicates: &[Predicate]) -> Result<(), ModelError> {
        for atom in self.atoms() {
            let predicate = predicates
                .get(atom.predicate.index())
                .ok_or_else(|| ModelError::UnknownPredicate {
                    name: atom.predicate.to_string(),
                })?;
            if predicate.arity != atom.args.len() {
                return Err(ModelError::ArityMismatch {
                    predicate: predicate.name.clone(),
                    expected: predicate.arity,
                    actual: atom.args.len(),
                });
            }
        }

        let bound: HashSet<&str> = self
            .query_atoms()
            .into_iter()
            .flat_map(|a| a.variables())
            .collect();

        let mut needed: Vec<&str> = Vec::new();
        for filter in self.filters() {
            let (a, b) = filter.args();
            needed.extend(a.variable());
            needed.extend(b.variable());
        }

        match self {
            Rule::Logical(r) => {
                if r.body.iter().all(|l| l.negated) {
                    return Err(ModelError::InvalidRule {
                        message: "logical rule needs at least one positive body atom".into(),
                    });
                }
                if r.head.is_empty() && r.body.len() < 2 {
                    return Err(ModelError::InvalidRule {
                        message: "logical rule without a head needs a body of at least two literals"
                            .into(),
                    });
                }
                for literal in r.body.iter().chain(&r.head) {
                    if literal.atom.summation_variable().is_some() {
                        return Err(ModelError::InvalidRule {
                            message: "summation variables are only allowed in arithmetic rules"
                                .into(),
                        });
                    }
                    needed.extend(literal.atom.variables());
                }
            }
            Rule::Arithmetic(r) => {
                if r.lhs.is_empty() {
                    return Err(ModelError::InvalidRule {
                        message: "arithmetic rule has an empty left-hand side".into(),
                    });
                }
                let mut summation_vars: HashSet<&str> = HashSet::new();
                for summand in &r.lhs {
                    let sums = summand
                        .atom
                        .args
                        .iter()
                        .filter(|a| matches!(a, Arg::Sum(_)))
                        .count();
                    if sums > 1 {
                        return Err(ModelError::InvalidRule {
                            message: format!(
                                "atom {} has more than one summation variable",
                                summand.atom
                            ),
                        });
                    }
                    if let Some(var) = summand.atom.summation_variable() {
                        if bound.contains(var) {
                            return Err(ModelError::InvalidRule {
                                message: format!(
                                    "+{var} is also used as an ordinary variable"
                                ),
                            });
                        }
                        summation_vars.insert(var);
                    }
                    needed.extend(summand.atom.variables());
                }
                for (var, select) in &r.selects {
                    validate_select(var, select, &summation_vars, &bound, predicates)?;
                }
                let mut cardinalities = Vec::new();
                for summand in &r.lhs {
                    summand.coefficient.cardinality_variables(&mut cardinalities);
                }
                r.rhs.cardinality_variables(&mut cardinalities);
                if let Some(var) = cardinalities
                    .iter()
                    .find(|v| !summation_vars.contains(**v))
                {
                    return Err(ModelError::InvalidRule {
                        message: format!("|{var}| does not name a summation variable"),
                    });
                }
            }
        }

        if let Some(var) = needed.iter().find(|v| !bound.contains(**v)) {
            return Err(ModelError::InvalidRule {
                message: format!("variable {var} is not bound by a positive query atom"),
            });
        }
        Ok(())
    }
}

/// A select must range over closed predicates, mention its own variable in
/// a positive literal and use no variables besides it and the rule's query
/// variables.
fn validate_select(
    var: &str,
    select: &[Literal],
    summation_vars: &HashSet<&str>,
    bound: &HashSet<&str>,
    predicates: &[Predicate],
) -> Result<(), ModelError> {
    let invalid = |message: String| ModelError::InvalidRule { message };
    if !summation_vars.contains(var) {
        return Err(invalid(format!("select for +{var}, which is not a summation variable")));
    }
    if !select
        .iter()
        .any(|l| !l.negated && l.atom.variables().any(|v| v == var))
    {
        return Err(invalid(format!(
            "select for +{var} needs a positive literal mentioning {var}"
        )));
    }
    for literal in select {
        if let Some(predicate) = predicates.get(literal.atom.predicate.index())
            && !predicate.closed
        {
            return Err(invalid(format!(
                "open predicate {} used in the select for +{var}",
                predicate.name
            )));
        }
        if literal.atom.summation_variable().is_some() {
            return Err(invalid(format!(
                "select for +{var} contains a summation variable"
            )));
        }
        if let Some(other) = literal
            .atom
            .variables()
            .find(|v| *v != var && !bound.contains(v))
        {
            return Err(invalid(format!(
                "variable {other} in the select for +{var} is not bound"
            )));
        }
    }
    Ok(())
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(w) = self.weight() {
            write!(f, "{w}: ")?;
        }
        match self {
            Rule::Logical(r) => {
                let body: Vec<String> = r
                    .body
                    .iter()
                    .map(|l| format!("{}{}", if l.negated { "!" } else { "" }, l.atom))
                    .collect();
                let head: Vec<String> = r
                    .head
                    .iter()
                    .map(|l| format!("{}{}", if l.negated { "!" } else { "" }, l.atom))
                    .collect();
                write!(f, "{} -> {}", body.join(" & "), head.join(" | "))?;
            }
            Rule::Arithmetic(r) => {
                let lhs: Vec<String> = r
                    .lhs
                    .iter()
                    .map(|s| format!("{:?} * {}", s.coefficient, s.atom))
                    .collect();
                write!(f, "{} {} {:?}", lhs.join(" + "), r.comparator, r.rhs)?;
                for (var, select) in &r.selects {
                    let atoms: Vec<String> = select
                        .iter()
                        .map(|l| format!("{}{}", if l.negated { "!" } else { "" }, l.atom))
                        .collect();
                    write!(f, " {{{var}: {}}}", atoms.join(" & "))?;
                }
            }
        }
        if self.squared() {
            f.write_str(" ^2")?;
        } else if !self.is_weighted() {
            f.write_str(" .")?;
        }
        Ok(())
    }
}
