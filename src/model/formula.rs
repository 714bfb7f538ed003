//! Atom templates and the formula trees rules are written in.

use serde::{Deserialize, Serialize};

use crate::model::atom::Constant;
use crate::model::predicate::PredicateId;

/// One argument position of an atom template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arg {
    /// A variable bound by the grounding query.
    Var(String),
    /// A summation variable (`+X`) ranging over every matching atom.
    Sum(String),
    /// A constant.
    Const(Constant),
}

impl Arg {
    pub fn var(name: impl Into<String>) -> Self {
        Arg::Var(name.into())
    }

    pub fn sum(name: impl Into<String>) -> Self {
        Arg::Sum(name.into())
    }

    pub fn constant(value: impl Into<Constant>) -> Self {
        Arg::Const(value.into())
    }

    /// Name of the (non-summation) variable, if this is one.
    pub fn variable(&self) -> Option<&str> {
        match self {
            Arg::Var(name) => Some(name),
            _ => None,
        }
    }
}

impl std::fmt::Display for Arg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arg::Var(name) => f.write_str(name),
            Arg::Sum(name) => write!(f, "+{name}"),
            Arg::Const(c) => write!(f, "'{c}'"),
        }
    }
}

/// An atom template: a predicate applied to arguments that may be variables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryAtom {
    pub predicate: PredicateId,
    pub args: Vec<Arg>,
}

impl QueryAtom {
    pub fn new(predicate: PredicateId, args: Vec<Arg>) -> Self {
        Self { predicate, args }
    }

    /// Variables (not summation variables) in argument order, with duplicates.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.args.iter().filter_map(Arg::variable)
    }

    /// The summation variable of this atom, if any.
    pub fn summation_variable(&self) -> Option<&str> {
        self.args.iter().find_map(|arg| match arg {
            Arg::Sum(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

impl std::fmt::Display for QueryAtom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(", self.predicate)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        f.write_str(")")
    }
}

/// A possibly negated atom template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Literal {
    pub atom: QueryAtom,
    pub negated: bool,
}

impl Literal {
    pub fn positive(atom: QueryAtom) -> Self {
        Self {
            atom,
            negated: false,
        }
    }

    pub fn negative(atom: QueryAtom) -> Self {
        Self {
            atom,
            negated: true,
        }
    }
}

/// An (in)equality filter between two arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Filter {
    Equal(Arg, Arg),
    NotEqual(Arg, Arg),
}

impl Filter {
    pub fn args(&self) -> (&Arg, &Arg) {
        match self {
            Filter::Equal(a, b) | Filter::NotEqual(a, b) => (a, b),
        }
    }
}

/// A formula tree over atom templates and (in)equality predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Formula {
    Atom(QueryAtom),
    Not(Box<Formula>),
    And(Vec<Formula>),
    Or(Vec<Formula>),
    Equal(Arg, Arg),
    NotEqual(Arg, Arg),
}

/// Result of flattening a formula into a flat list of literals and filters.
#[derive(Debug, Default)]
pub(crate) struct Flattened {
    pub literals: Vec<Literal>,
    pub filters: Vec<Filter>,
}

impl Formula {
    pub fn atom(predicate: PredicateId, args: Vec<Arg>) -> Self {
        Formula::Atom(QueryAtom::new(predicate, args))
    }

    pub fn not(inner: Formula) -> Self {
        Formula::Not(Box::new(inner))
    }

    /// Flatten a conjunction of literals and filters.
    ///
    /// Returns `None` when the tree contains a disjunction or a negated
    /// compound, which a rule body cannot express.
    pub(crate) fn flatten_conjunction(&self) -> Option<Flattened> {
        let mut out = Flattened::default();
        self.collect(&mut out, true).then_some(out)
    }

    /// Flatten a disjunction of literals (rule heads).
    pub(crate) fn flatten_disjunction(&self) -> Option<Vec<Literal>> {
        let mut out = Flattened::default();
        if !self.collect(&mut out, false) || !out.filters.is_empty() {
            return None;
        }
        Some(out.literals)
    }

    fn collect(&self, out: &mut Flattened, conjunctive: bool) -> bool {
        match self {
            Formula::Atom(atom) => {
                out.literals.push(Literal::positive(atom.clone()));
                true
            }
            Formula::Not(inner) => match inner.as_ref() {
                Formula::Atom(atom) => {
                    out.literals.push(Literal::negative(atom.clone()));
                    true
                }
                Formula::Not(double) => double.collect(out, conjunctive),
                _ => false,
            },
            Formula::And(parts) if conjunctive => parts.iter().all(|p| p.collect(out, true)),
            Formula::Or(parts) if !conjunctive => parts.iter().all(|p| p.collect(out, false)),
            Formula::Equal(a, b) if conjunctive => {
                out.filters.push(Filter::Equal(a.clone(), b.clone()));
                true
            }
            Formula::NotEqual(a, b) if conjunctive => {
                out.filters.push(Filter::NotEqual(a.clone(), b.clone()));
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(i: usize) -> PredicateId {
        PredicateId::from_index(i)
    }

    #[test]
    fn flatten_body_with_filter() {
        let body = Formula::And(vec![
            Formula::atom(p(0), vec![Arg::var("A")]),
            Formula::not(Formula::atom(p(1), vec![Arg::var("A"), Arg::var("B")])),
            Formula::NotEqual(Arg::var("A"), Arg::var("B")),
        ]);
        let flat = body.flatten_conjunction().unwrap();
        assert_eq!(flat.literals.len(), 2);
        assert!(flat.literals[1].negated);
        assert_eq!(flat.filters.len(), 1);
    }

    #[test]
    fn disjunction_is_not_a_body() {
        let body = Formula::Or(vec![
            Formula::atom(p(0), vec![Arg::var("A")]),
            Formula::atom(p(1), vec![Arg::var("A")]),
        ]);
        assert!(body.flatten_conjunction().is_none());
        assert_eq!(body.flatten_disjunction().unwrap().len(), 2);
    }

    #[test]
    fn double_negation_collapses() {
        let f = Formula::not(Formula::not(Formula::atom(p(0), vec![Arg::var("A")])));
        let flat = f.flatten_conjunction().unwrap();
        assert!(!flat.literals[0].negated);
    }

    #[test]
    fn summation_variable_is_found() {
        let atom = QueryAtom::new(p(0), vec![Arg::var("A"), Arg::sum("B")]);
        assert_eq!(atom.summation_variable(), Some("B"));
        assert_eq!(atom.variables().collect::<Vec<_>>(), vec!["A"]);
    }
}
