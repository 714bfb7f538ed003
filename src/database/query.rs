//! Conjunctive queries over the fact database.
//!
//! A [`Query`] is the positive part of a rule body: atom templates joined on
//! shared variables, pruned by (in)equality filters. Each pattern carries a
//! [`Scope`] restricting which partitions it may match, which is how partial
//! grounding asks for "substitutions that use at least one new atom".

use std::collections::{BTreeSet, HashMap};

use crate::database::{Database, Fact, FactTable};
use crate::error::{GroundingError, HlmrfResult};
use crate::model::{Arg, Constant, Filter, GroundAtom, PredicateId, QueryAtom, Rule};

/// Which partitions a query pattern may match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Every partition.
    Any,
    /// READ and WRITE only.
    Old,
    /// SPECIAL_READ and SPECIAL_WRITE only.
    New,
}

impl Scope {
    fn admits(self, fact: &Fact) -> bool {
        match self {
            Scope::Any => true,
            Scope::Old => !fact.partition.is_special(),
            Scope::New => fact.partition.is_special(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryPattern {
    pub atom: QueryAtom,
    pub scope: Scope,
}

/// A conjunctive query with filters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    pub patterns: Vec<QueryPattern>,
    pub filters: Vec<Filter>,
}

impl Query {
    pub fn new(atoms: Vec<QueryAtom>, filters: Vec<Filter>) -> Self {
        Self {
            patterns: atoms
                .into_iter()
                .map(|atom| QueryPattern {
                    atom,
                    scope: Scope::Any,
                })
                .collect(),
            filters,
        }
    }

    /// The grounding query of a rule.
    pub fn for_rule(rule: &Rule) -> Self {
        Self::new(
            rule.query_atoms().into_iter().cloned().collect(),
            rule.filters().to_vec(),
        )
    }

    pub fn predicates(&self) -> BTreeSet<PredicateId> {
        self.patterns.iter().map(|p| p.atom.predicate).collect()
    }

    /// Variables in order of first appearance.
    pub fn variables(&self) -> VariableMap {
        let mut map = VariableMap::default();
        for pattern in &self.patterns {
            for var in pattern.atom.variables() {
                map.insert(var);
            }
        }
        map
    }

    /// Queries whose results are exactly the substitutions of `self` that use
    /// at least one atom from the special partitions, each exactly once.
    ///
    /// The `i`-th query takes its first new atom at pattern `i`: patterns before
    /// it are restricted to old atoms and patterns after it are unrestricted.
    /// Positions whose predicate has no new atoms are skipped.
    pub fn partial_queries(&self, new_predicates: &BTreeSet<PredicateId>) -> Vec<Query> {
        (0..self.patterns.len())
            .filter(|&i| new_predicates.contains(&self.patterns[i].atom.predicate))
            .map(|i| {
                let mut q = self.clone();
                for (j, pattern) in q.patterns.iter_mut().enumerate() {
                    pattern.scope = match j.cmp(&i) {
                        std::cmp::Ordering::Less => Scope::Old,
                        std::cmp::Ordering::Equal => Scope::New,
                        std::cmp::Ordering::Greater => Scope::Any,
                    };
                }
                q
            })
            .collect()
    }
}

/// Variable name to column index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableMap {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl VariableMap {
    fn insert(&mut self, name: &str) -> usize {
        if let Some(&i) = self.index.get(name) {
            return i;
        }
        let i = self.names.len();
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), i);
        i
    }

    pub fn get(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// One row of query results: a constant per variable, indexed by [`VariableMap`].
pub type Substitution = Vec<Constant>;

/// Query results, sorted so grounding order is deterministic.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub variables: VariableMap,
    pub rows: Vec<Substitution>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// The boundary grounding queries through.
pub trait QueryEngine: Send + Sync {
    /// Run a conjunctive query.
    fn execute_query(&self, query: &Query) -> HlmrfResult<QueryResult>;

    /// The stored fact for an atom, if any.
    fn lookup(&self, atom: &GroundAtom) -> Option<Fact>;
}

impl QueryEngine for Database {
    fn execute_query(&self, query: &Query) -> HlmrfResult<QueryResult> {
        let variables = query.variables();
        for filter in &query.filters {
            let (a, b) = filter.args();
            for arg in [a, b] {
                if let Some(var) = arg.variable()
                    && variables.get(var).is_none()
                {
                    return Err(GroundingError::UnboundVariable {
                        variable: var.to_string(),
                    }
                    .into());
                }
            }
        }

        let facts = self.read();
        let mut join = Join {
            facts: &facts,
            query,
            variables: &variables,
            binding: vec![None; variables.len()],
            rows: Vec::new(),
        };
        join.run(0);
        let mut rows = join.rows;
        drop(facts);

        rows.sort();
        rows.dedup();
        Ok(QueryResult { variables, rows })
    }

    fn lookup(&self, atom: &GroundAtom) -> Option<Fact> {
        self.get(atom)
    }
}

/// Backtracking nested-loop join over one fact-table snapshot.
struct Join<'a> {
    facts: &'a FactTable,
    query: &'a Query,
    variables: &'a VariableMap,
    binding: Vec<Option<Constant>>,
    rows: Vec<Substitution>,
}

impl Join<'_> {
    fn run(&mut self, depth: usize) {
        if depth == self.query.patterns.len() {
            if let Some(row) = self.binding.iter().cloned().collect::<Option<Vec<_>>>() {
                self.rows.push(row);
            }
            return;
        }
        let (query, facts, variables) = (self.query, self.facts, self.variables);
        let pattern = &query.patterns[depth];
        let Some(candidates) = facts.by_predicate.get(&pattern.atom.predicate) else {
            return;
        };

        let mut newly_bound = Vec::new();
        for (args, fact) in candidates {
            if !pattern.scope.admits(fact) || args.len() != pattern.atom.args.len() {
                continue;
            }
            newly_bound.clear();
            let mut matched = true;
            for (arg, constant) in pattern.atom.args.iter().zip(args) {
                match arg {
                    Arg::Const(k) => {
                        if k != constant {
                            matched = false;
                        }
                    }
                    Arg::Var(name) => {
                        let Some(slot) = variables.get(name) else {
                            continue;
                        };
                        match &self.binding[slot] {
                            Some(bound) if bound != constant => matched = false,
                            Some(_) => {}
                            None => {
                                self.binding[slot] = Some(constant.clone());
                                newly_bound.push(slot);
                            }
                        }
                    }
                    Arg::Sum(_) => {}
                }
                if !matched {
                    break;
                }
            }
            if matched && self.filters_hold() {
                self.run(depth + 1);
            }
            for &slot in &newly_bound {
                self.binding[slot] = None;
            }
        }
    }

    /// Filters whose arguments are all bound must hold.
    fn filters_hold(&self) -> bool {
        self.query.filters.iter().all(|filter| {
            let (a, b) = filter.args();
            match (self.resolve(a), self.resolve(b)) {
                (Some(x), Some(y)) => match filter {
                    Filter::Equal(..) => x == y,
                    Filter::NotEqual(..) => x != y,
                },
                _ => true,
            }
        })
    }

    fn resolve<'b>(&'b self, arg: &'b Arg) -> Option<&'b Constant> {
        match arg {
            Arg::Const(c) => Some(c),
            Arg::Var(name) => self
                .variables
                .get(name)
                .and_then(|slot| self.binding[slot].as_ref()),
            Arg::Sum(_) => None,
        }
    }
}
