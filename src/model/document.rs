//! JSON model documents: predicates and structured rules referenced by name.
//!
//! ```json
//! {
//!   "predicates": [
//!     {"name": "Nice", "arity": 1, "closed": true},
//!     {"name": "Friends", "arity": 2}
//!   ],
//!   "rules": [
//!     {"kind": "logical", "weight": 5.0, "squared": true,
//!      "body": [{"predicate": "Nice", "args": ["A"]}, {"predicate": "Nice", "args": ["B"]}],
//!      "filters": [{"left": "A", "op": "!=", "right": "B"}],
//!      "head": [{"predicate": "Friends", "args": ["A", "B"]}]}
//!   ]
//! }
//! ```
//!
//! Arguments are variables (`A`), summation variables (`+B`) or quoted
//! constants (`'alice'`). An arithmetic rule may restrict a summation variable
//! with a select over closed predicates:
//!
//! ```json
//! {"kind": "arithmetic",
//!  "lhs": [{"atom": {"predicate": "Friends", "args": ["A", "+B"]}}],
//!  "comparator": "<=", "rhs": 1.0,
//!  "select": {"B": [{"predicate": "Knows", "args": ["A", "B"]}]}}
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HlmrfResult, ModelError};
use crate::model::{
    Arg, ArithmeticRule, Coefficient, Comparator, Constant, Filter, Literal, LogicalRule, Model,
    QueryAtom, Rule, Summand,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDocument {
    pub predicates: Vec<PredicateDecl>,
    #[serde(default)]
    pub rules: Vec<RuleDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateDecl {
    pub name: String,
    pub arity: usize,
    #[serde(default)]
    pub closed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomDecl {
    pub predicate: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub negated: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterDecl {
    pub left: String,
    pub op: FilterOp,
    pub right: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CoefficientDecl {
    Number(f32),
    Expr(ExprDecl),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExprDecl {
    Cardinality(String),
    Add(Box<CoefficientDecl>, Box<CoefficientDecl>),
    Sub(Box<CoefficientDecl>, Box<CoefficientDecl>),
    Mul(Box<CoefficientDecl>, Box<CoefficientDecl>),
    Div(Box<CoefficientDecl>, Box<CoefficientDecl>),
}

fn default_coefficient() -> CoefficientDecl {
    CoefficientDecl::Number(1.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummandDecl {
    #[serde(default = "default_coefficient")]
    pub coefficient: CoefficientDecl,
    pub atom: AtomDecl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleDecl {
    Logical {
        #[serde(default)]
        weight: Option<f32>,
        #[serde(default)]
        squared: bool,
        body: Vec<AtomDecl>,
        #[serde(default)]
        filters: Vec<FilterDecl>,
        #[serde(default)]
        head: Vec<AtomDecl>,
    },
    Arithmetic {
        #[serde(default)]
        weight: Option<f32>,
        #[serde(default)]
        squared: bool,
        lhs: Vec<SummandDecl>,
        comparator: Comparator,
        rhs: CoefficientDecl,
        #[serde(default)]
        filters: Vec<FilterDecl>,
        #[serde(default)]
        select: BTreeMap<String, Vec<AtomDecl>>,
    },
}

impl ModelDocument {
    pub fn from_json(text: &str) -> HlmrfResult<Self> {
        serde_json::from_str(text).map_err(|e| {
            ModelError::Parse {
                message: e.to_string(),
            }
            .into()
        })
    }

    pub fn load(path: &Path) -> HlmrfResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ModelError::Parse {
            message: format!("{}: {e}", path.display()),
        })?;
        Self::from_json(&text)
    }

    /// Build a validated [`Model`] from the document.
    pub fn build(&self) -> HlmrfResult<Model> {
        let mut model = Model::new();
        for p in &self.predicates {
            model.add_predicate(p.name.clone(), p.arity, p.closed)?;
        }
        for decl in &self.rules {
            let rule = decl.to_rule(&model)?;
            model.add_rule(rule)?;
        }
        Ok(model)
    }
}

impl RuleDecl {
    pub fn to_rule(&self, model: &Model) -> HlmrfResult<Rule> {
        match self {
            RuleDecl::Logical {
                weight,
                squared,
                body,
                filters,
                head,
            } => Ok(Rule::Logical(LogicalRule {
                weight: *weight,
                squared: *squared,
                body: body
                    .iter()
                    .map(|a| literal(model, a))
                    .collect::<HlmrfResult<_>>()?,
                filters: filters.iter().map(filter).collect(),
                head: head
                    .iter()
                    .map(|a| literal(model, a))
                    .collect::<HlmrfResult<_>>()?,
            })),
            RuleDecl::Arithmetic {
                weight,
                squared,
                lhs,
                comparator,
                rhs,
                filters,
                select,
            } => Ok(Rule::Arithmetic(ArithmeticRule {
                weight: *weight,
                squared: *squared,
                lhs: lhs
                    .iter()
                    .map(|s| {
                        Ok(Summand {
                            coefficient: coefficient(&s.coefficient),
                            atom: query_atom(model, &s.atom)?,
                        })
                    })
                    .collect::<HlmrfResult<_>>()?,
                comparator: *comparator,
                rhs: coefficient(rhs),
                filters: filters.iter().map(filter).collect(),
                selects: select
                    .iter()
                    .map(|(var, atoms)| {
                        let literals = atoms
                            .iter()
                            .map(|a| select_literal(model, a))
                            .collect::<HlmrfResult<Vec<_>>>()?;
                        Ok((var.trim_start_matches('+').to_string(), literals))
                    })
                    .collect::<HlmrfResult<_>>()?,
            })),
        }
    }
}

/// Parse one textual argument.
pub fn parse_arg(text: &str) -> Arg {
    let trimmed = text.trim();
    if let Some(name) = trimmed.strip_prefix('+') {
        return Arg::Sum(name.to_string());
    }
    for quote in ['\'', '"'] {
        if trimmed.len() >= 2 && trimmed.starts_with(quote) && trimmed.ends_with(quote) {
            return Arg::Const(Constant::new(&trimmed[1..trimmed.len() - 1]));
        }
    }
    Arg::Var(trimmed.to_string())
}

fn query_atom(model: &Model, decl: &AtomDecl) -> HlmrfResult<QueryAtom> {
    let predicate = model.lookup(&decl.predicate)?;
    Ok(QueryAtom::new(
        predicate,
        decl.args.iter().map(|a| parse_arg(a)).collect(),
    ))
}

fn literal(model: &Model, decl: &AtomDecl) -> HlmrfResult<Literal> {
    Ok(Literal {
        atom: query_atom(model, decl)?,
        negated: decl.negated,
    })
}

/// Select literals name their summation variable as a plain variable; a
/// leading `+` is accepted and dropped.
fn select_literal(model: &Model, decl: &AtomDecl) -> HlmrfResult<Literal> {
    let mut literal = literal(model, decl)?;
    for arg in &mut literal.atom.args {
        if let Arg::Sum(name) = arg {
            *arg = Arg::Var(std::mem::take(name));
        }
    }
    Ok(literal)
}

fn filter(decl: &FilterDecl) -> Filter {
    let (l, r) = (parse_arg(&decl.left), parse_arg(&decl.right));
    match decl.op {
        FilterOp::Equal => Filter::Equal(l, r),
        FilterOp::NotEqual => Filter::NotEqual(l, r),
    }
}

fn coefficient(decl: &CoefficientDecl) -> Coefficient {
    match decl {
        CoefficientDecl::Number(v) => Coefficient::Constant(*v),
        CoefficientDecl::Expr(expr) => match expr {
            ExprDecl::Cardinality(var) => {
                Coefficient::Cardinality(var.trim_start_matches('+').to_string())
            }
            ExprDecl::Add(a, b) => {
                Coefficient::Add(Box::new(coefficient(a)), Box::new(coefficient(b)))
            }
            ExprDecl::Sub(a, b) => {
                Coefficient::Sub(Box::new(coefficient(a)), Box::new(coefficient(b)))
            }
            ExprDecl::Mul(a, b) => {
                Coefficient::Mul(Box::new(coefficient(a)), Box::new(coefficient(b)))
            }
            ExprDecl::Div(a, b) => {
                Coefficient::Div(Box::new(coefficient(a)), Box::new(coefficient(b)))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRIENDS: &str = r#"{
        "predicates": [
            {"name": "Nice", "arity": 1, "closed": true},
            {"name": "Friends", "arity": 2}
        ],
        "rules": [
            {"kind": "logical", "weight": 5.0, "squared": true,
             "body": [{"predicate": "Nice", "args": ["A"]}, {"predicate": "Nice", "args": ["B"]}],
             "filters": [{"left": "A", "op": "!=", "right": "B"}],
             "head": [{"predicate": "Friends", "args": ["A", "B"]}]},
            {"kind": "arithmetic",
             "lhs": [{"coefficient": {"div": [1.0, {"cardinality": "B"}]},
                      "atom": {"predicate": "Friends", "args": ["A", "+B"]}},
                     {"atom": {"predicate": "Nice", "args": ["A"]}}],
             "comparator": "<=", "rhs": 2.0}
        ]
    }"#;

    #[test]
    fn parses_and_builds() {
        let doc = ModelDocument::from_json(FRIENDS).unwrap();
        let model = doc.build().unwrap();
        assert_eq!(model.predicates().len(), 2);
        assert_eq!(model.rules().count(), 2);
        let (_, rule) = model.rules().next().unwrap();
        assert_eq!(rule.weight(), Some(5.0));
        assert!(rule.squared());
    }

    #[test]
    fn argument_syntax() {
        assert_eq!(parse_arg("A"), Arg::var("A"));
        assert_eq!(parse_arg("+B"), Arg::sum("B"));
        assert_eq!(parse_arg("'alice'"), Arg::constant("alice"));
        assert_eq!(parse_arg("\"bob\""), Arg::constant("bob"));
    }

    #[test]
    fn select_statements_parse() {
        let text = r#"{
            "predicates": [
                {"name": "Knows", "arity": 2, "closed": true},
                {"name": "Friends", "arity": 2}
            ],
            "rules": [
                {"kind": "arithmetic",
                 "lhs": [{"atom": {"predicate": "Friends", "args": ["A", "+B"]}},
                         {"coefficient": 0.0, "atom": {"predicate": "Knows", "args": ["A", "A"]}}],
                 "comparator": "<=", "rhs": 1.0,
                 "select": {"+B": [{"predicate": "Knows", "args": ["A", "+B"]}]}}
            ]
        }"#;
        let model = ModelDocument::from_json(text).unwrap().build().unwrap();
        let (_, rule) = model.rules().next().unwrap();
        let Rule::Arithmetic(r) = rule else {
            panic!("expected an arithmetic rule");
        };
        let select = &r.selects["B"];
        assert_eq!(select[0].atom.args, vec![Arg::var("A"), Arg::var("B")]);
    }

    #[test]
    fn unknown_predicate_fails() {
        let text = r#"{"predicates": [], "rules": [
            {"kind": "logical", "body": [{"predicate": "Nope", "args": ["A"]}]}]}"#;
        let doc = ModelDocument::from_json(text).unwrap();
        assert!(doc.build().is_err());
    }
}
