//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use hlmrf::database::{AtomStore, Database, Partition};
use hlmrf::model::{Model, ModelDocument};
use hlmrf::term::TermStore;

pub const PEOPLE: [&str; 5] = ["alice", "bob", "carol", "dave", "eve"];

/// `5: Nice(A) & Nice(B) & (A != B) -> Friends(A, B) ^2` plus a weak
/// squared prior against friendship.
pub const FRIENDS_MODEL: &str = r#"{
    "predicates": [
        {"name": "Nice", "arity": 1, "closed": true},
        {"name": "Friends", "arity": 2}
    ],
    "rules": [
        {"kind": "logical", "weight": 5.0, "squared": true,
         "body": [{"predicate": "Nice", "args": ["A"]}, {"predicate": "Nice", "args": ["B"]}],
         "filters": [{"left": "A", "op": "!=", "right": "B"}],
         "head": [{"predicate": "Friends", "args": ["A", "B"]}]}
    ]
}"#;

/// The friends model with a second rule penalizing friendship.
pub const FRIENDS_WITH_PRIOR: &str = r#"{
    "predicates": [
        {"name": "Nice", "arity": 1, "closed": true},
        {"name": "Friends", "arity": 2}
    ],
    "rules": [
        {"kind": "logical", "weight": 5.0, "squared": true,
         "body": [{"predicate": "Nice", "args": ["A"]}, {"predicate": "Nice", "args": ["B"]}],
         "filters": [{"left": "A", "op": "!=", "right": "B"}],
         "head": [{"predicate": "Friends", "args": ["A", "B"]}]},
        {"kind": "logical", "weight": 1.0, "squared": true,
         "body": [{"predicate": "Nice", "args": ["A"]}, {"predicate": "Nice", "args": ["B"]}],
         "filters": [{"left": "A", "op": "!=", "right": "B"}],
         "head": [{"predicate": "Friends", "args": ["A", "B"], "negated": true}]}
    ]
}"#;

pub fn model(document: &str) -> Model {
    ModelDocument::from_json(document).unwrap().build().unwrap()
}

/// A database where every given person is nice.
pub fn nice_people(model: &Model, people: &[&str]) -> Arc<Database> {
    let database = Arc::new(Database::new());
    for person in people {
        database
            .insert(Partition::Read, model.atom("Nice", &[*person]).unwrap(), 1.0)
            .unwrap();
    }
    database
}

/// Terms rendered with atom names instead of indices, sorted, so stores
/// with different atom stores can be compared.
pub fn canonical_terms(store: &mut dyn TermStore, model: &Model) -> Vec<String> {
    let atoms: Arc<AtomStore> = Arc::clone(store.atoms());
    let mut rendered = Vec::new();
    store
        .for_each_term(&mut |_, term| {
            let mut parts: Vec<String> = term
                .atoms
                .iter()
                .zip(&term.coefficients)
                .map(|(&a, c)| format!("{c}*{}", model.format_atom(&atoms.get_atom(a).atom)))
                .collect();
            parts.sort();
            rendered.push(format!(
                "{} {:?} {} {}",
                term.rule,
                term.kind,
                parts.join(" + "),
                term.constant
            ));
        })
        .unwrap();
    rendered.sort();
    rendered
}
