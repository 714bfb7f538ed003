// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # hlmrf
//!
//! Grounding and MAP inference for hinge-loss Markov random fields.
//!
//! ## Architecture
//!
//! - **Model** (`model`): predicates, logical and arithmetic rules, JSON model documents
//! - **Database** (`database`): partitioned facts, the shared `AtomStore`, redb archives
//! - **Grounding** (`grounding`): rule queries, atom classification, partial grounding
//! - **Terms** (`term`): hyperplane terms and their stores (memory, paged, online, dual, blocker)
//! - **Reasoners** (`reasoner`): ADMM consensus optimization, SGD, dual BCD, MaxWalkSat, MC-SAT
//! - **Online** (`online`): a command protocol over incrementally maintained terms
//! - **Lazy** (`lazy`): grounding that grows with the targets optimization activates
//! - **Evaluation** (`evaluation`): discrete, continuous, ranking and categorical scores against truth
//!
//! ## Library usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use hlmrf::config::InferenceConfig;
//! use hlmrf::database::{Database, Partition};
//! use hlmrf::inference::Inference;
//! use hlmrf::model::ModelDocument;
//!
//! let model = ModelDocument::load("model.json".as_ref()).unwrap().build().unwrap();
//! let database = Arc::new(Database::new());
//! database
//!     .insert(Partition::Read, model.atom("Nice", &["alice"]).unwrap(), 1.0)
//!     .unwrap();
//! let inference = Inference::new(model, database, InferenceConfig::default()).unwrap();
//! let result = inference.run().unwrap();
//! println!("{}", result.optimization);
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod evaluation;
pub mod grounding;
pub mod inference;
pub mod lazy;
pub mod model;
pub mod online;
pub mod reasoner;
pub mod term;
