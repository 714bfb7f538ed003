//! End-to-end grounding and inference on the friends scenario.

mod common;

use std::sync::Arc;

use hlmrf::config::InferenceConfig;
use hlmrf::database::{AtomStore, Partition};
use hlmrf::grounding::Grounder;
use hlmrf::inference::Inference;
use hlmrf::reasoner::{AdmmConfig, AdmmReasoner, Reasoner, ReasonerKind};
use hlmrf::term::memory::MemoryTermStore;
use hlmrf::term::{GeneratorConfig, Shape, TermGenerator, TermStore};

use common::{FRIENDS_MODEL, PEOPLE, canonical_terms, model, nice_people};

fn ground_memory(document: &str, people: &[&str]) -> (hlmrf::model::Model, MemoryTermStore) {
    let model = model(document);
    let database = nice_people(&model, people);
    let atoms = Arc::new(AtomStore::new());
    let generator = TermGenerator::new(GeneratorConfig::default());
    let mut store = MemoryTermStore::new(Arc::clone(&atoms));
    Grounder::new(&model, database.as_ref(), &atoms, &generator)
        .ground_all(&mut |_, term| store.add(term).map(|_| ()))
        .unwrap();
    (model, store)
}

#[test]
fn five_nice_people_ground_twenty_squared_hinges() {
    let (_, mut store) = ground_memory(FRIENDS_MODEL, &PEOPLE);
    assert_eq!(store.len(), 20);
    for term in store.terms().unwrap() {
        assert_eq!(term.weight(), Some(5.0));
        assert_eq!(term.shape(), Some(Shape::SquaredHinge));
        assert_eq!(term.size(), 1);
        // Nice(A) + Nice(B) - 1 <= Friends(A, B), with both Nice observed at 1.
        assert_eq!(term.coefficients, vec![-1.0]);
        assert_eq!(term.constant, -1.0);
    }
    // One random variable per ordered pair.
    assert_eq!(store.atoms().random_variables().len(), 20);
}

#[test]
fn admm_pushes_friendship_to_one() {
    let (_, mut store) = ground_memory(FRIENDS_MODEL, &PEOPLE);
    let mut reasoner = AdmmReasoner::new(AdmmConfig {
        num_threads: 2,
        ..AdmmConfig::default()
    })
    .unwrap();
    let report = reasoner.optimize(&mut store).unwrap();
    assert!(report.converged);
    assert_eq!(report.violated_constraints, 0);
    assert!(report.objective < 1e-3, "{report}");
    for index in store.atoms().random_variables() {
        assert!(store.atoms().get_value(index) > 0.99);
    }
}

#[test]
fn regrounding_an_unchanged_database_is_idempotent() {
    let (model, mut first) = ground_memory(FRIENDS_MODEL, &PEOPLE);
    let (_, mut second) = ground_memory(FRIENDS_MODEL, &PEOPLE);
    assert_eq!(
        canonical_terms(&mut first, &model),
        canonical_terms(&mut second, &model)
    );
}

#[test]
fn facade_runs_each_continuous_reasoner() {
    for kind in [ReasonerKind::Admm, ReasonerKind::Sgd, ReasonerKind::DualBcd] {
        let model = model(FRIENDS_MODEL);
        let database = nice_people(&model, &PEOPLE[..3]);
        let mut config = InferenceConfig::default();
        config.reasoner.kind = kind;
        config.set_threads(2);
        config.sgd.seed = Some(3);
        let inference = Inference::new(model, database, config).unwrap();
        let result = inference.run().unwrap();
        assert_eq!(result.grounding.terms, 6, "{kind}");
        assert_eq!(result.targets.len(), 6, "{kind}");
        for (atom, value) in &result.targets {
            assert!(*value > 0.95, "{kind}: {atom} = {value}");
        }
        assert_eq!(inference.commit(&result.targets).unwrap(), 6);
        assert_eq!(inference.database().atoms(Partition::Write).len(), 6);
    }
}
