//! The paged store against in-memory grounding.

mod common;

use std::sync::Arc;

use hlmrf::database::{AtomStore, Partition};
use hlmrf::grounding::Grounder;
use hlmrf::reasoner::{AdmmConfig, AdmmReasoner, Reasoner};
use hlmrf::term::memory::MemoryTermStore;
use hlmrf::term::streaming::{PagingConfig, StreamingTermStore};
use hlmrf::term::{GeneratorConfig, TermGenerator, TermStore};
use tempfile::TempDir;

use common::{FRIENDS_WITH_PRIOR, PEOPLE, canonical_terms, model, nice_people};

fn paging(dir: &TempDir, page_size: usize) -> PagingConfig {
    PagingConfig {
        page_size,
        page_dir: Some(dir.path().to_path_buf()),
        shuffle_pages: true,
        randomize_page_access: true,
        seed: Some(9),
    }
}

#[test]
fn pages_hold_the_same_terms_as_memory() {
    let dir = TempDir::new().unwrap();
    let model = model(FRIENDS_WITH_PRIOR);
    let database = nice_people(&model, &PEOPLE);

    let memory_atoms = Arc::new(AtomStore::new());
    let generator = TermGenerator::new(GeneratorConfig::default());
    let mut memory = MemoryTermStore::new(Arc::clone(&memory_atoms));
    Grounder::new(&model, database.as_ref(), &memory_atoms, &generator)
        .ground_all(&mut |_, term| memory.add(term).map(|_| ()))
        .unwrap();

    let shared = Arc::new(model.clone());
    let mut streaming = StreamingTermStore::new(
        Arc::clone(&shared),
        Arc::clone(&database),
        Arc::new(AtomStore::new()),
        TermGenerator::new(GeneratorConfig::default()),
        paging(&dir, 7),
    )
    .unwrap();
    let report = streaming.ground().unwrap();
    assert_eq!(report.terms, 40);
    assert_eq!(streaming.pages().len(), 6);
    assert_eq!(
        canonical_terms(&mut memory, &model),
        canonical_terms(&mut streaming, &model)
    );
}

#[test]
fn streaming_admm_matches_memory_admm() {
    let dir = TempDir::new().unwrap();
    let model = model(FRIENDS_WITH_PRIOR);
    let database = nice_people(&model, &PEOPLE[..4]);
    let config = AdmmConfig {
        num_threads: 2,
        ..AdmmConfig::default()
    };

    let memory_atoms = Arc::new(AtomStore::new());
    let generator = TermGenerator::new(GeneratorConfig::default());
    let mut memory = MemoryTermStore::new(Arc::clone(&memory_atoms));
    Grounder::new(&model, database.as_ref(), &memory_atoms, &generator)
        .ground_all(&mut |_, term| memory.add(term).map(|_| ()))
        .unwrap();
    AdmmReasoner::new(config.clone()).unwrap().optimize(&mut memory).unwrap();

    let mut streaming = StreamingTermStore::new(
        Arc::new(model.clone()),
        Arc::clone(&database),
        Arc::new(AtomStore::new()),
        TermGenerator::new(GeneratorConfig::default()),
        paging(&dir, 5),
    )
    .unwrap();
    let report = AdmmReasoner::new(config).unwrap().optimize(&mut streaming).unwrap();
    assert!(report.converged);

    // 5 (1 - x)^2 + x^2 is minimized at 5/6.
    let expected = 5.0 / 6.0;
    for (store, name) in [
        (Arc::clone(memory.atoms()), "memory"),
        (Arc::clone(streaming.atoms()), "streaming"),
    ] {
        for index in store.random_variables() {
            let value = store.get_value(index);
            assert!((value - expected).abs() < 0.01, "{name}: {value}");
        }
    }
}

#[test]
fn database_changes_trigger_regrounding() {
    let dir = TempDir::new().unwrap();
    let model = model(FRIENDS_WITH_PRIOR);
    let database = nice_people(&model, &PEOPLE[..3]);
    let mut streaming = StreamingTermStore::new(
        Arc::new(model.clone()),
        Arc::clone(&database),
        Arc::new(AtomStore::new()),
        TermGenerator::new(GeneratorConfig::default()),
        paging(&dir, 4),
    )
    .unwrap();

    streaming.refresh().unwrap();
    assert_eq!(streaming.len(), 12);
    assert!(streaming.is_current());

    // Unchanged database: refresh keeps the pages.
    let before = canonical_terms(&mut streaming, &model);
    streaming.refresh().unwrap();
    assert_eq!(canonical_terms(&mut streaming, &model), before);

    database
        .insert(Partition::Read, model.atom("Nice", &["dave"]).unwrap(), 1.0)
        .unwrap();
    assert!(!streaming.is_current());
    streaming.refresh().unwrap();
    assert_eq!(streaming.len(), 24);

    streaming.close().unwrap();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
