//! Disk-paged term storage.
//!
//! Grounded terms are cached in memory until `page_size` of them accumulate,
//! then written to a numbered page file and the cache starts over. Passes
//! read pages back one at a time through a [`StreamingCursor`], so only one
//! page of terms and scratch is resident at once. The cursor is an explicit
//! state machine: it first flushes whatever grounding left in the cache,
//! then reads pages, then reports exhaustion.
//!
//! [`StreamingTermStore`] grounds lazily from a [`Database`] and re-grounds
//! when the database version moved since the last pass. The online store
//! reuses the same [`PagedTerms`] core with per-rule pages.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::database::{AtomStore, Database};
use crate::error::{HlmrfResult, StoreError};
use crate::grounding::{Grounder, GroundingReport};
use crate::model::{Model, RuleId};
use crate::term::memory::MemoryTermStore;
use crate::term::page::PageDir;
use crate::term::store::{CursorMode, PageView, PageVisitor, ScratchKind, TermStore};
use crate::term::{Term, TermGenerator};

/// Default number of terms per page.
pub const DEFAULT_PAGE_SIZE: usize = 10_000;

static PAGE_DIR_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Paging options shared by the streaming and online stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
    /// Terms per page.
    pub page_size: usize,
    /// Directory for page files. A private temporary directory when unset.
    pub page_dir: Option<PathBuf>,
    /// Shuffle the terms inside each page before it is written.
    pub shuffle_pages: bool,
    /// Visit pages in a random order on every pass.
    pub randomize_page_access: bool,
    /// Seed for shuffling. Entropy when unset.
    pub seed: Option<u64>,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            page_dir: None,
            shuffle_pages: false,
            randomize_page_access: false,
            seed: None,
        }
    }
}

/// Bookkeeping for one committed page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageMeta {
    /// File index, stable for the page's lifetime.
    pub index: usize,
    /// Rules that contributed terms to this page.
    pub rules: BTreeSet<RuleId>,
    pub term_count: usize,
    /// Inactive pages are skipped by passes.
    pub active: bool,
}

/// Pages, the in-memory cache of unpaged terms, and the scratch layout.
pub struct PagedTerms {
    pages: PageDir,
    owns_dir: bool,
    config: PagingConfig,
    meta: Vec<PageMeta>,
    cache: Vec<Term>,
    cache_rules: BTreeSet<RuleId>,
    /// Start a new page whenever the contributing rule changes.
    page_per_rule: bool,
    next_index: usize,
    kind: ScratchKind,
    rng: StdRng,
}

impl PagedTerms {
    pub fn new(config: PagingConfig, page_per_rule: bool) -> HlmrfResult<Self> {
        if config.page_size == 0 {
            return Err(crate::error::ReasonerError::InvalidConfig {
                message: "term_store.page_size must be positive".into(),
            }
            .into());
        }
        let (dir, owns_dir) = match &config.page_dir {
            Some(dir) => (dir.clone(), false),
            None => (
                std::env::temp_dir().join(format!(
                    "hlmrf-pages-{}-{}",
                    std::process::id(),
                    PAGE_DIR_COUNTER.fetch_add(1, Ordering::Relaxed)
                )),
                true,
            ),
        };
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            pages: PageDir::create(&dir)?,
            owns_dir,
            config,
            meta: Vec::new(),
            cache: Vec::new(),
            cache_rules: BTreeSet::new(),
            page_per_rule,
            next_index: 0,
            kind: ScratchKind::None,
            rng,
        })
    }

    pub fn page_dir(&self) -> &PageDir {
        &self.pages
    }

    pub fn meta(&self) -> &[PageMeta] {
        &self.meta
    }

    /// Active terms, paged or cached.
    pub fn len(&self) -> usize {
        self.meta
            .iter()
            .filter(|m| m.active)
            .map(|m| m.term_count)
            .sum::<usize>()
            + self.cache.len()
    }

    pub fn kind(&self) -> ScratchKind {
        self.kind
    }

    /// Cache a term, committing a page when the cache is full.
    pub fn push(&mut self, rule: RuleId, term: Term) -> HlmrfResult<()> {
        if self.page_per_rule && !self.cache_rules.is_empty() && !self.cache_rules.contains(&rule) {
            self.flush()?;
        }
        self.cache.push(term);
        self.cache_rules.insert(rule);
        if self.cache.len() >= self.config.page_size {
            self.flush()?;
        }
        Ok(())
    }

    pub fn reserve(&mut self, terms: usize) {
        self.cache
            .reserve(terms.min(self.config.page_size).saturating_sub(self.cache.len()));
    }

    /// Commit the cache as a new page.
    pub fn flush(&mut self) -> HlmrfResult<()> {
        if self.cache.is_empty() {
            return Ok(());
        }
        if self.config.shuffle_pages {
            self.cache.shuffle(&mut self.rng);
        }
        let index = self.next_index;
        let bytes = self.pages.write_terms(index, &self.cache)?;
        self.next_index += 1;
        tracing::debug!(page = index, terms = self.cache.len(), bytes, "flushed term page");
        self.meta.push(PageMeta {
            index,
            rules: std::mem::take(&mut self.cache_rules),
            term_count: self.cache.len(),
            active: true,
        });
        self.cache.clear();
        Ok(())
    }

    /// Pages holding terms of `rule`, by position in [`PagedTerms::meta`].
    pub fn pages_of(&self, rule: RuleId) -> Vec<usize> {
        self.meta
            .iter()
            .enumerate()
            .filter(|(_, m)| m.rules.contains(&rule))
            .map(|(i, _)| i)
            .collect()
    }

    /// Flip page membership for `rule`. Returns the pages touched.
    pub fn set_rule_active(&mut self, rule: RuleId, active: bool) -> usize {
        let pages = self.pages_of(rule);
        for &p in &pages {
            self.meta[p].active = active;
        }
        pages.len()
    }

    /// Delete the pages of `rule`. Returns the terms removed.
    pub fn remove_rule(&mut self, rule: RuleId) -> HlmrfResult<usize> {
        let mut removed = 0;
        let mut kept = Vec::with_capacity(self.meta.len());
        for meta in std::mem::take(&mut self.meta) {
            if meta.rules.contains(&rule) {
                self.pages.remove(meta.index)?;
                removed += meta.term_count;
            } else {
                kept.push(meta);
            }
        }
        self.meta = kept;
        if self.cache_rules.contains(&rule) {
            let before = self.cache.len();
            self.cache.retain(|t| t.rule != rule);
            removed += before - self.cache.len();
            self.cache_rules.remove(&rule);
        }
        Ok(removed)
    }

    /// Switch the scratch layout. Existing scratch files are dropped on change.
    pub fn prepare_scratch(&mut self, kind: ScratchKind) -> HlmrfResult<bool> {
        if kind == self.kind {
            return Ok(false);
        }
        for meta in &self.meta {
            self.pages.drop_scratch(meta.index)?;
        }
        self.kind = kind;
        Ok(true)
    }

    /// Delete every page and cached term.
    pub fn clear(&mut self) -> HlmrfResult<()> {
        for meta in std::mem::take(&mut self.meta) {
            self.pages.remove(meta.index)?;
        }
        self.cache.clear();
        self.cache_rules.clear();
        Ok(())
    }

    /// Open a pass over the active pages.
    pub fn cursor(&mut self, mode: CursorMode) -> StreamingCursor<'_> {
        StreamingCursor {
            paged: self,
            mode,
            state: CursorState::Grounding,
            order: Vec::new(),
            position: 0,
            closed: false,
        }
    }

    /// Every active term in store order, loaded into memory.
    pub fn load_all(&mut self) -> HlmrfResult<Vec<Term>> {
        self.flush()?;
        let mut terms = Vec::with_capacity(self.len());
        for meta in self.meta.iter().filter(|m| m.active) {
            terms.extend(self.pages.read_terms(meta.index)?);
        }
        Ok(terms)
    }

    /// `(position in meta, first store-wide term index)` of each active page,
    /// in visiting order.
    fn page_order(&mut self) -> Vec<(usize, usize)> {
        let mut offset = 0;
        let mut order = Vec::with_capacity(self.meta.len());
        for (i, meta) in self.meta.iter().enumerate() {
            if meta.active {
                order.push((i, offset));
                offset += meta.term_count;
            }
        }
        if self.config.randomize_page_access {
            order.shuffle(&mut self.rng);
        }
        order
    }

    fn visit_page(
        &mut self,
        position: usize,
        first_term: usize,
        mode: CursorMode,
        visitor: &mut PageVisitor<'_>,
    ) -> HlmrfResult<()> {
        let index = self.meta[position].index;
        let terms = self.pages.read_terms(index)?;
        let width: usize = terms.iter().map(|t| self.kind.width(t.size())).sum();
        let mut scratch = match self.pages.read_scratch(index, self.kind)? {
            Some(saved) if saved.len() == width => saved,
            Some(saved) => {
                return Err(StoreError::InvalidPage {
                    path: self.pages.volatile_path(index).display().to_string(),
                    message: format!("expected {width} scratch values, found {}", saved.len()),
                }
                .into());
            }
            // A page without scratch has not been seen by this reasoner yet.
            None => vec![0.0; width],
        };
        visitor(PageView {
            first_term,
            terms: &terms,
            scratch: &mut scratch,
            kind: self.kind,
        })?;
        if mode == CursorMode::ReadWrite && self.kind != ScratchKind::None {
            self.pages.write_scratch(index, self.kind, &scratch)?;
        }
        Ok(())
    }
}

impl Drop for PagedTerms {
    fn drop(&mut self) {
        if self.owns_dir {
            if let Err(e) = std::fs::remove_dir_all(self.pages.path()) {
                tracing::warn!(dir = %self.pages.path().display(), error = %e, "failed to remove page directory");
            }
        }
    }
}

impl std::fmt::Debug for PagedTerms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedTerms")
            .field("dir", &self.pages.path())
            .field("pages", &self.meta.len())
            .field("cached", &self.cache.len())
            .finish()
    }
}

/// Where a [`StreamingCursor`] is in its pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Cached terms still need to be committed before reading.
    Grounding,
    ReadingPages,
    Exhausted,
}

/// One pass over the pages of a [`PagedTerms`].
///
/// Must be closed when the pass ends early; dropping an open cursor closes
/// it and logs a warning.
pub struct StreamingCursor<'p> {
    paged: &'p mut PagedTerms,
    mode: CursorMode,
    state: CursorState,
    order: Vec<(usize, usize)>,
    position: usize,
    closed: bool,
}

impl StreamingCursor<'_> {
    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Visit the next page. Returns `false` once the pass is exhausted.
    pub fn next_page(&mut self, visitor: &mut PageVisitor<'_>) -> HlmrfResult<bool> {
        loop {
            match self.state {
                CursorState::Grounding => {
                    self.paged.flush()?;
                    self.order = self.paged.page_order();
                    self.state = CursorState::ReadingPages;
                }
                CursorState::ReadingPages => {
                    let Some(&(position, first_term)) = self.order.get(self.position) else {
                        self.state = CursorState::Exhausted;
                        continue;
                    };
                    self.position += 1;
                    self.paged.visit_page(position, first_term, self.mode, visitor)?;
                    return Ok(true);
                }
                CursorState::Exhausted => return Ok(false),
            }
        }
    }

    /// End the pass.
    pub fn close(&mut self) -> HlmrfResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.state != CursorState::Exhausted {
            tracing::debug!(
                visited = self.position,
                pages = self.order.len(),
                "streaming pass closed early"
            );
        }
        self.state = CursorState::Exhausted;
        self.order.clear();
        Ok(())
    }
}

impl Drop for StreamingCursor<'_> {
    fn drop(&mut self) {
        if !self.closed {
            tracing::warn!(visited = self.position, "streaming cursor dropped without close");
            if let Err(e) = self.close() {
                tracing::warn!(error = %e, "failed to close streaming cursor");
            }
        }
    }
}

/// Term store that grounds from a database into disk pages.
pub struct StreamingTermStore {
    model: Arc<Model>,
    database: Arc<Database>,
    generator: TermGenerator,
    atoms: Arc<AtomStore>,
    paged: PagedTerms,
    /// Database version the current pages were ground against.
    grounded_version: Option<u64>,
}

impl StreamingTermStore {
    pub fn new(
        model: Arc<Model>,
        database: Arc<Database>,
        atoms: Arc<AtomStore>,
        generator: TermGenerator,
        config: PagingConfig,
    ) -> HlmrfResult<Self> {
        Ok(Self {
            model,
            database,
            generator,
            atoms,
            paged: PagedTerms::new(config, false)?,
            grounded_version: None,
        })
    }

    pub fn pages(&self) -> &[PageMeta] {
        self.paged.meta()
    }

    pub fn page_dir(&self) -> &PageDir {
        self.paged.page_dir()
    }

    /// Whether the pages reflect the current database.
    pub fn is_current(&self) -> bool {
        self.grounded_version == Some(self.database.version())
    }

    /// Drop every page and ground all active rules again.
    pub fn ground(&mut self) -> HlmrfResult<GroundingReport> {
        self.paged.clear()?;
        let version = self.database.version();
        let (model, database, atoms) = (
            Arc::clone(&self.model),
            Arc::clone(&self.database),
            Arc::clone(&self.atoms),
        );
        let grounder = Grounder::new(&model, database.as_ref(), &atoms, &self.generator);
        let paged = &mut self.paged;
        let report = grounder.ground_all(&mut |rule, term| paged.push(rule, term))?;
        self.paged.flush()?;
        self.grounded_version = Some(version);
        tracing::info!(
            pages = self.paged.meta().len(),
            terms = report.terms,
            version,
            "streaming store ground"
        );
        Ok(report)
    }

    /// Open a pass over the pages.
    pub fn cursor(&mut self, mode: CursorMode) -> StreamingCursor<'_> {
        self.paged.cursor(mode)
    }
}

impl TermStore for StreamingTermStore {
    fn name(&self) -> &'static str {
        "streaming"
    }

    fn atoms(&self) -> &Arc<AtomStore> {
        &self.atoms
    }

    fn add(&mut self, term: Term) -> HlmrfResult<usize> {
        self.paged.push(term.rule, term)?;
        Ok(self.paged.len())
    }

    fn len(&self) -> usize {
        self.paged.len()
    }

    fn refresh(&mut self) -> HlmrfResult<()> {
        if !self.is_current() {
            if self.grounded_version.is_some() {
                tracing::info!("database changed since the last pass, re-grounding");
            }
            self.ground()?;
        }
        Ok(())
    }

    fn ensure_capacity(&mut self, terms: usize) {
        self.paged.reserve(terms);
    }

    fn prepare_scratch(&mut self, kind: ScratchKind) -> HlmrfResult<bool> {
        self.paged.prepare_scratch(kind)
    }

    fn scratch_kind(&self) -> ScratchKind {
        self.paged.kind()
    }

    fn visit_pages(&mut self, mode: CursorMode, visitor: &mut PageVisitor<'_>) -> HlmrfResult<()> {
        let mut cursor = self.paged.cursor(mode);
        while cursor.next_page(visitor)? {}
        cursor.close()
    }

    /// Terms added by hand are lost too; the next refresh grounds again.
    fn clear(&mut self) -> HlmrfResult<()> {
        self.paged.clear()?;
        self.grounded_version = None;
        Ok(())
    }

    fn close(&mut self) -> HlmrfResult<()> {
        self.clear()?;
        self.atoms.close();
        Ok(())
    }

    /// Copies are held in memory.
    fn copy_store(&mut self) -> HlmrfResult<Box<dyn TermStore>> {
        let state = self.save_state()?;
        let terms = self.paged.load_all()?;
        let mut copy = MemoryTermStore::new(Arc::new(self.atoms.copy()));
        copy.ensure_capacity(terms.len());
        for term in terms {
            copy.add(term)?;
        }
        copy.load_state(&state)?;
        Ok(Box::new(copy))
    }
}

impl std::fmt::Debug for StreamingTermStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingTermStore")
            .field("paged", &self.paged)
            .field("grounded_version", &self.grounded_version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Partition;
    use crate::model::document::ModelDocument;
    use crate::term::{GeneratorConfig, Shape, TermKind};
    use tempfile::TempDir;

    const FRIENDS: &str = r#"{
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

    fn store(dir: &TempDir, page_size: usize, people: &[&str]) -> StreamingTermStore {
        let model = Arc::new(ModelDocument::from_json(FRIENDS).unwrap().build().unwrap());
        let db = Arc::new(Database::new());
        for p in people {
            db.insert(Partition::Read, model.atom("Nice", &[*p]).unwrap(), 1.0)
                .unwrap();
        }
        StreamingTermStore::new(
            model,
            db,
            Arc::new(AtomStore::new()),
            TermGenerator::new(GeneratorConfig::default()),
            PagingConfig {
                page_size,
                page_dir: Some(dir.path().to_path_buf()),
                seed: Some(7),
                ..PagingConfig::default()
            },
        )
        .unwrap()
    }

    fn term(i: u32) -> Term {
        Term::new(
            RuleId::new(0),
            vec![i],
            vec![1.0],
            0.0,
            TermKind::Potential {
                weight: 1.0,
                shape: Shape::Linear,
            },
        )
    }

    #[test]
    fn grounding_splits_into_pages() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir, 8, &["a", "b", "c", "d", "e"]);
        store.refresh().unwrap();
        assert_eq!(store.len(), 20);
        let sizes: Vec<usize> = store.pages().iter().map(|m| m.term_count).collect();
        assert_eq!(sizes, vec![8, 8, 4]);
        assert!(store.page_dir().page_path(2).exists());

        let mut seen = Vec::new();
        store
            .visit_pages(CursorMode::ReadOnly, &mut |page| {
                seen.push((page.first_term, page.terms.len()));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![(0, 8), (8, 8), (16, 4)]);
    }

    #[test]
    fn scratch_persists_between_passes() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir, 3, &["a", "b", "c"]);
        store.refresh().unwrap();
        assert!(store.prepare_scratch(ScratchKind::Admm).unwrap());
        store
            .visit_pages(CursorMode::ReadWrite, &mut |page| {
                let first = page.first_term;
                for slot in page.slots() {
                    slot.scratch.fill((first + slot.index) as f32);
                }
                Ok(())
            })
            .unwrap();
        let state = store.save_state().unwrap();
        assert_eq!(state.terms.len(), 6);
        assert_eq!(state.terms[4].scratch, vec![7.0, 7.0]);

        // Read-only passes do not write back.
        store
            .visit_pages(CursorMode::ReadOnly, &mut |page| {
                page.scratch.fill(-1.0);
                Ok(())
            })
            .unwrap();
        assert_eq!(store.save_state().unwrap(), state);
    }

    #[test]
    fn database_change_triggers_reground() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir, 100, &["a", "b"]);
        store.refresh().unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.is_current());
        let atom = store.model.atom("Nice", &["c"]).unwrap();
        store.database.insert(Partition::Read, atom, 1.0).unwrap();
        assert!(!store.is_current());
        store.refresh().unwrap();
        assert_eq!(store.len(), 6);
    }

    #[test]
    fn cursor_walks_through_its_states() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir, 2, &[]);
        for i in 0..3 {
            store.add(term(i)).unwrap();
        }
        let mut cursor = store.cursor(CursorMode::ReadOnly);
        assert_eq!(cursor.state(), CursorState::Grounding);
        let mut visit = |_: PageView<'_>| -> HlmrfResult<()> { Ok(()) };
        assert!(cursor.next_page(&mut visit).unwrap());
        assert_eq!(cursor.state(), CursorState::ReadingPages);
        assert!(cursor.next_page(&mut visit).unwrap());
        assert!(!cursor.next_page(&mut visit).unwrap());
        assert_eq!(cursor.state(), CursorState::Exhausted);
        cursor.close().unwrap();
    }

    #[test]
    fn random_access_still_indexes_terms() {
        let dir = TempDir::new().unwrap();
        let model = Arc::new(Model::new());
        let mut store = StreamingTermStore::new(
            model,
            Arc::new(Database::new()),
            Arc::new(AtomStore::new()),
            TermGenerator::default(),
            PagingConfig {
                page_size: 2,
                page_dir: Some(dir.path().to_path_buf()),
                randomize_page_access: true,
                shuffle_pages: true,
                seed: Some(11),
            },
        )
        .unwrap();
        for i in 0..9 {
            store.add(term(i)).unwrap();
        }
        let mut indices = Vec::new();
        store
            .for_each_term(&mut |i, _| indices.push(i))
            .unwrap();
        indices.sort_unstable();
        assert_eq!(indices, (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn missing_page_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir, 2, &["a", "b", "c"]);
        store.refresh().unwrap();
        std::fs::remove_file(store.page_dir().page_path(1)).unwrap();
        let result = store.visit_pages(CursorMode::ReadOnly, &mut |_| Ok(()));
        assert!(result.is_err());
    }

    #[test]
    fn copy_lands_in_memory() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir, 4, &["a", "b", "c"]);
        store.refresh().unwrap();
        store.prepare_scratch(ScratchKind::Admm).unwrap();
        let mut copy = store.copy_store().unwrap();
        assert_eq!(copy.name(), "memory");
        assert_eq!(copy.len(), 6);
        assert_eq!(copy.terms().unwrap(), store.terms().unwrap());
        assert_eq!(copy.scratch_kind(), ScratchKind::Admm);
    }
}
