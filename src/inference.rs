//! End-to-end MAP inference: build the term store and reasoner a config
//! asks for, ground, optimize and hand back the inferred targets.

use std::io::Write;
use std::sync::Arc;

use crate::config::{InferenceConfig, TermStoreKind};
use crate::database::{AtomStore, Database, Partition};
use crate::error::{HlmrfResult, StoreError};
use crate::grounding::{Grounder, GroundingReport};
use crate::lazy::{LazyInference, LazyReport};
use crate::model::{Constant, GroundAtom, Model};
use crate::online::OnlineInference;
use crate::reasoner::{
    AdmmReasoner, DualBcdReasoner, McSatReasoner, MaxWalkSatReasoner, OptimizationReport,
    Reasoner, ReasonerKind, SgdReasoner,
};
use crate::term::blocker::BlockerTermStore;
use crate::term::dual::DualTermStore;
use crate::term::memory::MemoryTermStore;
use crate::term::online::OnlineTermStore;
use crate::term::streaming::StreamingTermStore;
use crate::term::{TermGenerator, TermStore};

/// Outcome of [`Inference::run`].
#[derive(Debug, Clone)]
pub struct InferenceResult {
    pub grounding: GroundingReport,
    pub optimization: OptimizationReport,
    /// Every random variable with its inferred value.
    pub targets: Vec<(GroundAtom, f32)>,
}

pub struct Inference {
    model: Arc<Model>,
    database: Arc<Database>,
    atoms: Arc<AtomStore>,
    config: InferenceConfig,
}

impl Inference {
    pub fn new(model: Model, database: Arc<Database>, config: InferenceConfig) -> HlmrfResult<Self> {
        config.validate()?;
        Ok(Self {
            model: Arc::new(model),
            database,
            atoms: Arc::new(AtomStore::new()),
            config,
        })
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn atoms(&self) -> &Arc<AtomStore> {
        &self.atoms
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    fn generator(&self) -> TermGenerator {
        TermGenerator::new(self.config.generator)
    }

    /// Ground every active rule into the store the config selects.
    pub fn ground(&self) -> HlmrfResult<(Box<dyn TermStore>, GroundingReport)> {
        let discrete = matches!(
            self.config.reasoner.kind,
            ReasonerKind::MaxWalkSat | ReasonerKind::McSat
        );
        let (store, report): (Box<dyn TermStore>, GroundingReport) = match self.config.term_store.kind {
            TermStoreKind::Memory if discrete => {
                let mut store = BlockerTermStore::new(Arc::clone(&self.atoms));
                let report = self.ground_into(&mut store)?;
                store.build()?;
                (Box::new(store), report)
            }
            TermStoreKind::Memory => {
                let mut store = MemoryTermStore::new(Arc::clone(&self.atoms));
                let report = self.ground_into(&mut store)?;
                (Box::new(store), report)
            }
            TermStoreKind::Streaming => {
                let mut store = StreamingTermStore::new(
                    Arc::clone(&self.model),
                    Arc::clone(&self.database),
                    Arc::clone(&self.atoms),
                    self.generator(),
                    self.config.term_store.paging.clone(),
                )?;
                let report = store.ground()?;
                (Box::new(store), report)
            }
            TermStoreKind::Online => {
                let mut store = OnlineTermStore::new(
                    (*self.model).clone(),
                    Arc::clone(&self.database),
                    Arc::clone(&self.atoms),
                    self.generator(),
                    self.config.term_store.paging.clone(),
                )?;
                store.refresh()?;
                let report = store.last_grounding().clone();
                (Box::new(store), report)
            }
        };
        let store: Box<dyn TermStore> = if self.config.reasoner.kind == ReasonerKind::DualBcd {
            Box::new(DualTermStore::new(store))
        } else {
            store
        };
        for (rule, rule_model) in self.model.rules() {
            if report.per_rule.get(&rule).copied().unwrap_or(0) == 0 {
                tracing::warn!(%rule, rule_text = %rule_model, "rule produced no terms");
            }
        }
        tracing::info!(
            store = store.name(),
            terms = report.terms,
            dropped = report.dropped(),
            "grounding finished"
        );
        Ok((store, report))
    }

    fn ground_into(&self, store: &mut dyn TermStore) -> HlmrfResult<GroundingReport> {
        let generator = self.generator();
        let grounder = Grounder::new(&self.model, self.database.as_ref(), &self.atoms, &generator);
        grounder.ground_all(&mut |_, term| store.add(term).map(|_| ()))
    }

    /// Ground, optimize and collect the inferred random variables.
    pub fn run(&self) -> HlmrfResult<InferenceResult> {
        let (mut store, grounding) = self.ground()?;
        let mut reasoner = build_reasoner(&self.config)?;
        tracing::info!(reasoner = reasoner.name(), store = store.name(), "optimizing");
        let optimization = reasoner.optimize(store.as_mut());
        // Closing releases the atoms, so read the targets first.
        let mut targets = self.atoms.sync();
        targets.sort_by(|a, b| a.0.cmp(&b.0));
        let close = store.close();
        let optimization = optimization?;
        if let Err(e) = close {
            tracing::warn!(error = %e, "failed to close term store");
        }
        Ok(InferenceResult {
            grounding,
            optimization,
            targets,
        })
    }

    /// Write inferred values back into the WRITE partition.
    pub fn commit(&self, targets: &[(GroundAtom, f32)]) -> HlmrfResult<usize> {
        self.database.commit(targets, Partition::Write)
    }

    /// Start an online session over this model and database.
    pub fn into_online(self) -> HlmrfResult<OnlineInference> {
        let (store, reasoner) = self.online_parts()?;
        Ok(OnlineInference::new(store, reasoner))
    }

    /// Run lazy inference on an online store: open atoms missing from the
    /// database join the grounding only once their value is high enough.
    pub fn run_lazy(&self) -> HlmrfResult<LazyReport> {
        let (store, reasoner) = self.online_parts()?;
        let mut lazy = LazyInference::new(store, reasoner, self.config.lazy.clone())?;
        tracing::info!(reasoner = %self.config.reasoner.kind, "lazy inference");
        let report = lazy.run();
        if let Err(e) = lazy.close() {
            tracing::warn!(error = %e, "failed to close term store");
        }
        report
    }

    fn online_parts(&self) -> HlmrfResult<(OnlineTermStore, Box<dyn Reasoner>)> {
        let reasoner = match self.config.reasoner.kind {
            ReasonerKind::Admm | ReasonerKind::Sgd => build_reasoner(&self.config)?,
            other => {
                return Err(crate::error::ReasonerError::StoreMismatch {
                    reasoner: other.to_string(),
                    required: "memory".to_string(),
                }
                .into());
            }
        };
        let store = OnlineTermStore::new(
            (*self.model).clone(),
            Arc::clone(&self.database),
            Arc::clone(&self.atoms),
            self.generator(),
            self.config.term_store.paging.clone(),
        )?;
        Ok((store, reasoner))
    }
}

impl std::fmt::Debug for Inference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inference")
            .field("reasoner", &self.config.reasoner.kind)
            .field("term_store", &self.config.term_store.kind)
            .field("atoms", &self.atoms.len())
            .finish()
    }
}

/// The reasoner the config selects.
pub fn build_reasoner(config: &InferenceConfig) -> HlmrfResult<Box<dyn Reasoner>> {
    Ok(match config.reasoner.kind {
        ReasonerKind::Admm => Box::new(AdmmReasoner::new(config.admm.clone())?),
        ReasonerKind::Sgd => Box::new(SgdReasoner::new(config.sgd.clone())?),
        ReasonerKind::DualBcd => Box::new(DualBcdReasoner::new(config.dual_bcd.clone())?),
        ReasonerKind::MaxWalkSat => Box::new(MaxWalkSatReasoner::new(config.max_walk_sat.clone())?),
        ReasonerKind::McSat => Box::new(McSatReasoner::new(config.mc_sat.clone())?),
    })
}

/// Write atoms as fact lines, `Predicate<TAB>args..<TAB>value`, readable by
/// the fact loader.
pub fn write_tsv<W: Write>(model: &Model, atoms: &[(GroundAtom, f32)], mut out: W) -> HlmrfResult<()> {
    let io = |source: std::io::Error| StoreError::Io {
        path: "<output>".to_string(),
        source,
    };
    for (atom, value) in atoms {
        let name = &model.predicate(atom.predicate).name;
        let args: Vec<&str> = atom.args.iter().map(Constant::as_str).collect();
        writeln!(out, "{name}\t{}\t{value:.6}", args.join("\t")).map_err(io)?;
    }
    out.flush().map_err(io)?;
    Ok(())
}
