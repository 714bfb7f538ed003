//! MAP inference over a term store.
//!
//! Every reasoner implements [`Reasoner::optimize`]: bring the store up to
//! date, iterate until a stopping rule fires or the iteration cap is hit,
//! then write the result into the store's atoms. Hitting the cap is not an
//! error; the report says whether the run converged.

pub mod admm;
pub mod dual_bcd;
pub mod mcsat;
pub mod sgd;
pub mod walksat;

use std::sync::atomic::{AtomicU64, Ordering};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{HlmrfResult, ReasonerError};
use crate::term::{CONSTRAINT_TOLERANCE, CursorMode, TermStore};

pub use admm::{AdmmConfig, AdmmReasoner};
pub use dual_bcd::{DualBcdConfig, DualBcdReasoner};
pub use mcsat::{McSatConfig, McSatReasoner};
pub use sgd::{SgdConfig, SgdReasoner};
pub use walksat::{MaxWalkSatConfig, MaxWalkSatReasoner};

/// Which reasoner to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonerKind {
    #[default]
    Admm,
    Sgd,
    DualBcd,
    MaxWalkSat,
    McSat,
}

impl std::fmt::Display for ReasonerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ReasonerKind::Admm => "admm",
            ReasonerKind::Sgd => "sgd",
            ReasonerKind::DualBcd => "dual-bcd",
            ReasonerKind::MaxWalkSat => "max-walk-sat",
            ReasonerKind::McSat => "mc-sat",
        })
    }
}

/// Outcome of one optimization call.
///
/// Fields a reasoner does not track stay at zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub iterations: usize,
    pub converged: bool,
    /// Weighted incompatibility of the final assignment.
    pub objective: f64,
    pub violated_constraints: usize,
    pub primal_residual: f64,
    pub dual_residual: f64,
    pub epsilon_primal: f64,
    pub epsilon_dual: f64,
    pub lagrangian_penalty: f64,
    pub augmented_lagrangian_penalty: f64,
    /// RMS change of the random variables when the result was written back.
    pub movement: f32,
}

impl std::fmt::Display for OptimizationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} after {} iterations: objective {:.6}, {} violated constraints, movement {:.6}",
            if self.converged { "converged" } else { "stopped" },
            self.iterations,
            self.objective,
            self.violated_constraints,
            self.movement,
        )
    }
}

/// MAP inference algorithm.
pub trait Reasoner: Send {
    fn name(&self) -> &'static str;

    /// Minimize the energy of `store`'s terms and write the assignment into
    /// its atoms.
    fn optimize(&mut self, store: &mut dyn TermStore) -> HlmrfResult<OptimizationReport>;
}

/// Energy of an assignment.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Objective {
    pub objective: f64,
    pub violated_constraints: usize,
}

impl std::ops::Add for Objective {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            objective: self.objective + other.objective,
            violated_constraints: self.violated_constraints + other.violated_constraints,
        }
    }
}

/// Weighted incompatibility of every potential under `values`, plus the
/// number of hard constraints violated by more than the tolerance.
pub fn compute_objective(store: &mut dyn TermStore, values: &[f32]) -> HlmrfResult<Objective> {
    let mut total = Objective::default();
    store.visit_pages(CursorMode::ReadOnly, &mut |page| {
        total = total
            + page
                .terms
                .par_iter()
                .map(|term| Objective {
                    objective: f64::from(term.weighted_incompatibility(values)),
                    violated_constraints: usize::from(term.violation(values) > CONSTRAINT_TOLERANCE),
                })
                .reduce(Objective::default, |a, b| a + b);
        Ok(())
    })?;
    Ok(total)
}

/// Worker count used when a config leaves it at zero.
pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// A dedicated pool for one reasoner.
pub(crate) fn build_pool(num_threads: usize) -> HlmrfResult<rayon::ThreadPool> {
    let threads = if num_threads == 0 {
        default_threads()
    } else {
        num_threads
    };
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("hlmrf-reasoner-{i}"))
        .build()
        .map_err(|e| {
            ReasonerError::ThreadPool {
                message: e.to_string(),
            }
            .into()
        })
}

/// A seeded generator for reproducible runs, or one drawn from the OS.
pub(crate) fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

pub(crate) fn invalid_config(message: impl Into<String>) -> crate::error::HlmrfError {
    ReasonerError::InvalidConfig {
        message: message.into(),
    }
    .into()
}

/// Per-atom `f64` sums that many workers add to at once.
pub(crate) struct AtomicSums {
    cells: Vec<AtomicU64>,
}

impl AtomicSums {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            cells: (0..len).map(|_| AtomicU64::new(0.0f64.to_bits())).collect(),
        }
    }

    pub(crate) fn add(&self, index: usize, value: f64) {
        let cell = &self.cells[index];
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match cell.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn get(&self, index: usize) -> f64 {
        f64::from_bits(self.cells[index].load(Ordering::Acquire))
    }

    pub(crate) fn reset(&self) {
        self.cells
            .par_iter()
            .for_each(|c| c.store(0.0f64.to_bits(), Ordering::Relaxed));
    }
}
