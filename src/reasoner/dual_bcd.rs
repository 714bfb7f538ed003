//! Block coordinate descent on the dual of the regularized LCQP.
//!
//! Adding `reg·‖x‖²` to the MAP objective makes it strongly convex, so its
//! dual has closed-form primal recovery `x = −message / (2·reg)`. Each
//! block is one term's dual variable (plus the slack-bound dual of a linear
//! hinge); a block update takes a step along the block's partial derivative
//! whose size keeps every dual feasible. Atoms carry their bound duals and
//! the running message in [`DualAtom`]s held by the [`DualTermStore`].
//!
//! Terms of different connected components never share an atom, so the
//! components of each page are updated in parallel. Stopping is decided
//! globally every `compute_period` iterations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{HlmrfResult, ReasonerError, TermError};
use crate::model::Comparator;
use crate::reasoner::{OptimizationReport, Reasoner, build_pool, compute_objective, invalid_config};
use crate::term::dual::{DualAtom, STRICT_EPSILON};
use crate::term::store::TermSlot;
use crate::term::{CursorMode, ScratchKind, Shape, Term, TermKind, TermStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DualBcdConfig {
    pub max_iterations: usize,
    pub regularization: f64,
    /// Stopping rules are checked every this many iterations.
    pub compute_period: usize,
    pub primal_dual_break: bool,
    pub primal_dual_tolerance: f64,
    pub objective_break: bool,
    pub objective_tolerance: f64,
    /// Worker threads; 0 uses every available core.
    pub num_threads: usize,
}

impl Default for DualBcdConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10_000,
            regularization: 1e-2,
            compute_period: 10,
            primal_dual_break: true,
            primal_dual_tolerance: 1e-2,
            objective_break: true,
            objective_tolerance: 1e-5,
            num_threads: 0,
        }
    }
}

impl DualBcdConfig {
    pub fn validate(&self) -> HlmrfResult<()> {
        if self.max_iterations == 0 {
            return Err(invalid_config("dual_bcd.max_iterations must be positive"));
        }
        if !(self.regularization > 0.0) {
            return Err(invalid_config("dual_bcd.regularization must be positive"));
        }
        if self.compute_period == 0 {
            return Err(invalid_config("dual_bcd.compute_period must be positive"));
        }
        if !(self.primal_dual_tolerance >= 0.0) || !(self.objective_tolerance >= 0.0) {
            return Err(invalid_config("dual_bcd tolerances must not be negative"));
        }
        Ok(())
    }
}

pub struct DualBcdReasoner {
    config: DualBcdConfig,
    pool: rayon::ThreadPool,
}

/// The term shapes the dual LCQP understands.
#[derive(Debug, Clone, Copy, PartialEq)]
enum DualShape {
    Constraint { equality: bool },
    Hinge { weight: f64 },
    SquaredHinge { weight: f64 },
}

impl DualShape {
    fn of(term: &Term) -> HlmrfResult<Self> {
        match term.kind {
            TermKind::Constraint {
                comparator: Comparator::Eq,
            } => Ok(DualShape::Constraint { equality: true }),
            TermKind::Constraint {
                comparator: Comparator::Lte,
            } => Ok(DualShape::Constraint { equality: false }),
            TermKind::Potential {
                weight,
                shape: Shape::Hinge,
            } => Ok(DualShape::Hinge {
                weight: f64::from(weight),
            }),
            TermKind::Potential {
                weight,
                shape: Shape::SquaredHinge,
            } => Ok(DualShape::SquaredHinge {
                weight: f64::from(weight),
            }),
            _ => Err(TermError::UnsupportedShape {
                ground_rule: term.to_string(),
                reason: "the dual BCD reasoner supports hinge and squared hinge potentials \
                         and <= or = constraints"
                    .to_string(),
            }
            .into()),
        }
    }

    fn is_equality(self) -> bool {
        matches!(self, DualShape::Constraint { equality: true })
    }
}

/// Dual atoms shared by the workers of one pass. Components are disjoint, so
/// the locks are never contended.
struct SharedAtoms {
    atoms: Vec<Mutex<DualAtom>>,
    regularization: f64,
}

impl SharedAtoms {
    fn get(&self, index: u32) -> DualAtom {
        *self.atoms[index as usize].lock().expect("dual atom lock poisoned")
    }

    fn with<R>(&self, index: u32, f: impl FnOnce(&mut DualAtom) -> R) -> R {
        f(&mut self.atoms[index as usize].lock().expect("dual atom lock poisoned"))
    }

    fn into_inner(self) -> Vec<DualAtom> {
        self.atoms
            .into_iter()
            .map(|a| a.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()))
            .collect()
    }

    fn term_dual_partial(&self, term: &Term, shape: DualShape, dual: f64, slack: f64) -> f64 {
        let reg = self.regularization;
        let mut partial = term
            .atoms
            .iter()
            .zip(&term.coefficients)
            .map(|(&a, &c)| f64::from(c) * self.get(a).message)
            .sum::<f64>()
            / reg;
        match shape {
            DualShape::SquaredHinge { weight } => partial += dual / (reg + weight),
            DualShape::Hinge { weight } => partial += (dual + slack - weight) / reg,
            DualShape::Constraint { .. } => {}
        }
        partial += 2.0 * f64::from(term.constant);
        if !shape.is_equality() && partial > 0.0 && dual.abs() < STRICT_EPSILON {
            partial = 0.0;
        }
        partial
    }

    /// Largest step keeping every dual non-negative, capped by the exact
    /// minimizer along the block direction.
    fn step_size(&self, term: &Term, shape: DualShape, dual: f64, slack: f64, tdp: f64, sdp: f64) -> f64 {
        let reg = self.regularization;
        let mut ratio = f64::INFINITY;
        if tdp > 0.0 && !shape.is_equality() {
            ratio = dual / tdp;
        }
        if sdp > 0.0 {
            ratio = ratio.min(slack / sdp);
        }

        let mut numerator = 0.0;
        let mut denominator = 0.0;
        let mut lower_sum = 0.0;
        let mut upper_sum = 0.0;
        for (&a, &c) in term.atoms.iter().zip(&term.coefficients) {
            let atom = self.get(a);
            let c = f64::from(c);
            let lower = atom.lower_bound_partial(reg);
            let upper = atom.upper_bound_partial(reg);
            if lower > 0.0 {
                ratio = ratio.min(atom.lower_bound_dual / lower);
            }
            if upper > 0.0 {
                ratio = ratio.min(atom.upper_bound_dual / upper);
            }
            lower_sum += c * lower;
            upper_sum += c * upper;
            numerator += lower * lower + upper * upper;
            denominator += (lower - upper - c * tdp) * lower;
            denominator += (upper - lower + c * tdp) * upper;
        }
        denominator /= reg;

        let self_product: f64 = term.coefficients.iter().map(|&c| f64::from(c) * f64::from(c)).sum();
        let mut stat = (tdp * self_product - lower_sum + upper_sum) / reg;
        match shape {
            DualShape::SquaredHinge { weight } => stat += tdp / (reg + weight),
            DualShape::Hinge { .. } => {
                stat += tdp / reg;
                stat += sdp / reg;
                numerator += sdp * sdp;
                denominator += ((sdp + tdp) / reg) * sdp;
            }
            DualShape::Constraint { .. } => {}
        }
        numerator += tdp * tdp;
        denominator += stat * tdp;

        let minimizer = if numerator == 0.0 || denominator == 0.0 {
            0.0
        } else {
            numerator / denominator
        };
        ratio.min(minimizer)
    }

    /// One block update. `scratch` is `[dual, slack bound dual]`.
    fn update(&self, term: &Term, scratch: &mut [f32]) -> HlmrfResult<()> {
        let shape = DualShape::of(term)?;
        let reg = self.regularization;
        let dual = f64::from(scratch[0]);
        let slack = f64::from(scratch[1]);

        let tdp = self.term_dual_partial(term, shape, dual, slack);
        let sdp = match shape {
            DualShape::Hinge { weight } => {
                let partial = (slack + dual - weight) / reg;
                if partial > 0.0 && slack.abs() < STRICT_EPSILON {
                    0.0
                } else {
                    partial
                }
            }
            _ => 0.0,
        };
        let step = self.step_size(term, shape, dual, slack, tdp, sdp);

        let mut updated = dual - step * tdp;
        if !shape.is_equality() {
            updated = updated.max(0.0);
        }
        let delta = updated - dual;
        scratch[0] = updated as f32;
        for (&a, &c) in term.atoms.iter().zip(&term.coefficients) {
            self.with(a, |atom| atom.update(delta, f64::from(c), reg, step));
        }
        if matches!(shape, DualShape::Hinge { .. }) {
            scratch[1] = (slack - step * sdp).max(0.0) as f32;
        }
        Ok(())
    }

    /// The term's share of the dual objective, slack bound included.
    fn term_objective(&self, term: &Term, dual: f64, slack: f64) -> HlmrfResult<f64> {
        let shape = DualShape::of(term)?;
        let reg = self.regularization;
        let message: f64 = term
            .atoms
            .iter()
            .zip(&term.coefficients)
            .map(|(&a, &c)| f64::from(c) * self.get(a).message)
            .sum();
        let mut value = dual * message / (2.0 * reg);
        match shape {
            DualShape::SquaredHinge { weight } => value += dual * dual / (2.0 * (reg + weight)),
            DualShape::Hinge { weight } => {
                value += dual * dual / (2.0 * reg);
                value += dual * slack / (2.0 * reg);
                value -= weight * dual / reg;
                value += weight * weight / (2.0 * reg);
                value += slack * dual / (2.0 * reg) + slack * slack / (2.0 * reg) - slack * weight / reg;
            }
            DualShape::Constraint { .. } => {}
        }
        value += 2.0 * f64::from(term.constant) * dual;
        Ok(value)
    }
}

/// Union-find over atom indices.
struct Components {
    parent: Vec<u32>,
}

impl Components {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len as u32).collect(),
        }
    }

    fn find(&mut self, mut a: u32) -> u32 {
        while self.parent[a as usize] != a {
            let grand = self.parent[self.parent[a as usize] as usize];
            self.parent[a as usize] = grand;
            a = grand;
        }
        a
    }

    fn union(&mut self, a: u32, b: u32) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb) as usize] = ra.min(rb);
        }
    }

    /// Flatten so every atom points straight at its root.
    fn roots(mut self) -> Vec<u32> {
        (0..self.parent.len() as u32).map(|a| self.find(a)).collect()
    }
}

impl DualBcdReasoner {
    pub fn new(config: DualBcdConfig) -> HlmrfResult<Self> {
        config.validate()?;
        let pool = build_pool(config.num_threads)?;
        Ok(Self { config, pool })
    }

    fn run(&self, store: &mut dyn TermStore) -> HlmrfResult<OptimizationReport> {
        let Some(dual_store) = store.as_dual() else {
            return Err(ReasonerError::StoreMismatch {
                reasoner: "dual-bcd".to_string(),
                required: "dual".to_string(),
            }
            .into());
        };
        dual_store.refresh()?;
        dual_store.prepare_scratch(ScratchKind::DualLcqp)?;
        let atom_store = Arc::clone(dual_store.atoms());
        let reg = self.config.regularization;

        let mut components = Components::new(atom_store.len());
        let mut shape_error = None;
        dual_store.for_each_term(&mut |_, term| {
            if shape_error.is_none() {
                if let Err(e) = DualShape::of(term) {
                    shape_error = Some(e);
                }
            }
            for pair in term.atoms.windows(2) {
                components.union(pair[0], pair[1]);
            }
        })?;
        if let Some(e) = shape_error {
            return Err(e);
        }
        let roots = components.roots();
        let component_count = roots.iter().enumerate().filter(|(i, r)| **r == *i as u32).count();
        tracing::debug!(terms = dual_store.len(), components = component_count, "dual bcd start");

        let shared = SharedAtoms {
            atoms: dual_store.take_dual_atoms().into_iter().map(Mutex::new).collect(),
            regularization: reg,
        };
        let variables = atom_store.random_variables();
        let result = self.iterate(&mut *dual_store, &shared, &roots, &variables);
        dual_store.restore_dual_atoms(shared.into_inner());
        let (mut report, values) = result?;

        report.movement = atom_store.write_back(&values);
        let objective = compute_objective(&mut *dual_store, &atom_store.values())?;
        report.objective = objective.objective;
        report.violated_constraints = objective.violated_constraints;
        if report.converged {
            tracing::info!(iterations = report.iterations, objective = report.objective, "dual bcd converged");
        } else {
            tracing::warn!(
                iterations = report.iterations,
                objective = report.objective,
                "dual bcd hit the iteration cap without converging"
            );
        }
        Ok(report)
    }

    fn iterate(
        &self,
        store: &mut dyn TermStore,
        shared: &SharedAtoms,
        roots: &[u32],
        variables: &[u32],
    ) -> HlmrfResult<(OptimizationReport, Vec<f32>)> {
        let reg = self.config.regularization;
        let mut report = OptimizationReport::default();
        let mut values = store.atoms().values();
        let mut previous_primal: Option<f64> = None;

        for iteration in 1..=self.config.max_iterations {
            report.iterations = iteration;
            store.visit_pages(CursorMode::ReadWrite, &mut |page| {
                let mut groups: HashMap<u32, Vec<TermSlot<'_>>> = HashMap::new();
                for slot in page.slots() {
                    let Some(&first) = slot.term.atoms.first() else {
                        continue;
                    };
                    groups.entry(roots[first as usize]).or_default().push(slot);
                }
                groups.into_par_iter().try_for_each(|(_, slots)| {
                    for slot in slots {
                        shared.update(slot.term, slot.scratch)?;
                    }
                    Ok(())
                })
            })?;

            if (iteration - 1) % self.config.compute_period != 0 && iteration != self.config.max_iterations {
                continue;
            }

            for &v in variables {
                values[v as usize] = shared.get(v).primal(reg);
            }
            let primal = compute_objective(store, &values)?;
            let regularizer: f64 = variables
                .iter()
                .map(|&v| reg * f64::from(values[v as usize]).powi(2))
                .sum();
            let primal_objective = primal.objective + regularizer;

            let mut dual_total = 0.0;
            store.visit_pages(CursorMode::ReadOnly, &mut |page| {
                for slot in page.slots() {
                    dual_total += shared.term_objective(
                        slot.term,
                        f64::from(slot.scratch[0]),
                        f64::from(slot.scratch[1]),
                    )?;
                }
                Ok(())
            })?;
            dual_total += variables
                .iter()
                .map(|&v| shared.get(v).bound_objective(reg))
                .sum::<f64>();
            let dual_objective = -0.5 * dual_total;

            // Reported as residuals: the duality gap is this reasoner's residual.
            report.primal_residual = primal_objective;
            report.dual_residual = dual_objective;
            report.violated_constraints = primal.violated_constraints;
            tracing::trace!(iteration, primal = primal_objective, dual = dual_objective, "dual bcd objectives");

            let stop = primal.violated_constraints == 0
                && ((self.config.objective_break
                    && previous_primal.is_some_and(|p| (p - primal_objective).abs() < self.config.objective_tolerance))
                    || (self.config.primal_dual_break
                        && primal_objective - dual_objective <= self.config.primal_dual_tolerance));
            previous_primal = Some(primal_objective);
            if stop {
                report.converged = true;
                break;
            }
        }

        for &v in variables {
            values[v as usize] = shared.get(v).primal(reg);
        }
        Ok((report, values))
    }
}

impl Reasoner for DualBcdReasoner {
    fn name(&self) -> &'static str {
        "dual-bcd"
    }

    fn optimize(&mut self, store: &mut dyn TermStore) -> HlmrfResult<OptimizationReport> {
        self.pool.install(|| self.run(store))
    }
}

impl std::fmt::Debug for DualBcdReasoner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualBcdReasoner")
            .field("config", &self.config)
            .finish()
    }
}
