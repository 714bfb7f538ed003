//! Consensus ADMM.
//!
//! Each term keeps a local copy `x` of its atoms and an unscaled dual `y` in
//! its scratch; each random variable keeps a consensus value `z`. One
//! iteration is three data-parallel phases separated by barriers:
//!
//! 1. term update: `x ← argmin f(x) + ρ/2 ‖x − z + y/ρ‖²`, closed form per
//!    term shape, while adding `x + y/ρ` into per-atom sums;
//! 2. consensus: `z ← clamp(sum / count)`;
//! 3. dual update: `y ← y + ρ(x − z)`.
//!
//! Pages are visited in turn within each phase, so the same loop runs over
//! in-memory and paged stores.

use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::HlmrfResult;
use crate::model::Comparator;
use crate::model::atom::clamp_value;
use crate::reasoner::{
    AtomicSums, OptimizationReport, Reasoner, build_pool, compute_objective, invalid_config,
};
use crate::term::{CursorMode, ScratchKind, Shape, Term, TermKind, TermStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmmConfig {
    pub max_iterations: usize,
    /// ρ. Larger values take smaller steps away from consensus.
    pub step_size: f32,
    pub epsilon_abs: f32,
    pub epsilon_rel: f32,
    /// Residuals are checked every this many iterations.
    pub compute_period: usize,
    /// Worker threads; 0 uses every available core.
    pub num_threads: usize,
}

impl Default for AdmmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25_000,
            step_size: 1.0,
            epsilon_abs: 1e-5,
            epsilon_rel: 1e-3,
            compute_period: 50,
            num_threads: 0,
        }
    }
}

impl AdmmConfig {
    pub fn validate(&self) -> HlmrfResult<()> {
        if self.max_iterations == 0 {
            return Err(invalid_config("admm.max_iterations must be positive"));
        }
        if !(self.step_size > 0.0) {
            return Err(invalid_config("admm.step_size must be positive"));
        }
        if !(self.epsilon_abs > 0.0) {
            return Err(invalid_config("admm.epsilon_abs must be positive"));
        }
        if !(self.epsilon_rel > 0.0) {
            return Err(invalid_config("admm.epsilon_rel must be positive"));
        }
        if self.compute_period == 0 {
            return Err(invalid_config("admm.compute_period must be positive"));
        }
        Ok(())
    }
}

pub struct AdmmReasoner {
    config: AdmmConfig,
    pool: rayon::ThreadPool,
}

/// Sums gathered during the dual update.
#[derive(Debug, Clone, Copy, Default)]
struct Residuals {
    primal: f64,
    x_norm: f64,
    y_norm: f64,
    lagrangian: f64,
    augmented: f64,
}

impl std::ops::Add for Residuals {
    type Output = Self;

    fn add(self, o: Self) -> Self {
        Self {
            primal: self.primal + o.primal,
            x_norm: self.x_norm + o.x_norm,
            y_norm: self.y_norm + o.y_norm,
            lagrangian: self.lagrangian + o.lagrangian,
            augmented: self.augmented + o.augmented,
        }
    }
}

impl AdmmReasoner {
    pub fn new(config: AdmmConfig) -> HlmrfResult<Self> {
        config.validate()?;
        let pool = build_pool(config.num_threads)?;
        Ok(Self { config, pool })
    }

    pub fn config(&self) -> &AdmmConfig {
        &self.config
    }

    fn run(&self, store: &mut dyn TermStore) -> HlmrfResult<OptimizationReport> {
        store.refresh()?;
        let atoms = Arc::clone(store.atoms());
        let warm = !store.prepare_scratch(ScratchKind::Admm)?;
        let step = self.config.step_size;

        let mut z = atoms.values();
        let mut counts = vec![0u32; z.len()];
        let mut local_variables = 0usize;
        store.for_each_term(&mut |_, term| {
            for &atom in &term.atoms {
                counts[atom as usize] += 1;
            }
            local_variables += term.size();
        })?;
        tracing::debug!(
            terms = store.len(),
            atoms = z.len(),
            local_variables,
            warm,
            "admm start"
        );

        let mut report = OptimizationReport::default();
        if local_variables == 0 {
            report.converged = true;
            return self.finish(store, &z, report);
        }

        let sums = AtomicSums::new(z.len());
        let epsilon_abs_term = (local_variables as f64).sqrt() * f64::from(self.config.epsilon_abs);
        let epsilon_rel = f64::from(self.config.epsilon_rel);

        for iteration in 1..=self.config.max_iterations {
            report.iterations = iteration;

            sums.reset();
            {
                let consensus = &z;
                let sums = &sums;
                store.visit_pages(CursorMode::ReadWrite, &mut |page| {
                    page.slots().into_par_iter().for_each(|slot| {
                        let (x, y) = slot.scratch.split_at_mut(slot.term.size());
                        minimize(slot.term, consensus, x, y, step);
                        for (i, &atom) in slot.term.atoms.iter().enumerate() {
                            sums.add(atom as usize, f64::from(x[i] + y[i] / step));
                        }
                    });
                    Ok(())
                })?;
            }

            let (dual_sq, z_norm) = z
                .par_iter_mut()
                .enumerate()
                .filter(|(i, _)| counts[*i] > 0)
                .map(|(i, value)| {
                    let count = f64::from(counts[i]);
                    let new = clamp_value((sums.get(i) / count) as f32);
                    let diff = f64::from(*value - new);
                    *value = new;
                    (diff * diff * count, f64::from(new) * f64::from(new) * count)
                })
                .reduce(|| (0.0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1));

            let mut residuals = Residuals::default();
            {
                let consensus = &z;
                store.visit_pages(CursorMode::ReadWrite, &mut |page| {
                    residuals = residuals
                        + page
                            .slots()
                            .into_par_iter()
                            .map(|slot| update_dual(slot.term, consensus, slot.scratch, step))
                            .reduce(Residuals::default, |a, b| a + b);
                    Ok(())
                })?;
            }

            report.primal_residual = residuals.primal.sqrt();
            report.dual_residual = f64::from(step) * dual_sq.sqrt();
            report.epsilon_primal =
                epsilon_abs_term + epsilon_rel * residuals.x_norm.sqrt().max(z_norm.sqrt());
            report.epsilon_dual = epsilon_abs_term + epsilon_rel * residuals.y_norm.sqrt();
            report.lagrangian_penalty = residuals.lagrangian;
            report.augmented_lagrangian_penalty = residuals.augmented;

            if iteration % self.config.compute_period == 0 {
                tracing::trace!(
                    iteration,
                    primal = report.primal_residual,
                    dual = report.dual_residual,
                    epsilon_primal = report.epsilon_primal,
                    epsilon_dual = report.epsilon_dual,
                    "admm residuals"
                );
                if report.primal_residual <= report.epsilon_primal
                    && report.dual_residual <= report.epsilon_dual
                {
                    report.converged = true;
                    break;
                }
            }
        }

        self.finish(store, &z, report)
    }

    fn finish(
        &self,
        store: &mut dyn TermStore,
        z: &[f32],
        mut report: OptimizationReport,
    ) -> HlmrfResult<OptimizationReport> {
        report.movement = store.atoms().write_back(z);
        let objective = compute_objective(store, z)?;
        report.objective = objective.objective;
        report.violated_constraints = objective.violated_constraints;
        if report.converged {
            tracing::info!(
                iterations = report.iterations,
                objective = report.objective,
                primal = report.primal_residual,
                dual = report.dual_residual,
                "admm converged"
            );
        } else {
            tracing::warn!(
                iterations = report.iterations,
                objective = report.objective,
                primal = report.primal_residual,
                dual = report.dual_residual,
                "admm hit the iteration cap without converging"
            );
        }
        Ok(report)
    }
}

impl Reasoner for AdmmReasoner {
    fn name(&self) -> &'static str {
        "admm"
    }

    fn optimize(&mut self, store: &mut dyn TermStore) -> HlmrfResult<OptimizationReport> {
        self.pool.install(|| self.run(store))
    }
}

impl std::fmt::Debug for AdmmReasoner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmmReasoner")
            .field("config", &self.config)
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

/// Dual step for one term. Returns its share of the residual sums.
fn update_dual(term: &Term, consensus: &[f32], scratch: &mut [f32], step: f32) -> Residuals {
    let (x, y) = scratch.split_at_mut(term.size());
    let mut out = Residuals::default();
    for (i, &atom) in term.atoms.iter().enumerate() {
        let diff = x[i] - consensus[atom as usize];
        out.lagrangian += f64::from(y[i] * diff);
        out.augmented += 0.5 * f64::from(step * diff * diff);
        y[i] += step * diff;
        out.primal += f64::from(diff * diff);
        out.x_norm += f64::from(x[i] * x[i]);
        out.y_norm += f64::from(y[i] * y[i]);
    }
    out
}

/// Solve the term's proximal problem around `v = z − y/ρ`, writing `x`.
pub fn minimize(term: &Term, consensus: &[f32], x: &mut [f32], y: &[f32], step: f32) {
    for (i, &atom) in term.atoms.iter().enumerate() {
        x[i] = consensus[atom as usize] - y[i] / step;
    }
    let coefficients = &term.coefficients;
    let norm = coefficients.iter().map(|c| c * c).sum::<f32>();
    if norm == 0.0 {
        return;
    }

    match term.kind {
        TermKind::Constraint { comparator } => {
            let value = term.dot_local(x);
            let project = match comparator {
                Comparator::Eq => true,
                Comparator::Lte => value > term.constant,
                Comparator::Gte => value < term.constant,
            };
            if project {
                project_onto_hyperplane(x, coefficients, norm, value - term.constant);
            }
        }
        TermKind::Potential { weight, shape } => match shape {
            Shape::Linear => {
                for (xi, c) in x.iter_mut().zip(coefficients) {
                    *xi -= weight / step * c;
                }
            }
            Shape::Hinge => {
                let value = term.dot_local(x);
                if value <= term.constant {
                    return;
                }
                // Try the linear side of the hinge first.
                let shift = weight / step;
                let linear = value - shift * norm;
                if linear >= term.constant {
                    for (xi, c) in x.iter_mut().zip(coefficients) {
                        *xi -= shift * c;
                    }
                } else {
                    project_onto_hyperplane(x, coefficients, norm, value - term.constant);
                }
            }
            Shape::SquaredLinear => squared_step(term, x, weight, step, norm),
            Shape::SquaredHinge => {
                if term.dot_local(x) > term.constant {
                    squared_step(term, x, weight, step, norm);
                }
            }
        },
    }
}

fn project_onto_hyperplane(x: &mut [f32], coefficients: &[f32], norm: f32, excess: f32) {
    let scale = excess / norm;
    for (xi, c) in x.iter_mut().zip(coefficients) {
        *xi -= scale * c;
    }
}

/// Minimizer of `w(c·x − k)² + ρ/2 ‖x − v‖²` with `x` holding `v`.
fn squared_step(term: &Term, x: &mut [f32], weight: f32, step: f32, norm: f32) {
    let a = 2.0 * weight / step;
    let value = term.dot_local(x);
    let target = (value + a * term.constant * norm) / (1.0 + a * norm);
    let shift = a * (target - term.constant);
    for (xi, c) in x.iter_mut().zip(&term.coefficients) {
        *xi -= shift * c;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::AtomStore;
    use crate::model::{AtomKind, GroundAtom, PredicateId, RuleId};
    use crate::term::memory::MemoryTermStore;

    fn term(coefficients: &[f32], constant: f32, kind: TermKind) -> Term {
        Term::new(
            RuleId::new(0),
            (0..coefficients.len() as u32).collect(),
            coefficients.to_vec(),
            constant,
            kind,
        )
    }

    fn potential(shape: Shape, weight: f32) -> TermKind {
        TermKind::Potential { weight, shape }
    }

    fn constraint(comparator: Comparator) -> TermKind {
        TermKind::Constraint { comparator }
    }

    fn check(term: &Term, z: &[f32], y: &[f32], step: f32, expected: &[f32]) {
        let mut x = vec![0.0; z.len()];
        minimize(term, z, &mut x, y, step);
        for (got, want) in x.iter().zip(expected) {
            assert!((got - want).abs() < 5e-5, "got {x:?}, expected {expected:?}");
        }
    }

    #[test]
    fn satisfied_constraint_keeps_the_consensus() {
        let t = term(&[1.0, 1.0], 1.0, constraint(Comparator::Lte));
        check(&t, &[0.2, 0.5], &[0.0, 0.0], 1.0, &[0.2, 0.5]);
    }

    #[test]
    fn violated_constraint_is_projected() {
        let t = term(&[1.0, 1.0], 1.0, constraint(Comparator::Lte));
        check(&t, &[0.7, 0.5], &[0.0, 0.0], 1.0, &[0.6, 0.4]);
    }

    #[test]
    fn equality_constraint_is_always_projected() {
        let t = term(&[1.0, -1.0], 0.0, constraint(Comparator::Eq));
        check(&t, &[0.7, 0.5], &[0.0, 0.0], 1.0, &[0.6, 0.6]);
    }

    #[test]
    fn linear_potential_steps_against_its_gradient() {
        let t = term(&[0.3, -1.0], 0.0, potential(Shape::Linear, 1.0));
        check(&t, &[0.4, 0.5], &[0.0, 0.0], 1.0, &[0.1, 1.5]);
    }

    #[test]
    fn hinge_cases() {
        let t = term(&[1.0, -1.0], -0.95, potential(Shape::Hinge, 1.0));
        check(&t, &[0.2, 0.5], &[0.0, 0.0], 1.0, &[-0.125, 0.825]);

        let z = [0.3, 0.5, 0.1];
        let y = [0.1, 0.0, -0.05];
        let t = term(&[1.0, -0.5, 0.4], -0.15, potential(Shape::Hinge, 1.0));
        check(&t, &z, &y, 0.5, &[0.043257, 0.528361, 0.177309]);
        let t = term(&[1.0, -0.5, 0.4], 0.0, potential(Shape::Hinge, 2.0));
        check(&t, &z, &y, 0.5, &[0.1, 0.5, 0.2]);

        let t = term(&[1.0], 0.0, potential(Shape::Hinge, 2.0));
        check(&t, &[0.1], &[0.15], 1.0, &[-0.05]);

        let t = term(&[1.0, -1.0], 0.0, potential(Shape::Hinge, 1.0));
        check(&t, &[0.7, 0.5], &[0.0, 0.0], 1.0, &[0.6, 0.6]);

        let t = term(&[1.0, -1.0], -0.5, potential(Shape::Hinge, 2.0));
        check(&t, &[0.7, 0.5], &[0.05, 1.0], 2.0, &[0.0875, 0.5875]);
    }

    #[test]
    fn squared_linear_potential() {
        let t = term(&[0.3, -1.0, 0.4], -20.0, potential(Shape::SquaredLinear, 0.5));
        check(
            &t,
            &[0.4, 0.5, 0.1],
            &[0.0, 0.0, -0.05],
            2.0,
            &[-1.41569, 6.55231, -2.29593],
        );
    }

    #[test]
    fn squared_hinge_cases() {
        let t = term(&[1.0, -1.0], -0.95, potential(Shape::SquaredHinge, 1.0));
        check(&t, &[0.2, 0.5], &[0.0, 0.0], 1.0, &[-0.06, 0.76]);

        let z = [0.3, 0.5, 0.1];
        let y = [0.1, 0.0, -0.05];
        let t = term(&[1.0, -0.5, 0.4], -0.15, potential(Shape::SquaredHinge, 1.0));
        check(&t, &z, &y, 0.5, &[0.051798, 0.524096, 0.180720]);
        let t = term(&[1.0, -0.5, 0.4], 0.0, potential(Shape::SquaredHinge, 2.0));
        check(&t, &z, &y, 0.5, &[0.1, 0.5, 0.2]);

        let t = term(&[1.0], 0.0, potential(Shape::SquaredHinge, 2.0));
        check(&t, &[0.1], &[-0.15], 1.0, &[0.05]);

        let t = term(&[1.0, -1.0], 0.0, potential(Shape::SquaredHinge, 1.0));
        check(&t, &[0.7, 0.5], &[0.0, 0.0], 1.0, &[0.62, 0.58]);

        let t = term(&[1.0, -1.0, 0.5], -0.5, potential(Shape::SquaredHinge, 2.0));
        check(&t, &[3.7, -0.5, 0.5], &[0.0, 0.0, 0.0], 2.0, &[1.9, 1.3, -0.4]);
    }

    fn rv_store(count: usize) -> MemoryTermStore {
        let atoms = Arc::new(AtomStore::new());
        for i in 0..count {
            atoms.intern(
                &GroundAtom::new(PredicateId::from_index(0), vec![format!("a{i}").into()]),
                AtomKind::RandomVariable,
                0.0,
            );
        }
        MemoryTermStore::new(atoms)
    }

    fn reasoner() -> AdmmReasoner {
        AdmmReasoner::new(AdmmConfig {
            num_threads: 2,
            compute_period: 1,
            ..AdmmConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn equality_constraints_are_satisfied() {
        let mut store = rv_store(2);
        // x0 + x1 = 1 and x0 − x1 = 0.5 pin x = (0.75, 0.25).
        store
            .add(Term::new(RuleId::new(0), vec![0, 1], vec![1.0, 1.0], 1.0, constraint(Comparator::Eq)))
            .unwrap();
        store
            .add(Term::new(RuleId::new(1), vec![0, 1], vec![1.0, -1.0], 0.5, constraint(Comparator::Eq)))
            .unwrap();
        let report = reasoner().optimize(&mut store).unwrap();
        assert!(report.converged, "{report:?}");
        assert_eq!(report.violated_constraints, 0);
        let values = store.atoms().values();
        assert!((values[0] - 0.75).abs() < 1e-3, "{values:?}");
        assert!((values[1] - 0.25).abs() < 1e-3, "{values:?}");
    }

    #[test]
    fn competing_potentials_settle_between() {
        let mut store = rv_store(1);
        // 1·max(0, 1 − x)² pulls up, 1·max(0, x)² pulls down: optimum 0.5.
        store
            .add(Term::new(RuleId::new(0), vec![0], vec![-1.0], -1.0, potential(Shape::SquaredHinge, 1.0)))
            .unwrap();
        store
            .add(Term::new(RuleId::new(1), vec![0], vec![1.0], 0.0, potential(Shape::SquaredHinge, 1.0)))
            .unwrap();
        let report = reasoner().optimize(&mut store).unwrap();
        assert!(report.converged);
        let value = store.atoms().get_value(0);
        assert!((value - 0.5).abs() < 1e-3, "{value}");
        assert!((report.objective - 0.5).abs() < 1e-3);
        assert!(report.movement > 0.0);
    }

    /// x0 + x1 + x2 <= 1 against a unit-target hinge on each variable.
    fn budget_store() -> MemoryTermStore {
        let mut store = rv_store(3);
        store
            .add(Term::new(
                RuleId::new(0),
                vec![0, 1, 2],
                vec![1.0, 1.0, 1.0],
                1.0,
                constraint(Comparator::Lte),
            ))
            .unwrap();
        for i in 0..3 {
            store
                .add(Term::new(RuleId::new(1), vec![i], vec![-1.0], -1.0, potential(Shape::Hinge, 1.0)))
                .unwrap();
        }
        store
    }

    #[test]
    fn residuals_never_increase_across_iterations() {
        let mut previous = f64::INFINITY;
        let mut last = OptimizationReport::default();
        for k in 1..=60 {
            let mut store = budget_store();
            let mut reasoner = AdmmReasoner::new(AdmmConfig {
                max_iterations: k,
                compute_period: 1,
                num_threads: 1,
                ..AdmmConfig::default()
            })
            .unwrap();
            let report = reasoner.optimize(&mut store).unwrap();
            let residual = report.primal_residual + report.dual_residual;
            assert!(
                residual <= previous + 1e-6,
                "residual rose from {previous} to {residual} at {k} iterations"
            );
            previous = residual;
            last = report;
        }
        assert!(last.converged, "{last:?}");
        assert_eq!(last.violated_constraints, 0);
        let mut store = budget_store();
        reasoner().optimize(&mut store).unwrap();
        let total: f32 = store.atoms().values().iter().sum();
        assert!((total - 1.0).abs() < 1e-3, "{total}");
    }

    #[test]
    fn warm_start_converges_immediately() {
        let mut store = rv_store(1);
        store
            .add(Term::new(RuleId::new(0), vec![0], vec![-1.0], -1.0, potential(Shape::Hinge, 1.0)))
            .unwrap();
        let mut reasoner = reasoner();
        let first = reasoner.optimize(&mut store).unwrap();
        let second = reasoner.optimize(&mut store).unwrap();
        assert!(second.iterations <= first.iterations);
        assert!((store.atoms().get_value(0) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn empty_store_is_trivially_converged() {
        let mut store = rv_store(0);
        let report = reasoner().optimize(&mut store).unwrap();
        assert!(report.converged);
        assert_eq!(report.iterations, 0);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        for config in [
            AdmmConfig { step_size: 0.0, ..AdmmConfig::default() },
            AdmmConfig { epsilon_abs: -1.0, ..AdmmConfig::default() },
            AdmmConfig { compute_period: 0, ..AdmmConfig::default() },
            AdmmConfig { max_iterations: 0, ..AdmmConfig::default() },
        ] {
            assert!(AdmmReasoner::new(config).is_err());
        }
    }
}
