//! The descent engine shared by shape and field optimizers. A target
//! abstracts where degrees of freedom live (vertex matrix columns or field
//! storage); the engine owns force assembly, the per-column Gram–Schmidt
//! against local constraints, global constraint projection, iterative
//! reprojection, and the three descent loops.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{DMatrix, DVector};
use ndarray::Array1;
use tracing::{info, warn};

use crate::errors::{MorphoError, MorphoResult};
use crate::functional::{evaluate, Functional};
use crate::linalg::solve_lu;
use crate::linalg::sparse::Sparse;
use crate::optimize::brent;
use crate::optimize::{DescentReport, OptimizerOptions, StopReason};
use crate::problem::{ConstraintTerm, EnergyTerm, OptimizationProblem};
use crate::selection::Selection;
use crate::EPS;

/// Where the optimized degrees of freedom live.
pub(crate) trait DescentTarget {
    fn label(&self) -> &'static str;

    /// Snapshot of the target as a flat vector.
    fn read(&self, p: &OptimizationProblem) -> MorphoResult<Array1<f64>>;

    fn write(&self, p: &mut OptimizationProblem, x: &Array1<f64>) -> MorphoResult<()>;

    fn energy_relevant(&self, term: &EnergyTerm) -> bool;

    fn constraint_relevant(&self, term: &ConstraintTerm) -> bool;

    /// A functional's gradient with respect to this target, flattened to the
    /// target's layout.
    fn gradient_flat(
        &self,
        p: &OptimizationProblem,
        f: &dyn Functional,
        sel: Option<&Selection>,
    ) -> MorphoResult<Array1<f64>>;

    /// Flat indices of the degrees of freedom tied to one element.
    fn group_indices(
        &self,
        p: &OptimizationProblem,
        grade: usize,
        el: usize,
    ) -> MorphoResult<Vec<usize>>;
}

/// One local constraint with its currently active element set and its
/// gradient over that set.
struct ActiveLocal {
    index: usize,
    grade: usize,
    elements: Vec<usize>,
    gradient: Array1<f64>,
}

pub(crate) struct Descent<'a, T: DescentTarget> {
    pub target: &'a T,
    pub opts: &'a OptimizerOptions,
    pub fixed: &'a BTreeSet<usize>,
}

impl<T: DescentTarget> Descent<'_, T> {
    fn zero_fixed(&self, v: &mut Array1<f64>) {
        for &i in self.fixed {
            if i < v.len() {
                v[i] = 0.0;
            }
        }
    }

    /// Σ prefactor · total over the energies this target can move.
    pub(crate) fn energy(&self, p: &OptimizationProblem) -> MorphoResult<f64> {
        let mut sum = 0.0;
        for term in p.energies() {
            if !self.target.energy_relevant(term) {
                continue;
            }
            sum += term.prefactor
                * evaluate::total(
                    term.functional.as_ref(),
                    p.mesh(),
                    p.fields(),
                    p.selection_of(term.selection)?,
                )?;
        }
        Ok(sum)
    }

    /// Raw force: Σ prefactor · gradient, with fixed entries zeroed.
    pub(crate) fn total_force(&self, p: &OptimizationProblem) -> MorphoResult<Array1<f64>> {
        let mut force = Array1::zeros(self.target.read(p)?.len());
        for term in p.energies() {
            if !self.target.energy_relevant(term) {
                continue;
            }
            let g = self.target.gradient_flat(
                p,
                term.functional.as_ref(),
                p.selection_of(term.selection)?,
            )?;
            force.scaled_add(term.prefactor, &g);
        }
        self.zero_fixed(&mut force);
        Ok(force)
    }

    /// Activates each local constraint: one-sided constraints act only on
    /// elements that dropped below their target.
    fn init_local_constraints(&self, p: &OptimizationProblem) -> MorphoResult<Vec<ActiveLocal>> {
        let mut out = Vec::new();
        for (index, term) in p.local_constraints().iter().enumerate() {
            if !self.target.constraint_relevant(term) {
                continue;
            }
            let f = term.functional.as_ref();
            let grade = f.grade(p.mesh());
            let sel = p.selection_of(term.selection)?;
            let candidates: Vec<usize> = match sel {
                Some(s) => s.ids(grade),
                None => (0..p.mesh().count(grade)).collect(),
            };
            let elements: Vec<usize> = if term.onesided {
                let row = evaluate::integrand(f, p.mesh(), p.fields(), sel)?;
                candidates
                    .into_iter()
                    .filter(|&el| row[el] < term.target + self.opts.ctol)
                    .collect()
            } else {
                candidates
            };
            if elements.is_empty() {
                continue;
            }
            let mut active = Selection::new();
            for &el in &elements {
                active.select(grade, el);
            }
            let mut gradient = self.target.gradient_flat(p, f, Some(&active))?;
            self.zero_fixed(&mut gradient);
            out.push(ActiveLocal { index, grade, elements, gradient });
        }
        Ok(out)
    }

    /// Per-column Gram–Schmidt of `v` against each active local-constraint
    /// direction.
    fn subtract_local_constraints(
        &self,
        p: &OptimizationProblem,
        v: &mut Array1<f64>,
        locals: &[ActiveLocal],
    ) -> MorphoResult<()> {
        for lc in locals {
            for &el in &lc.elements {
                let idx = self.target.group_indices(p, lc.grade, el)?;
                let gg: f64 = idx.iter().map(|&i| lc.gradient[i] * lc.gradient[i]).sum();
                if gg < self.opts.ctol {
                    continue;
                }
                let fg: f64 = idx.iter().map(|&i| v[i] * lc.gradient[i]).sum();
                let lambda = fg / gg;
                for &i in &idx {
                    v[i] -= lambda * lc.gradient[i];
                }
            }
        }
        Ok(())
    }

    /// Gradient of one global constraint with local projections removed.
    fn constraint_gradient(
        &self,
        p: &OptimizationProblem,
        term: &ConstraintTerm,
        locals: &[ActiveLocal],
    ) -> MorphoResult<Array1<f64>> {
        let mut g = self.target.gradient_flat(
            p,
            term.functional.as_ref(),
            p.selection_of(term.selection)?,
        )?;
        self.zero_fixed(&mut g);
        self.subtract_local_constraints(p, &mut g, locals)?;
        Ok(g)
    }

    /// Removes from `force` the component along each global constraint
    /// gradient. Projections are taken one constraint at a time, so only
    /// single-constraint setups are orthogonalized exactly.
    fn subtract_constraints(
        &self,
        p: &OptimizationProblem,
        force: &mut Array1<f64>,
        locals: &[ActiveLocal],
    ) -> MorphoResult<()> {
        for term in p.constraints() {
            if !self.target.constraint_relevant(term) {
                continue;
            }
            let g = self.constraint_gradient(p, term, locals)?;
            let gg = g.dot(&g);
            if gg < self.opts.ctol {
                continue;
            }
            let lambda = force.dot(&g) / gg;
            force.scaled_add(-lambda, &g);
        }
        Ok(())
    }

    /// The descent force after projecting out local and global constraints.
    pub(crate) fn force_with_constraints(&self, p: &OptimizationProblem) -> MorphoResult<Array1<f64>> {
        let mut force = self.total_force(p)?;
        let locals = self.init_local_constraints(p)?;
        self.subtract_local_constraints(p, &mut force, &locals)?;
        self.subtract_constraints(p, &mut force, &locals)?;
        Ok(force)
    }

    /// Newton reprojection of local constraints, element group by element
    /// group, until every active residual is below `ctol`.
    pub(crate) fn reproject_local_constraints(
        &self,
        p: &mut OptimizationProblem,
        report: bool,
    ) -> MorphoResult<()> {
        if p.local_constraints().is_empty() {
            return Ok(());
        }
        for _ in 0..self.opts.maxconstraintsteps {
            let locals = self.init_local_constraints(p)?;
            if locals.is_empty() {
                return Ok(());
            }

            // Residual per active constraint and element.
            let mut residuals: Vec<Vec<f64>> = Vec::with_capacity(locals.len());
            for lc in &locals {
                let term = &p.local_constraints()[lc.index];
                let row = evaluate::integrand(
                    term.functional.as_ref(),
                    p.mesh(),
                    p.fields(),
                    p.selection_of(term.selection)?,
                )?;
                residuals.push(lc.elements.iter().map(|&el| term.target - row[el]).collect());
            }

            let mut worst: f64 = 0.0;
            for r in residuals.iter().flatten() {
                worst = worst.max(r.abs());
            }
            if worst < self.opts.ctol {
                return Ok(());
            }

            // Group constraints acting on the same element so their updates
            // go through one small Gram solve.
            let mut groups: BTreeMap<(usize, usize), Vec<(usize, f64)>> = BTreeMap::new();
            for (k, lc) in locals.iter().enumerate() {
                for (j, &el) in lc.elements.iter().enumerate() {
                    groups.entry((lc.grade, el)).or_default().push((k, residuals[k][j]));
                }
            }

            let mut x = self.target.read(p)?;
            for ((grade, el), members) in groups {
                let idx = self.target.group_indices(p, grade, el)?;
                let n = members.len();
                let mut gram = DMatrix::zeros(n, n);
                let mut rhs = DVector::zeros(n);
                for (a, &(ka, r)) in members.iter().enumerate() {
                    rhs[a] = r;
                    for (b, &(kb, _)) in members.iter().enumerate() {
                        gram[(a, b)] = idx
                            .iter()
                            .map(|&i| locals[ka].gradient[i] * locals[kb].gradient[i])
                            .sum();
                    }
                }
                if (0..n).any(|a| gram[(a, a)] < self.opts.ctol) {
                    continue;
                }
                let coeffs = match solve_lu(gram, rhs, "local constraint reprojection") {
                    Ok(c) => c,
                    Err(err) => {
                        if report {
                            warn!(target: "morpho::optimize", element = el, "{err}");
                        }
                        continue;
                    }
                };
                for (a, &(ka, _)) in members.iter().enumerate() {
                    for &i in &idx {
                        x[i] += coeffs[a] * locals[ka].gradient[i];
                    }
                }
            }
            self.target.write(p, &x)?;
        }
        if report {
            warn!(
                target: "morpho::optimize",
                steps = self.opts.maxconstraintsteps,
                "local constraint reprojection hit its iteration cap"
            );
        }
        Ok(())
    }

    /// Newton reprojection of global constraints through the constraint
    /// Gram matrix, until residuals are below `ctol`.
    pub(crate) fn reproject_constraints(
        &self,
        p: &mut OptimizationProblem,
        report: bool,
    ) -> MorphoResult<()> {
        let relevant: Vec<usize> = p
            .constraints()
            .iter()
            .enumerate()
            .filter(|(_, t)| self.target.constraint_relevant(t))
            .map(|(i, _)| i)
            .collect();
        if relevant.is_empty() {
            return Ok(());
        }
        for _ in 0..self.opts.maxconstraintsteps {
            let mut residuals = DVector::zeros(relevant.len());
            for (k, &i) in relevant.iter().enumerate() {
                let term = &p.constraints()[i];
                let value = evaluate::total(
                    term.functional.as_ref(),
                    p.mesh(),
                    p.fields(),
                    p.selection_of(term.selection)?,
                )?;
                residuals[k] = term.target - value;
            }
            if residuals.amax() < self.opts.ctol {
                return Ok(());
            }

            let locals = self.init_local_constraints(p)?;
            let gradients: Vec<Array1<f64>> = relevant
                .iter()
                .map(|&i| self.constraint_gradient(p, &p.constraints()[i], &locals))
                .collect::<MorphoResult<_>>()?;

            let n = relevant.len();
            let mut gram = Sparse::new(n, n);
            for (a, ga) in gradients.iter().enumerate() {
                for (b, gb) in gradients.iter().enumerate() {
                    gram.set(a, b, ga.dot(gb));
                }
            }
            let coeffs = match gram.solve(&residuals) {
                Ok(c) => c,
                Err(err) => {
                    if report {
                        warn!(target: "morpho::optimize", "{err}");
                    }
                    return Ok(());
                }
            };

            let mut x = self.target.read(p)?;
            for (k, g) in gradients.iter().enumerate() {
                x.scaled_add(coeffs[k], g);
            }
            self.target.write(p, &x)?;
        }
        if report {
            warn!(
                target: "morpho::optimize",
                steps = self.opts.maxconstraintsteps,
                "constraint reprojection hit its iteration cap; residual left as-is"
            );
        }
        Ok(())
    }

    /// Moves to `x0 + s·dir`, reprojects, and reports the energy there.
    fn trial_energy(
        &self,
        p: &mut OptimizationProblem,
        x0: &Array1<f64>,
        dir: &Array1<f64>,
        s: f64,
    ) -> MorphoResult<f64> {
        let x = x0 + &(dir * s);
        self.target.write(p, &x)?;
        self.reproject_local_constraints(p, false)?;
        self.reproject_constraints(p, false)?;
        self.energy(p)
    }

    fn converged(&self, e: f64, prev: f64) -> bool {
        (e - prev).abs() < self.opts.etol * e.abs() || e.abs() < self.opts.etol
    }

    fn log_step(&self, iteration: usize, energy: f64, delta: f64, step: f64) {
        if !self.opts.quiet {
            info!(
                target: "morpho::optimize",
                kind = self.target.label(),
                iteration,
                energy,
                delta,
                step,
                "descent step"
            );
        }
    }

    /// Fixed-step gradient descent.
    pub(crate) fn relax(
        &self,
        p: &mut OptimizationProblem,
        n: usize,
        history: &mut Vec<f64>,
    ) -> MorphoResult<DescentReport> {
        let mut prev = self.energy(p)?;
        let mut report = DescentReport { iterations: 0, energy: prev, reason: StopReason::IterationLimit };
        for iter in 0..n {
            let force = self.force_with_constraints(p)?;
            if force.dot(&force) < EPS {
                report.reason = StopReason::ZeroForce;
                break;
            }
            let mut x = self.target.read(p)?;
            x.scaled_add(-self.opts.stepsize, &force);
            self.target.write(p, &x)?;
            self.reproject_local_constraints(p, true)?;
            self.reproject_constraints(p, true)?;

            let e = self.energy(p)?;
            history.push(e);
            self.log_step(iter, e, e - prev, self.opts.stepsize);
            report.iterations = iter + 1;
            report.energy = e;
            if self.converged(e, prev) {
                report.reason = StopReason::Converged;
                break;
            }
            prev = e;
        }
        Ok(report)
    }

    /// Gradient descent with bracketed line search and Brent minimization
    /// along the projected force.
    pub(crate) fn linesearch(
        &self,
        p: &mut OptimizationProblem,
        n: usize,
        history: &mut Vec<f64>,
    ) -> MorphoResult<DescentReport> {
        let mut prev = self.energy(p)?;
        let mut step = self.opts.stepsize;
        let mut report = DescentReport { iterations: 0, energy: prev, reason: StopReason::IterationLimit };
        for iter in 0..n {
            let force = self.force_with_constraints(p)?;
            if force.dot(&force) < EPS {
                report.reason = StopReason::ZeroForce;
                break;
            }
            let dir = force.mapv(|v| -v);
            let x0 = self.target.read(p)?;

            let s = match self.minimize_along(p, &x0, &dir, step) {
                Ok(s) => s,
                Err(MorphoError::Bracketing(_)) => {
                    self.target.write(p, &x0)?;
                    self.reproject_local_constraints(p, true)?;
                    self.reproject_constraints(p, true)?;
                    report.reason = StopReason::BracketFailed;
                    break;
                }
                Err(err) => return Err(err),
            };

            let x = &x0 + &(&dir * s);
            self.target.write(p, &x)?;
            self.reproject_local_constraints(p, true)?;
            self.reproject_constraints(p, true)?;

            let e = self.energy(p)?;
            history.push(e);
            self.log_step(iter, e, e - prev, s);
            report.iterations = iter + 1;
            report.energy = e;
            if self.converged(e, prev) {
                report.reason = StopReason::Converged;
                break;
            }
            prev = e;
            if s > EPS {
                step = s;
            }
        }
        Ok(report)
    }

    /// Hager–Zhang nonlinear conjugate gradient with the same line search.
    pub(crate) fn conjugate_gradient(
        &self,
        p: &mut OptimizationProblem,
        n: usize,
        history: &mut Vec<f64>,
    ) -> MorphoResult<DescentReport> {
        let mut prev = self.energy(p)?;
        let mut step = self.opts.stepsize;
        let mut memory: Option<(Array1<f64>, Array1<f64>)> = None;
        let mut report = DescentReport { iterations: 0, energy: prev, reason: StopReason::IterationLimit };
        for iter in 0..n {
            let force = self.force_with_constraints(p)?;
            if force.dot(&force) < EPS {
                report.reason = StopReason::ZeroForce;
                break;
            }
            let dir = match &memory {
                None => force.mapv(|v| -v),
                Some((f_prev, d_prev)) => {
                    let y = f_prev - &force;
                    let dy = d_prev.dot(&y);
                    if dy.abs() < EPS {
                        force.mapv(|v| -v)
                    } else {
                        let yy = y.dot(&y);
                        let probe = &y - &(d_prev * (2.0 * yy / dy));
                        let beta = probe.dot(&force) / dy;
                        let mut d = force.mapv(|v| -v);
                        d.scaled_add(beta, d_prev);
                        d
                    }
                }
            };
            let x0 = self.target.read(p)?;

            let s = match self.minimize_along(p, &x0, &dir, step) {
                Ok(s) => s,
                Err(MorphoError::Bracketing(_)) => {
                    self.target.write(p, &x0)?;
                    self.reproject_local_constraints(p, true)?;
                    self.reproject_constraints(p, true)?;
                    report.reason = StopReason::BracketFailed;
                    break;
                }
                Err(err) => return Err(err),
            };

            let x = &x0 + &(&dir * s);
            self.target.write(p, &x)?;
            self.reproject_local_constraints(p, true)?;
            self.reproject_constraints(p, true)?;
            memory = Some((force, dir));

            let e = self.energy(p)?;
            history.push(e);
            self.log_step(iter, e, e - prev, s);
            report.iterations = iter + 1;
            report.energy = e;
            if self.converged(e, prev) {
                report.reason = StopReason::Converged;
                break;
            }
            prev = e;
            if s > EPS {
                step = s;
            }
        }
        Ok(report)
    }

    /// Bracket then Brent along `dir`, clamped to the step limit.
    fn minimize_along(
        &self,
        p: &mut OptimizationProblem,
        x0: &Array1<f64>,
        dir: &Array1<f64>,
        step: f64,
    ) -> MorphoResult<f64> {
        let mut trial = |s: f64| self.trial_energy(p, x0, dir, s);
        let br = brent::bracket(&mut trial, step, self.opts.bracket_max)?;
        let (s, _) = brent::brent(&mut trial, &br, self.opts.linmintol, self.opts.linminmax)?;
        Ok(s.clamp(0.0, self.opts.steplimit))
    }
}
