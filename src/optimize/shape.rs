//! Optimization of vertex positions.

use std::collections::BTreeSet;

use ndarray::{Array1, Array2};

use crate::errors::{MorphoError, MorphoResult};
use crate::functional::{evaluate, Functional};
use crate::linalg::{flatten_columns, unflatten_columns};
use crate::optimize::engine::{Descent, DescentTarget};
use crate::optimize::{DescentReport, OptimizerOptions};
use crate::problem::{ConstraintTerm, EnergyTerm, OptimizationProblem};
use crate::selection::Selection;

struct ShapeTarget;

impl DescentTarget for ShapeTarget {
    fn label(&self) -> &'static str {
        "shape"
    }

    fn read(&self, p: &OptimizationProblem) -> MorphoResult<Array1<f64>> {
        Ok(Array1::from_vec(p.mesh().positions().to_vec()))
    }

    fn write(&self, p: &mut OptimizationProblem, x: &Array1<f64>) -> MorphoResult<()> {
        p.mesh_mut().set_positions(x.as_slice().expect("flat target vector is contiguous"))
    }

    fn energy_relevant(&self, _term: &EnergyTerm) -> bool {
        true
    }

    fn constraint_relevant(&self, term: &ConstraintTerm) -> bool {
        term.field.is_none()
    }

    fn gradient_flat(
        &self,
        p: &OptimizationProblem,
        f: &dyn Functional,
        sel: Option<&Selection>,
    ) -> MorphoResult<Array1<f64>> {
        let g = evaluate::gradient(f, p.mesh(), p.fields(), sel)?;
        Ok(flatten_columns(&g))
    }

    fn group_indices(
        &self,
        p: &OptimizationProblem,
        grade: usize,
        el: usize,
    ) -> MorphoResult<Vec<usize>> {
        if grade != 0 {
            return Err(MorphoError::Unsupported(
                "local constraints on shapes act per vertex",
            ));
        }
        let dim = p.mesh().dim();
        Ok((el * dim..(el + 1) * dim).collect())
    }
}

/// Constraint-projected descent on the vertex matrix of the problem's mesh.
pub struct ShapeOptimizer {
    pub opts: OptimizerOptions,
    fixed: BTreeSet<usize>,
    history: Vec<f64>,
}

impl Default for ShapeOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ShapeOptimizer {
    pub fn new() -> Self {
        Self::with_options(OptimizerOptions::default())
    }

    pub fn with_options(opts: OptimizerOptions) -> Self {
        Self { opts, fixed: BTreeSet::new(), history: Vec::new() }
    }

    /// Pins the selected vertices: their force entries are zeroed before
    /// every step.
    pub fn fix_selection(&mut self, p: &OptimizationProblem, sel: &Selection) {
        let ids = sel.ids(0);
        self.fix_vertices(p, &ids);
    }

    pub fn fix_vertices(&mut self, p: &OptimizationProblem, ids: &[usize]) {
        let dim = p.mesh().dim();
        for &v in ids {
            self.fixed.extend(v * dim..(v + 1) * dim);
        }
    }

    pub fn clear_fixed(&mut self) {
        self.fixed.clear();
    }

    /// Energy per recorded iteration, oldest first.
    pub fn energy_history(&self) -> &[f64] {
        &self.history
    }

    fn engine<'a>(&'a self) -> Descent<'a, ShapeTarget> {
        Descent { target: &ShapeTarget, opts: &self.opts, fixed: &self.fixed }
    }

    /// The projected force as a D×N matrix, for inspection.
    pub fn force(&self, p: &OptimizationProblem) -> MorphoResult<Array2<f64>> {
        let flat = self.engine().force_with_constraints(p)?;
        Ok(unflatten_columns(&flat.view(), p.mesh().dim()))
    }

    /// Restores constraint satisfaction without descending.
    pub fn reproject(&self, p: &mut OptimizationProblem) -> MorphoResult<()> {
        let engine = self.engine();
        engine.reproject_local_constraints(p, true)?;
        engine.reproject_constraints(p, true)
    }

    pub fn relax(&mut self, p: &mut OptimizationProblem, n: usize) -> MorphoResult<DescentReport> {
        let engine = Descent { target: &ShapeTarget, opts: &self.opts, fixed: &self.fixed };
        engine.relax(p, n, &mut self.history)
    }

    pub fn linesearch(&mut self, p: &mut OptimizationProblem, n: usize) -> MorphoResult<DescentReport> {
        let engine = Descent { target: &ShapeTarget, opts: &self.opts, fixed: &self.fixed };
        engine.linesearch(p, n, &mut self.history)
    }

    pub fn conjugate_gradient(
        &mut self,
        p: &mut OptimizationProblem,
        n: usize,
    ) -> MorphoResult<DescentReport> {
        let engine = Descent { target: &ShapeTarget, opts: &self.opts, fixed: &self.fixed };
        engine.conjugate_gradient(p, n, &mut self.history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functional::fields::EquiElement;
    use crate::functional::geometry::Length;
    use crate::mesh::Mesh;

    #[test]
    fn relax_equalizes_segment_lengths() {
        let mut mesh =
            Mesh::from_positions(3, &[0.0, 0.0, 0.0, 0.3, 0.0, 0.0, 1.0, 0.0, 0.0]).unwrap();
        mesh.add_element(1, &[0, 1]).unwrap();
        mesh.add_element(1, &[1, 2]).unwrap();
        let mut problem = OptimizationProblem::new(mesh);
        problem.add_energy(EquiElement::new());

        let mut opt = ShapeOptimizer::new();
        opt.opts.quiet = true;
        opt.fix_vertices(&problem, &[0, 2]);
        opt.relax(&mut problem, 20).unwrap();

        assert!(problem.total_energy().unwrap() < 1e-8);
        let mid = problem.mesh().vertex(1);
        assert!((mid[0] - 0.5).abs() < 1e-4);
    }

    #[test]
    fn fixed_vertices_do_not_move() {
        let mut mesh = Mesh::from_positions(3, &[0.0, 0.0, 0.0, 1.0, 0.0, 0.0]).unwrap();
        mesh.add_element(1, &[0, 1]).unwrap();
        let mut problem = OptimizationProblem::new(mesh);
        problem.add_energy(Length::new());

        let mut opt = ShapeOptimizer::new();
        opt.opts.quiet = true;
        opt.fix_vertices(&problem, &[0]);
        opt.relax(&mut problem, 3).unwrap();

        let origin = problem.mesh().vertex(0);
        assert_eq!(origin[0], 0.0);
        // The free endpoint is pulled toward the fixed one.
        let free = problem.mesh().vertex(1);
        assert!(free[0] < 1.0);
    }
}
