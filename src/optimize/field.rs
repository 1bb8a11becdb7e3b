//! Optimization of one field's values with the mesh held fixed.

use std::collections::BTreeSet;

use ndarray::Array1;

use crate::errors::MorphoResult;
use crate::functional::{evaluate, Functional};
use crate::optimize::engine::{Descent, DescentTarget};
use crate::optimize::{DescentReport, OptimizerOptions};
use crate::problem::{ConstraintTerm, EnergyTerm, FieldId, OptimizationProblem};
use crate::selection::Selection;

struct FieldTarget {
    field: FieldId,
}

impl DescentTarget for FieldTarget {
    fn label(&self) -> &'static str {
        "field"
    }

    fn read(&self, p: &OptimizationProblem) -> MorphoResult<Array1<f64>> {
        Ok(Array1::from_vec(p.field(self.field)?.data().to_vec()))
    }

    fn write(&self, p: &mut OptimizationProblem, x: &Array1<f64>) -> MorphoResult<()> {
        let field = p.field_mut(self.field)?;
        field
            .data_mut()
            .copy_from_slice(x.as_slice().expect("flat target vector is contiguous"));
        Ok(())
    }

    fn energy_relevant(&self, term: &EnergyTerm) -> bool {
        term.functional.field() == Some(self.field)
    }

    fn constraint_relevant(&self, term: &ConstraintTerm) -> bool {
        term.field == Some(self.field)
    }

    fn gradient_flat(
        &self,
        p: &OptimizationProblem,
        f: &dyn Functional,
        sel: Option<&Selection>,
    ) -> MorphoResult<Array1<f64>> {
        let g = evaluate::field_gradient(f, p.mesh(), p.fields(), sel)?;
        Ok(Array1::from_vec(g.data().to_vec()))
    }

    fn group_indices(
        &self,
        p: &OptimizationProblem,
        grade: usize,
        el: usize,
    ) -> MorphoResult<Vec<usize>> {
        Ok(p.field(self.field)?.dof_range(grade, el).collect())
    }
}

/// Constraint-projected descent on one field of the problem.
pub struct FieldOptimizer {
    pub opts: OptimizerOptions,
    field: FieldId,
    fixed: BTreeSet<usize>,
    history: Vec<f64>,
}

impl FieldOptimizer {
    pub fn new(field: FieldId) -> Self {
        Self::with_options(field, OptimizerOptions::default())
    }

    pub fn with_options(field: FieldId, opts: OptimizerOptions) -> Self {
        Self { opts, field, fixed: BTreeSet::new(), history: Vec::new() }
    }

    pub fn field(&self) -> FieldId {
        self.field
    }

    /// Pins the field entries carried by the selected elements of every
    /// grade.
    pub fn fix_selection(&mut self, p: &OptimizationProblem, sel: &Selection) -> MorphoResult<()> {
        let field = p.field(self.field)?;
        for grade in 0..4 {
            for el in sel.ids(grade) {
                self.fixed.extend(field.dof_range(grade, el));
            }
        }
        Ok(())
    }

    pub fn clear_fixed(&mut self) {
        self.fixed.clear();
    }

    pub fn energy_history(&self) -> &[f64] {
        &self.history
    }

    /// Restores constraint satisfaction without descending.
    pub fn reproject(&self, p: &mut OptimizationProblem) -> MorphoResult<()> {
        let target = FieldTarget { field: self.field };
        let engine = Descent { target: &target, opts: &self.opts, fixed: &self.fixed };
        engine.reproject_local_constraints(p, true)?;
        engine.reproject_constraints(p, true)
    }

    pub fn relax(&mut self, p: &mut OptimizationProblem, n: usize) -> MorphoResult<DescentReport> {
        let target = FieldTarget { field: self.field };
        let engine = Descent { target: &target, opts: &self.opts, fixed: &self.fixed };
        engine.relax(p, n, &mut self.history)
    }

    pub fn linesearch(&mut self, p: &mut OptimizationProblem, n: usize) -> MorphoResult<DescentReport> {
        let target = FieldTarget { field: self.field };
        let engine = Descent { target: &target, opts: &self.opts, fixed: &self.fixed };
        engine.linesearch(p, n, &mut self.history)
    }

    pub fn conjugate_gradient(
        &mut self,
        p: &mut OptimizationProblem,
        n: usize,
    ) -> MorphoResult<DescentReport> {
        let target = FieldTarget { field: self.field };
        let engine = Descent { target: &target, opts: &self.opts, fixed: &self.fixed };
        engine.conjugate_gradient(p, n, &mut self.history)
    }
}
