//! The optimization problem: energies, constraints, and local constraints
//! over one mesh and its fields. The problem owns mesh, field, and selection
//! arenas; records refer to them through plain index ids, and
//! [`OptimizationProblem::update`] is the sole rebinding point after
//! refinement.

use crate::errors::{MorphoError, MorphoResult};
use crate::field::Field;
use crate::functional::{evaluate, Functional};
use crate::mesh::Mesh;
use crate::refine::Refined;
use crate::selection::Selection;

/// Index of a field in the problem's field arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldId(pub usize);

/// Index of a selection in the problem's selection arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SelectionId(pub usize);

/// One energy contribution: a functional scaled by a prefactor, optionally
/// restricted to a selection.
pub struct EnergyTerm {
    pub functional: Box<dyn Functional>,
    pub selection: Option<SelectionId>,
    pub prefactor: f64,
}

/// A conserved quantity (global) or pointwise condition (local). The target
/// is captured from the current state at add time unless supplied.
pub struct ConstraintTerm {
    pub functional: Box<dyn Functional>,
    pub selection: Option<SelectionId>,
    pub field: Option<FieldId>,
    pub target: f64,
    pub onesided: bool,
}

pub struct OptimizationProblem {
    mesh: Mesh,
    fields: Vec<Field>,
    selections: Vec<Selection>,
    energies: Vec<EnergyTerm>,
    constraints: Vec<ConstraintTerm>,
    local_constraints: Vec<ConstraintTerm>,
}

impl OptimizationProblem {
    pub fn new(mesh: Mesh) -> Self {
        Self {
            mesh,
            fields: Vec::new(),
            selections: Vec::new(),
            energies: Vec::new(),
            constraints: Vec::new(),
            local_constraints: Vec::new(),
        }
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn mesh_mut(&mut self) -> &mut Mesh {
        &mut self.mesh
    }

    pub fn add_field(&mut self, field: Field) -> FieldId {
        self.fields.push(field);
        FieldId(self.fields.len() - 1)
    }

    pub fn field(&self, id: FieldId) -> MorphoResult<&Field> {
        self.fields.get(id.0).ok_or(MorphoError::OutOfBounds {
            what: "field",
            index: id.0,
            len: self.fields.len(),
        })
    }

    pub fn field_mut(&mut self, id: FieldId) -> MorphoResult<&mut Field> {
        let len = self.fields.len();
        self.fields.get_mut(id.0).ok_or(MorphoError::OutOfBounds {
            what: "field",
            index: id.0,
            len,
        })
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn add_selection(&mut self, selection: Selection) -> SelectionId {
        self.selections.push(selection);
        SelectionId(self.selections.len() - 1)
    }

    pub fn selection(&self, id: SelectionId) -> MorphoResult<&Selection> {
        self.selections.get(id.0).ok_or(MorphoError::OutOfBounds {
            what: "selection",
            index: id.0,
            len: self.selections.len(),
        })
    }

    /// Resolves an optional selection id to a selection reference.
    pub fn selection_of(&self, id: Option<SelectionId>) -> MorphoResult<Option<&Selection>> {
        match id {
            Some(id) => Ok(Some(self.selection(id)?)),
            None => Ok(None),
        }
    }

    pub fn add_energy(&mut self, functional: impl Functional + 'static) -> usize {
        self.add_energy_with(functional, None, 1.0)
    }

    pub fn add_energy_with(
        &mut self,
        functional: impl Functional + 'static,
        selection: Option<SelectionId>,
        prefactor: f64,
    ) -> usize {
        self.energies.push(EnergyTerm {
            functional: Box::new(functional),
            selection,
            prefactor,
        });
        self.energies.len() - 1
    }

    pub fn set_prefactor(&mut self, energy: usize, prefactor: f64) {
        self.energies[energy].prefactor = prefactor;
    }

    /// Adds a global constraint, recording the functional's current total as
    /// the conserved target.
    pub fn add_constraint(&mut self, functional: impl Functional + 'static) -> MorphoResult<usize> {
        self.add_constraint_with(functional, None, None)
    }

    pub fn add_constraint_with(
        &mut self,
        functional: impl Functional + 'static,
        selection: Option<SelectionId>,
        target: Option<f64>,
    ) -> MorphoResult<usize> {
        let target = match target {
            Some(t) => t,
            None => evaluate::total(
                &functional,
                &self.mesh,
                &self.fields,
                self.selection_of(selection)?,
            )?,
        };
        let field = functional.field();
        self.constraints.push(ConstraintTerm {
            functional: Box::new(functional),
            selection,
            field,
            target,
            onesided: false,
        });
        Ok(self.constraints.len() - 1)
    }

    /// Adds a per-element constraint. The target defaults to zero, so the
    /// integrand itself is driven to the zero set.
    pub fn add_local_constraint(
        &mut self,
        functional: impl Functional + 'static,
        selection: Option<SelectionId>,
        onesided: bool,
        target: Option<f64>,
    ) -> usize {
        let field = functional.field();
        self.local_constraints.push(ConstraintTerm {
            functional: Box::new(functional),
            selection,
            field,
            target: target.unwrap_or(0.0),
            onesided,
        });
        self.local_constraints.len() - 1
    }

    pub fn energies(&self) -> &[EnergyTerm] {
        &self.energies
    }

    pub fn constraints(&self) -> &[ConstraintTerm] {
        &self.constraints
    }

    pub fn local_constraints(&self) -> &[ConstraintTerm] {
        &self.local_constraints
    }

    /// Total energy: Σ prefactor · functional total.
    pub fn total_energy(&self) -> MorphoResult<f64> {
        let mut sum = 0.0;
        for term in &self.energies {
            sum += term.prefactor
                * evaluate::total(
                    term.functional.as_ref(),
                    &self.mesh,
                    &self.fields,
                    self.selection_of(term.selection)?,
                )?;
        }
        Ok(sum)
    }

    /// Rebinds the problem onto a refined mesh: fields and selections are
    /// carried through the refinement map, and every functional gets the
    /// chance to rebuild internal references. Constraint targets are
    /// conserved.
    pub fn update(&mut self, refined: Refined) -> MorphoResult<()> {
        for field in &mut self.fields {
            *field = refined.field(field)?;
        }
        for selection in &mut self.selections {
            *selection = refined.selection(selection);
        }
        for term in &mut self.energies {
            term.functional.refresh_after_refine(&refined.map, &refined.mesh)?;
        }
        for term in self.constraints.iter_mut().chain(&mut self.local_constraints) {
            term.functional.refresh_after_refine(&refined.map, &refined.mesh)?;
        }
        self.mesh = refined.mesh;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functional::geometry::{Area, Length};

    fn square_mesh() -> Mesh {
        let mut mesh =
            Mesh::from_positions(2, &[0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0]).unwrap();
        mesh.add_element(2, &[0, 1, 2]).unwrap();
        mesh.add_element(2, &[0, 2, 3]).unwrap();
        mesh.add_grade(1).unwrap();
        mesh
    }

    #[test]
    fn energy_totals_respect_prefactors() {
        let mut problem = OptimizationProblem::new(square_mesh());
        let e = problem.add_energy(Area::new());
        assert!((problem.total_energy().unwrap() - 1.0).abs() < 1e-12);
        problem.set_prefactor(e, 2.5);
        assert!((problem.total_energy().unwrap() - 2.5).abs() < 1e-12);
    }

    #[test]
    fn constraint_target_captured_at_add_time() {
        let mut problem = OptimizationProblem::new(square_mesh());
        let c = problem.add_constraint(Area::new()).unwrap();
        assert!((problem.constraints()[c].target - 1.0).abs() < 1e-12);

        let explicit = problem
            .add_constraint_with(Length::new(), None, Some(7.0))
            .unwrap();
        assert!((problem.constraints()[explicit].target - 7.0).abs() < 1e-12);
    }

    #[test]
    fn selection_restricts_energy() {
        let mut problem = OptimizationProblem::new(square_mesh());
        let mut sel = Selection::new();
        sel.select(2, 0);
        let sid = problem.add_selection(sel);
        problem.add_energy_with(Area::new(), Some(sid), 1.0);
        assert!((problem.total_energy().unwrap() - 0.5).abs() < 1e-12);
    }
}
