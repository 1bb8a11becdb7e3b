//! The functional protocol: a uniform capability table for integrands and
//! their gradients, consumed by the evaluator in [`evaluate`].
//!
//! A functional never owns mesh or field data; it receives an evaluation
//! context and a single element per call. Gradients come in two flavors:
//! analytic (the functional writes vertex contributions itself) and
//! numerical (the evaluator runs central differences on a scratch copy of
//! the positions or field storage, so the live objects are never touched).

pub mod curvature;
pub mod elasticity;
pub mod evaluate;
pub mod fields;
pub mod geometry;
pub mod integrals;
pub mod nematic;

use nalgebra::Vector3;
use ndarray::{Array2, ArrayView2};

use crate::errors::{MorphoError, MorphoResult};
use crate::field::Field;
use crate::linalg::vertex3;
use crate::mesh::Mesh;
use crate::problem::FieldId;
use crate::refine::RefineMap;

/// Step used for central-difference gradients.
pub const GRAD_STEP: f64 = 1e-10;

/// What to do with gradient entries of symmetry-identified element pairs
/// after assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symmetry {
    /// Leave entries as assembled.
    None,
    /// Replace each entry of an identified pair with the pair sum, so both
    /// elements see the combined force.
    Add,
}

/// One element under evaluation: its dense id and its vertex ids (ascending).
#[derive(Debug, Clone, Copy)]
pub struct Element<'a> {
    pub id: usize,
    pub vertices: &'a [usize],
}

/// Everything a functional may read while evaluating one element.
pub struct EvalContext<'a> {
    pub mesh: &'a Mesh,
    pub positions: ArrayView2<'a, f64>,
    pub fields: &'a [Field],
}

impl<'a> EvalContext<'a> {
    pub fn new(mesh: &'a Mesh, fields: &'a [Field]) -> Self {
        Self { mesh, positions: mesh.vertex_matrix(), fields }
    }

    pub fn with_positions(mesh: &'a Mesh, positions: ArrayView2<'a, f64>, fields: &'a [Field]) -> Self {
        Self { mesh, positions, fields }
    }

    /// Position of vertex `v`, zero-padded to three components.
    pub fn pos(&self, v: usize) -> Vector3<f64> {
        vertex3(&self.positions, v)
    }

    pub fn field(&self, id: FieldId) -> MorphoResult<&Field> {
        self.fields.get(id.0).ok_or(MorphoError::OutOfBounds {
            what: "field",
            index: id.0,
            len: self.fields.len(),
        })
    }
}

/// Capability table implemented by every integrand.
pub trait Functional {
    fn name(&self) -> &str;

    /// Native grade of the elements this functional integrates over.
    fn grade(&self, mesh: &Mesh) -> usize;

    fn symmetry(&self) -> Symmetry {
        Symmetry::None
    }

    /// The field this functional consumes, if any.
    fn field(&self) -> Option<FieldId> {
        None
    }

    /// Integrand value for one element.
    fn integrand(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<f64>;

    /// Whether [`Functional::gradient`] is implemented; otherwise the
    /// evaluator falls back to central differences.
    fn analytic_gradient(&self) -> bool {
        false
    }

    /// Accumulates this element's vertex-position gradient into `out` (D×N).
    fn gradient(&self, _ctx: &EvalContext<'_>, _el: Element<'_>, _out: &mut Array2<f64>) -> MorphoResult<()> {
        Err(MorphoError::Unsupported("analytic gradient"))
    }

    fn analytic_field_gradient(&self) -> bool {
        false
    }

    /// Accumulates this element's field-component gradient into `out`, which
    /// shares the consumed field's layout.
    fn field_gradient(&self, _ctx: &EvalContext<'_>, _el: Element<'_>, _out: &mut Field) -> MorphoResult<()> {
        Err(MorphoError::Unsupported("analytic field gradient"))
    }

    /// Non-incident vertices whose motion still changes this element's
    /// integrand (curvature-like quantities reach across the neighborhood).
    fn dependencies(&self, _ctx: &EvalContext<'_>, _el: Element<'_>) -> MorphoResult<Vec<usize>> {
        Ok(Vec::new())
    }

    /// Called after mesh refinement so functionals holding references (such
    /// as a reference mesh) can rebuild them.
    fn refresh_after_refine(&mut self, _map: &RefineMap, _new_mesh: &Mesh) -> MorphoResult<()> {
        Ok(())
    }
}
