//! Integrands over fields: Dirichlet energy of a field on faces, squared
//! field norm at vertices, and the equi-element size regularizer.

use nalgebra::Vector3;
use ndarray::Array2;

use crate::errors::{MorphoError, MorphoResult};
use crate::field::Field;
use crate::functional::geometry::simplex_size;
use crate::functional::{Element, EvalContext, Functional};
use crate::mesh::Mesh;
use crate::problem::FieldId;
use crate::EPS;

/// Edge-vector Gram data of a triangle: u = x₁−x₀, w = x₂−x₀.
struct TriangleFrame {
    u: Vector3<f64>,
    w: Vector3<f64>,
    uu: f64,
    uw: f64,
    ww: f64,
    det: f64,
}

fn triangle_frame(ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<TriangleFrame> {
    let x0 = ctx.pos(el.vertices[0]);
    let u = ctx.pos(el.vertices[1]) - x0;
    let w = ctx.pos(el.vertices[2]) - x0;
    let uu = u.dot(&u);
    let uw = u.dot(&w);
    let ww = w.dot(&w);
    let det = uu * ww - uw * uw;
    if det < EPS {
        return Err(MorphoError::DegenerateElement { grade: 2, element: el.id });
    }
    Ok(TriangleFrame { u, w, uu, uw, ww, det })
}

/// Vertex differences of every component of a vertex field on one triangle:
/// (value at v₁ − value at v₀, value at v₂ − value at v₀).
fn vertex_differences(
    field: &Field,
    el: Element<'_>,
    name: &str,
) -> MorphoResult<Vec<(f64, f64)>> {
    if field.shape()[0] == 0 {
        return Err(MorphoError::FieldLayout(format!("{name} needs a vertex field")));
    }
    let mut out = Vec::new();
    for item in 0..field.shape()[0] {
        let f0 = field.item(0, el.vertices[0], item)?;
        let f1 = field.item(0, el.vertices[1], item)?;
        let f2 = field.item(0, el.vertices[2], item)?;
        for c in 0..field.psize() {
            out.push((f1[c] - f0[c], f2[c] - f0[c]));
        }
    }
    Ok(out)
}

/// Dirichlet energy ‖∇φ‖² integrated over each face, with the constant
/// per-face gradient expressed through the triangle's edge Gram matrix.
#[derive(Debug, Clone, Copy)]
pub struct GradSq {
    field: FieldId,
}

impl GradSq {
    pub fn new(field: FieldId) -> Self {
        Self { field }
    }
}

impl Functional for GradSq {
    fn name(&self) -> &str {
        "GradSq"
    }

    fn grade(&self, _mesh: &Mesh) -> usize {
        2
    }

    fn field(&self) -> Option<FieldId> {
        Some(self.field)
    }

    fn integrand(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<f64> {
        let frame = triangle_frame(ctx, el)?;
        let diffs = vertex_differences(ctx.field(self.field)?, el, self.name())?;
        let mut p = 0.0;
        for (d1, d2) in diffs {
            p += d1 * d1 * frame.ww - 2.0 * d1 * d2 * frame.uw + d2 * d2 * frame.uu;
        }
        Ok(p / (2.0 * frame.det.sqrt()))
    }

    fn analytic_gradient(&self) -> bool {
        true
    }

    fn gradient(&self, ctx: &EvalContext<'_>, el: Element<'_>, out: &mut Array2<f64>) -> MorphoResult<()> {
        let frame = triangle_frame(ctx, el)?;
        let diffs = vertex_differences(ctx.field(self.field)?, el, self.name())?;
        let TriangleFrame { u, w, uu, uw, ww, det } = frame;

        let mut p = 0.0;
        let mut dp_du = Vector3::zeros();
        let mut dp_dw = Vector3::zeros();
        for &(d1, d2) in &diffs {
            p += d1 * d1 * ww - 2.0 * d1 * d2 * uw + d2 * d2 * uu;
            dp_du += 2.0 * d2 * d2 * u - 2.0 * d1 * d2 * w;
            dp_dw += 2.0 * d1 * d1 * w - 2.0 * d1 * d2 * u;
        }
        let dd_du = 2.0 * ww * u - 2.0 * uw * w;
        let dd_dw = 2.0 * uu * w - 2.0 * uw * u;

        let sqrt_det = det.sqrt();
        let gu = dp_du / (2.0 * sqrt_det) - p * dd_du / (4.0 * det * sqrt_det);
        let gw = dp_dw / (2.0 * sqrt_det) - p * dd_dw / (4.0 * det * sqrt_det);

        crate::linalg::accumulate_column(out, el.vertices[0], -(gu + gw));
        crate::linalg::accumulate_column(out, el.vertices[1], gu);
        crate::linalg::accumulate_column(out, el.vertices[2], gw);
        Ok(())
    }
}

/// Σ‖φ‖² over the items each vertex carries.
#[derive(Debug, Clone, Copy)]
pub struct NormSq {
    field: FieldId,
}

impl NormSq {
    pub fn new(field: FieldId) -> Self {
        Self { field }
    }
}

impl Functional for NormSq {
    fn name(&self) -> &str {
        "NormSq"
    }

    fn grade(&self, _mesh: &Mesh) -> usize {
        0
    }

    fn field(&self) -> Option<FieldId> {
        Some(self.field)
    }

    fn integrand(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<f64> {
        let field = ctx.field(self.field)?;
        let mut sum = 0.0;
        for item in 0..field.shape()[0] {
            for &v in field.item(0, el.id, item)? {
                sum += v * v;
            }
        }
        Ok(sum)
    }

    // The integrand never reads positions, so the position gradient is
    // identically zero.
    fn analytic_gradient(&self) -> bool {
        true
    }

    fn gradient(&self, _ctx: &EvalContext<'_>, _el: Element<'_>, _out: &mut Array2<f64>) -> MorphoResult<()> {
        Ok(())
    }

    fn analytic_field_gradient(&self) -> bool {
        true
    }

    fn field_gradient(&self, ctx: &EvalContext<'_>, el: Element<'_>, out: &mut Field) -> MorphoResult<()> {
        let field = ctx.field(self.field)?;
        for item in 0..field.shape()[0] {
            let values = field.item(0, el.id, item)?.to_vec();
            let slot = out.item_mut(0, el.id, item)?;
            for (o, v) in slot.iter_mut().zip(values) {
                *o += 2.0 * v;
            }
        }
        Ok(())
    }
}

/// Penalizes spread in the sizes of the elements around each vertex:
/// Σᵢ wᵢ (aᵢ − ā)², optionally weighted by a per-element field.
#[derive(Debug, Clone, Copy, Default)]
pub struct EquiElement {
    weight: Option<FieldId>,
}

impl EquiElement {
    pub fn new() -> Self {
        Self { weight: None }
    }

    pub fn weighted(weight: FieldId) -> Self {
        Self { weight: Some(weight) }
    }
}

impl Functional for EquiElement {
    fn name(&self) -> &str {
        "EquiElement"
    }

    fn grade(&self, _mesh: &Mesh) -> usize {
        0
    }

    fn integrand(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<f64> {
        let top = ctx.mesh.max_grade();
        if top == 0 {
            return Err(MorphoError::MissingGrade(1));
        }
        let table = ctx.mesh.element_table(top)?;
        let incident = ctx.mesh.find_neighbors(0, el.id, top)?;
        if incident.len() < 2 {
            return Ok(0.0);
        }
        let sizes: Vec<f64> = incident
            .iter()
            .map(|&e| simplex_size(&ctx.positions, table.vertices(e)))
            .collect();
        let mean = sizes.iter().sum::<f64>() / sizes.len() as f64;
        let mut sum = 0.0;
        for (k, &e) in incident.iter().enumerate() {
            let weight = match self.weight {
                Some(id) => ctx.field(id)?.get(top, e, 0, 0)?,
                None => 1.0,
            };
            let dev = sizes[k] - mean;
            sum += weight * dev * dev;
        }
        Ok(sum)
    }

    fn dependencies(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<Vec<usize>> {
        let top = ctx.mesh.max_grade();
        let table = ctx.mesh.element_table(top)?;
        let mut deps = std::collections::BTreeSet::new();
        for e in ctx.mesh.find_neighbors(0, el.id, top)? {
            deps.extend(table.vertices(e).iter().copied());
        }
        deps.remove(&el.id);
        Ok(deps.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functional::evaluate;
    use crate::functional::tests_support::{assert_gradient_matches_numerical, unit_triangle};

    fn triangle_with_hat_field() -> (Mesh, Vec<Field>) {
        let mesh = unit_triangle();
        let mut phi = Field::scalar(&mesh);
        phi.set(0, 1, 0, 0, 1.0).unwrap();
        (mesh, vec![phi])
    }

    #[test]
    fn gradsq_of_linear_field() {
        let (mesh, fields) = triangle_with_hat_field();
        let f = GradSq::new(FieldId(0));
        // φ = x on the unit right triangle: |∇φ|² = 1 over area ½.
        let total = evaluate::total(&f, &mesh, &fields, None).unwrap();
        assert!((total - 0.5).abs() < 1e-12);

        let grad = evaluate::gradient(&f, &mesh, &fields, None).unwrap();
        for d in 0..3 {
            let row_sum: f64 = (0..3).map(|v| grad[[d, v]]).sum();
            assert!(row_sum.abs() < 1e-10);
        }
        assert_gradient_matches_numerical(&f, &mesh, &fields, 1e-5);
    }

    #[test]
    fn gradsq_field_gradient() {
        let (mesh, fields) = triangle_with_hat_field();
        let f = GradSq::new(FieldId(0));
        let g = evaluate::field_gradient(&f, &mesh, &fields, None).unwrap();
        assert!((g.get(0, 0, 0, 0).unwrap() + 1.0).abs() < 1e-5);
        assert!((g.get(0, 1, 0, 0).unwrap() - 1.0).abs() < 1e-5);
        assert!(g.get(0, 2, 0, 0).unwrap().abs() < 1e-5);
    }

    #[test]
    fn normsq_total_and_gradients() {
        let mesh = unit_triangle();
        let mut n = Field::vector(&mesh, 2);
        n.set(0, 0, 0, 0, 3.0).unwrap();
        n.set(0, 2, 0, 1, -2.0).unwrap();
        let fields = vec![n];
        let f = NormSq::new(FieldId(0));
        let total = evaluate::total(&f, &mesh, &fields, None).unwrap();
        assert!((total - 13.0).abs() < 1e-12);

        let g = evaluate::field_gradient(&f, &mesh, &fields, None).unwrap();
        assert!((g.get(0, 0, 0, 0).unwrap() - 6.0).abs() < 1e-12);
        assert!((g.get(0, 2, 0, 1).unwrap() + 4.0).abs() < 1e-12);
        assert!(g.get(0, 1, 0, 0).unwrap().abs() < 1e-12);

        let pos_grad = evaluate::gradient(&f, &mesh, &fields, None).unwrap();
        assert!(pos_grad.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn equielement_measures_size_spread() {
        let mut mesh =
            Mesh::from_positions(3, &[0.0, 0.0, 0.0, 0.3, 0.0, 0.0, 1.0, 0.0, 0.0]).unwrap();
        mesh.add_element(1, &[0, 1]).unwrap();
        mesh.add_element(1, &[1, 2]).unwrap();
        let row = evaluate::integrand(&EquiElement::new(), &mesh, &[], None).unwrap();
        assert!(row[0].abs() < 1e-12);
        assert!(row[2].abs() < 1e-12);
        // Middle vertex sees lengths 0.3 and 0.7 about mean 0.5.
        assert!((row[1] - 0.08).abs() < 1e-12);
    }
}
