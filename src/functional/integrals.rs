//! General-purpose quadrature functionals driven by user closures, plus the
//! fixed quadrature rules they sample with. Closures report failure through
//! `anyhow`, which the evaluator surfaces as a callback error.

use nalgebra::Vector3;
use ndarray::Array2;

use crate::errors::MorphoResult;
use crate::functional::{Element, EvalContext, Functional};
use crate::linalg::accumulate_column;
use crate::mesh::Mesh;
use crate::problem::FieldId;
use crate::EPS;

/// A fixed quadrature rule in reference coordinates with weights summing to
/// one, so element measures factor out.
#[derive(Debug, Clone)]
pub struct QuadRule {
    /// Barycentric node coordinates (length 2 for lines, 3 for triangles).
    pub nodes: Vec<Vec<f64>>,
    pub weights: Vec<f64>,
}

impl QuadRule {
    /// Three-point Gauss–Legendre rule on a segment, exact to degree five.
    pub fn line() -> Self {
        let a = 0.5 * (3.0f64 / 5.0).sqrt();
        let ts = [0.5 - a, 0.5, 0.5 + a];
        Self {
            nodes: ts.iter().map(|&t| vec![1.0 - t, t]).collect(),
            weights: vec![5.0 / 18.0, 8.0 / 18.0, 5.0 / 18.0],
        }
    }

    /// Six-point symmetric triangle rule, exact to degree four.
    pub fn triangle() -> Self {
        let mut nodes = Vec::new();
        let mut weights = Vec::new();
        let groups: [(f64, f64, f64); 2] = [
            (0.223_381_589_678_011, 0.108_103_018_168_070, 0.445_948_490_915_965),
            (0.109_951_743_655_322, 0.816_847_572_980_459, 0.091_576_213_509_771),
        ];
        for (w, a, b) in groups {
            nodes.push(vec![a, b, b]);
            nodes.push(vec![b, a, b]);
            nodes.push(vec![b, b, a]);
            weights.extend([w, w, w]);
        }
        Self { nodes, weights }
    }
}

/// Data handed to an integral closure at one quadrature point.
pub struct QuadPoint<'a> {
    pub position: Vector3<f64>,
    /// Unit tangent of the current element (line integrals only).
    pub tangent: Vector3<f64>,
    /// Unit normal of the current element (area integrals only).
    pub normal: Vector3<f64>,
    /// Interpolated components of each attached field, in attachment order.
    pub fields: &'a [Vec<f64>],
}

pub type IntegralFn = Box<dyn Fn(&QuadPoint<'_>) -> anyhow::Result<f64>>;
pub type PotentialFn = Box<dyn Fn(Vector3<f64>) -> anyhow::Result<f64>>;
pub type PotentialGradFn = Box<dyn Fn(Vector3<f64>) -> anyhow::Result<Vector3<f64>>>;

/// Interpolates every grade-0 component of each attached field at a
/// barycentric point of the element.
fn interpolate_fields(
    ctx: &EvalContext<'_>,
    ids: &[FieldId],
    vertices: &[usize],
    bary: &[f64],
) -> MorphoResult<Vec<Vec<f64>>> {
    let mut out = Vec::with_capacity(ids.len());
    for &id in ids {
        let field = ctx.field(id)?;
        let width = field.shape()[0] * field.psize();
        let mut values = vec![0.0; width];
        for (k, &v) in vertices.iter().enumerate() {
            for item in 0..field.shape()[0] {
                let comps = field.item(0, v, item)?;
                for (c, &fv) in comps.iter().enumerate() {
                    values[item * field.psize() + c] += bary[k] * fv;
                }
            }
        }
        out.push(values);
    }
    Ok(out)
}

/// Pointwise potential evaluated at each vertex, with an optional analytic
/// gradient closure.
pub struct ScalarPotential {
    f: PotentialFn,
    grad: Option<PotentialGradFn>,
}

impl ScalarPotential {
    pub fn new(f: PotentialFn) -> Self {
        Self { f, grad: None }
    }

    pub fn with_gradient(f: PotentialFn, grad: PotentialGradFn) -> Self {
        Self { f, grad: Some(grad) }
    }
}

impl Functional for ScalarPotential {
    fn name(&self) -> &str {
        "ScalarPotential"
    }

    fn grade(&self, _mesh: &Mesh) -> usize {
        0
    }

    fn integrand(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<f64> {
        Ok((self.f)(ctx.pos(el.id))?)
    }

    fn analytic_gradient(&self) -> bool {
        self.grad.is_some()
    }

    fn gradient(&self, ctx: &EvalContext<'_>, el: Element<'_>, out: &mut Array2<f64>) -> MorphoResult<()> {
        if let Some(grad) = &self.grad {
            accumulate_column(out, el.id, grad(ctx.pos(el.id))?);
        }
        Ok(())
    }
}

/// Quadrature of a user integrand along line elements, scaled by element
/// length. The closure sees position, unit tangent, and interpolated field
/// values.
pub struct LineIntegral {
    f: IntegralFn,
    fields: Vec<FieldId>,
    rule: QuadRule,
}

impl LineIntegral {
    pub fn new(f: IntegralFn, fields: Vec<FieldId>) -> Self {
        Self { f, fields, rule: QuadRule::line() }
    }
}

impl Functional for LineIntegral {
    fn name(&self) -> &str {
        "LineIntegral"
    }

    fn grade(&self, _mesh: &Mesh) -> usize {
        1
    }

    fn field(&self) -> Option<FieldId> {
        self.fields.first().copied()
    }

    fn integrand(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<f64> {
        let x0 = ctx.pos(el.vertices[0]);
        let x1 = ctx.pos(el.vertices[1]);
        let len = (x1 - x0).norm();
        if len < EPS {
            return Ok(0.0);
        }
        let tangent = (x1 - x0) / len;
        let mut sum = 0.0;
        for (node, &w) in self.rule.nodes.iter().zip(&self.rule.weights) {
            let fields = interpolate_fields(ctx, &self.fields, el.vertices, node)?;
            let point = QuadPoint {
                position: node[0] * x0 + node[1] * x1,
                tangent,
                normal: Vector3::zeros(),
                fields: &fields,
            };
            sum += w * (self.f)(&point)?;
        }
        Ok(len * sum)
    }
}

/// Quadrature of a user integrand over face elements, scaled by element
/// area. The closure sees position, unit normal, and interpolated field
/// values.
pub struct AreaIntegral {
    f: IntegralFn,
    fields: Vec<FieldId>,
    rule: QuadRule,
}

impl AreaIntegral {
    pub fn new(f: IntegralFn, fields: Vec<FieldId>) -> Self {
        Self { f, fields, rule: QuadRule::triangle() }
    }
}

impl Functional for AreaIntegral {
    fn name(&self) -> &str {
        "AreaIntegral"
    }

    fn grade(&self, _mesh: &Mesh) -> usize {
        2
    }

    fn field(&self) -> Option<FieldId> {
        self.fields.first().copied()
    }

    fn integrand(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<f64> {
        let x0 = ctx.pos(el.vertices[0]);
        let x1 = ctx.pos(el.vertices[1]);
        let x2 = ctx.pos(el.vertices[2]);
        let cross = (x1 - x0).cross(&(x2 - x0));
        let doubled = cross.norm();
        if doubled < EPS {
            return Ok(0.0);
        }
        let normal = cross / doubled;
        let mut sum = 0.0;
        for (node, &w) in self.rule.nodes.iter().zip(&self.rule.weights) {
            let fields = interpolate_fields(ctx, &self.fields, el.vertices, node)?;
            let point = QuadPoint {
                position: node[0] * x0 + node[1] * x1 + node[2] * x2,
                tangent: Vector3::zeros(),
                normal,
                fields: &fields,
            };
            sum += w * (self.f)(&point)?;
        }
        Ok(0.5 * doubled * sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Field;
    use crate::functional::evaluate;
    use crate::functional::tests_support::unit_triangle;

    #[test]
    fn quadrature_weights_sum_to_one() {
        for rule in [QuadRule::line(), QuadRule::triangle()] {
            let sum: f64 = rule.weights.iter().sum();
            assert!((sum - 1.0).abs() < 1e-14);
            for node in &rule.nodes {
                let s: f64 = node.iter().sum();
                assert!((s - 1.0).abs() < 1e-14);
            }
        }
    }

    #[test]
    fn line_integral_of_coordinate() {
        let mut mesh = Mesh::from_positions(3, &[0.0, 0.0, 0.0, 2.0, 0.0, 0.0]).unwrap();
        mesh.add_element(1, &[0, 1]).unwrap();
        let f = LineIntegral::new(Box::new(|p| Ok(p.position[0])), vec![]);
        // ∫ x ds over [0,2] on the x axis.
        let total = evaluate::total(&f, &mesh, &[], None).unwrap();
        assert!((total - 2.0).abs() < 1e-12);

        let tangent = LineIntegral::new(Box::new(|p| Ok(p.tangent[0])), vec![]);
        let total = evaluate::total(&tangent, &mesh, &[], None).unwrap();
        assert!((total - 2.0).abs() < 1e-12);
    }

    #[test]
    fn line_integral_interpolates_fields() {
        let mut mesh = Mesh::from_positions(3, &[0.0, 0.0, 0.0, 1.0, 0.0, 0.0]).unwrap();
        mesh.add_element(1, &[0, 1]).unwrap();
        let mut phi = Field::scalar(&mesh);
        phi.set(0, 1, 0, 0, 2.0).unwrap();
        let fields = vec![phi];
        let f = LineIntegral::new(Box::new(|p| Ok(p.fields[0][0] * p.fields[0][0])), vec![FieldId(0)]);
        // ∫ (2x)² dx over [0,1] = 4/3.
        let total = evaluate::total(&f, &mesh, &fields, None).unwrap();
        assert!((total - 4.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn area_integral_moments() {
        let mesh = unit_triangle();
        let one = AreaIntegral::new(Box::new(|_| Ok(1.0)), vec![]);
        let total = evaluate::total(&one, &mesh, &[], None).unwrap();
        assert!((total - 0.5).abs() < 1e-12);

        let x = AreaIntegral::new(Box::new(|p| Ok(p.position[0])), vec![]);
        let total = evaluate::total(&x, &mesh, &[], None).unwrap();
        assert!((total - 1.0 / 6.0).abs() < 1e-12);

        let xx = AreaIntegral::new(Box::new(|p| Ok(p.position[0] * p.position[0])), vec![]);
        let total = evaluate::total(&xx, &mesh, &[], None).unwrap();
        assert!((total - 1.0 / 12.0).abs() < 1e-12);

        let normal = AreaIntegral::new(Box::new(|p| Ok(p.normal[2])), vec![]);
        let total = evaluate::total(&normal, &mesh, &[], None).unwrap();
        assert!((total - 0.5).abs() < 1e-12);
    }

    #[test]
    fn scalar_potential_with_gradient() {
        let mesh = unit_triangle();
        let f = ScalarPotential::with_gradient(
            Box::new(|x| Ok(x[0] * x[0] + x[1])),
            Box::new(|x| Ok(Vector3::new(2.0 * x[0], 1.0, 0.0))),
        );
        let total = evaluate::total(&f, &mesh, &[], None).unwrap();
        assert!((total - 2.0).abs() < 1e-12);
        crate::functional::tests_support::assert_gradient_matches_numerical(&f, &mesh, &[], 1e-5);
    }

    #[test]
    fn failing_callback_surfaces_as_error() {
        let mesh = unit_triangle();
        let f = ScalarPotential::new(Box::new(|_| anyhow::bail!("bad closure")));
        assert!(evaluate::total(&f, &mesh, &[], None).is_err());
    }
}
