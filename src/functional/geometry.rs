//! Exact geometric integrands: length, enclosed area/volume, area, volume.
//! All gradients are closed-form applications of the chain rule on the
//! norm/dot/cross expressions, and every functional folds forces across
//! symmetry-identified vertices.

use ndarray::{Array2, ArrayView2};

use crate::errors::{MorphoError, MorphoResult};
use crate::functional::{Element, EvalContext, Functional, Symmetry};
use crate::linalg::{accumulate_column, vertex3};
use crate::mesh::Mesh;
use crate::EPS;

/// Unsigned measure of a simplex given by its vertex columns: length, twice
/// nothing for a point, area for three vertices, volume for four.
pub(crate) fn simplex_size(positions: &ArrayView2<'_, f64>, vids: &[usize]) -> f64 {
    match vids.len() {
        2 => (vertex3(positions, vids[1]) - vertex3(positions, vids[0])).norm(),
        3 => {
            let a = vertex3(positions, vids[1]) - vertex3(positions, vids[0]);
            let b = vertex3(positions, vids[2]) - vertex3(positions, vids[1]);
            0.5 * a.cross(&b).norm()
        }
        4 => {
            let x0 = vertex3(positions, vids[0]);
            let a = vertex3(positions, vids[1]) - x0;
            let b = vertex3(positions, vids[2]) - x0;
            let c = vertex3(positions, vids[3]) - x0;
            a.dot(&b.cross(&c)).abs() / 6.0
        }
        _ => 0.0,
    }
}

/// Total length of line elements.
#[derive(Debug, Default, Clone, Copy)]
pub struct Length;

impl Length {
    pub fn new() -> Self {
        Self
    }
}

impl Functional for Length {
    fn name(&self) -> &str {
        "Length"
    }

    fn grade(&self, _mesh: &Mesh) -> usize {
        1
    }

    fn symmetry(&self) -> Symmetry {
        Symmetry::Add
    }

    fn integrand(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<f64> {
        Ok((ctx.pos(el.vertices[1]) - ctx.pos(el.vertices[0])).norm())
    }

    fn analytic_gradient(&self) -> bool {
        true
    }

    fn gradient(&self, ctx: &EvalContext<'_>, el: Element<'_>, out: &mut Array2<f64>) -> MorphoResult<()> {
        let s = ctx.pos(el.vertices[1]) - ctx.pos(el.vertices[0]);
        let norm = s.norm();
        if norm < EPS {
            return Err(MorphoError::DegenerateElement { grade: 1, element: el.id });
        }
        let t = s / norm;
        accumulate_column(out, el.vertices[0], -t);
        accumulate_column(out, el.vertices[1], t);
        Ok(())
    }
}

/// Area enclosed by a loop of line elements about the origin: ½‖x₀ × x₁‖
/// per edge.
#[derive(Debug, Default, Clone, Copy)]
pub struct AreaEnclosed;

impl AreaEnclosed {
    pub fn new() -> Self {
        Self
    }
}

impl Functional for AreaEnclosed {
    fn name(&self) -> &str {
        "AreaEnclosed"
    }

    fn grade(&self, _mesh: &Mesh) -> usize {
        1
    }

    fn symmetry(&self) -> Symmetry {
        Symmetry::Add
    }

    fn integrand(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<f64> {
        let x0 = ctx.pos(el.vertices[0]);
        let x1 = ctx.pos(el.vertices[1]);
        Ok(0.5 * x0.cross(&x1).norm())
    }

    fn analytic_gradient(&self) -> bool {
        true
    }

    fn gradient(&self, ctx: &EvalContext<'_>, el: Element<'_>, out: &mut Array2<f64>) -> MorphoResult<()> {
        let x0 = ctx.pos(el.vertices[0]);
        let x1 = ctx.pos(el.vertices[1]);
        let c = x0.cross(&x1);
        let norm = c.norm();
        if norm < EPS {
            return Err(MorphoError::DegenerateElement { grade: 1, element: el.id });
        }
        let n = c / norm;
        accumulate_column(out, el.vertices[0], 0.5 * x1.cross(&n));
        accumulate_column(out, el.vertices[1], 0.5 * n.cross(&x0));
        Ok(())
    }
}

/// Total area of face elements.
#[derive(Debug, Default, Clone, Copy)]
pub struct Area;

impl Area {
    pub fn new() -> Self {
        Self
    }
}

impl Functional for Area {
    fn name(&self) -> &str {
        "Area"
    }

    fn grade(&self, _mesh: &Mesh) -> usize {
        2
    }

    fn symmetry(&self) -> Symmetry {
        Symmetry::Add
    }

    fn integrand(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<f64> {
        let a = ctx.pos(el.vertices[1]) - ctx.pos(el.vertices[0]);
        let b = ctx.pos(el.vertices[2]) - ctx.pos(el.vertices[1]);
        Ok(0.5 * a.cross(&b).norm())
    }

    fn analytic_gradient(&self) -> bool {
        true
    }

    fn gradient(&self, ctx: &EvalContext<'_>, el: Element<'_>, out: &mut Array2<f64>) -> MorphoResult<()> {
        let a = ctx.pos(el.vertices[1]) - ctx.pos(el.vertices[0]);
        let b = ctx.pos(el.vertices[2]) - ctx.pos(el.vertices[1]);
        let c = a.cross(&b);
        let norm = c.norm();
        if norm < EPS {
            return Err(MorphoError::DegenerateElement { grade: 2, element: el.id });
        }
        let n = c / norm;
        accumulate_column(out, el.vertices[0], 0.5 * n.cross(&b));
        accumulate_column(out, el.vertices[1], 0.5 * (a + b).cross(&n));
        accumulate_column(out, el.vertices[2], 0.5 * n.cross(&a));
        Ok(())
    }
}

/// Volume enclosed by a closed surface of face elements about the origin:
/// ⅙│(x₀ × x₁)·x₂│ per face.
#[derive(Debug, Default, Clone, Copy)]
pub struct VolumeEnclosed;

impl VolumeEnclosed {
    pub fn new() -> Self {
        Self
    }
}

impl Functional for VolumeEnclosed {
    fn name(&self) -> &str {
        "VolumeEnclosed"
    }

    fn grade(&self, _mesh: &Mesh) -> usize {
        2
    }

    fn symmetry(&self) -> Symmetry {
        Symmetry::Add
    }

    fn integrand(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<f64> {
        let x0 = ctx.pos(el.vertices[0]);
        let x1 = ctx.pos(el.vertices[1]);
        let x2 = ctx.pos(el.vertices[2]);
        Ok(x0.cross(&x1).dot(&x2).abs() / 6.0)
    }

    fn analytic_gradient(&self) -> bool {
        true
    }

    fn gradient(&self, ctx: &EvalContext<'_>, el: Element<'_>, out: &mut Array2<f64>) -> MorphoResult<()> {
        let x0 = ctx.pos(el.vertices[0]);
        let x1 = ctx.pos(el.vertices[1]);
        let x2 = ctx.pos(el.vertices[2]);
        let signed = x0.cross(&x1).dot(&x2);
        let s = signed.signum() / 6.0;
        if signed == 0.0 {
            return Ok(());
        }
        accumulate_column(out, el.vertices[0], s * x1.cross(&x2));
        accumulate_column(out, el.vertices[1], s * x2.cross(&x0));
        accumulate_column(out, el.vertices[2], s * x0.cross(&x1));
        Ok(())
    }
}

/// Total volume of solid elements.
#[derive(Debug, Default, Clone, Copy)]
pub struct Volume;

impl Volume {
    pub fn new() -> Self {
        Self
    }
}

impl Functional for Volume {
    fn name(&self) -> &str {
        "Volume"
    }

    fn grade(&self, _mesh: &Mesh) -> usize {
        3
    }

    fn symmetry(&self) -> Symmetry {
        Symmetry::Add
    }

    fn integrand(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<f64> {
        let x0 = ctx.pos(el.vertices[0]);
        let a = ctx.pos(el.vertices[1]) - x0;
        let b = ctx.pos(el.vertices[2]) - x0;
        let c = ctx.pos(el.vertices[3]) - x0;
        Ok(a.dot(&b.cross(&c)).abs() / 6.0)
    }

    fn analytic_gradient(&self) -> bool {
        true
    }

    fn gradient(&self, ctx: &EvalContext<'_>, el: Element<'_>, out: &mut Array2<f64>) -> MorphoResult<()> {
        let x0 = ctx.pos(el.vertices[0]);
        let a = ctx.pos(el.vertices[1]) - x0;
        let b = ctx.pos(el.vertices[2]) - x0;
        let c = ctx.pos(el.vertices[3]) - x0;
        let signed = a.dot(&b.cross(&c));
        if signed == 0.0 {
            return Ok(());
        }
        let s = signed.signum() / 6.0;
        let g1 = s * b.cross(&c);
        let g2 = s * c.cross(&a);
        let g3 = s * a.cross(&b);
        accumulate_column(out, el.vertices[0], -(g1 + g2 + g3));
        accumulate_column(out, el.vertices[1], g1);
        accumulate_column(out, el.vertices[2], g2);
        accumulate_column(out, el.vertices[3], g3);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functional::evaluate;
    use crate::functional::tests_support::{assert_gradient_matches_numerical, unit_triangle};
    use crate::mesh::Mesh;

    #[test]
    fn area_of_unit_triangle() {
        let mesh = unit_triangle();
        let total = evaluate::total(&Area::new(), &mesh, &[], None).unwrap();
        assert!((total - 0.5).abs() < 1e-12);

        let grad = evaluate::gradient(&Area::new(), &mesh, &[], None).unwrap();
        for d in 0..3 {
            let row_sum: f64 = (0..3).map(|v| grad[[d, v]]).sum();
            assert!(row_sum.abs() < 1e-12, "net force must vanish");
        }
    }

    #[test]
    fn area_gradient_matches_numerical() {
        let mesh = unit_triangle();
        assert_gradient_matches_numerical(&Area::new(), &mesh, &[], 1e-5);
    }

    #[test]
    fn length_total_and_gradient() {
        let mut mesh =
            Mesh::from_positions(3, &[0.0, 0.0, 0.0, 3.0, 4.0, 0.0]).unwrap();
        mesh.add_element(1, &[0, 1]).unwrap();
        let total = evaluate::total(&Length::new(), &mesh, &[], None).unwrap();
        assert!((total - 5.0).abs() < 1e-12);
        assert_gradient_matches_numerical(&Length::new(), &mesh, &[], 1e-5);
    }

    #[test]
    fn enclosed_area_of_square_loop() {
        let mut mesh = Mesh::from_positions(
            3,
            &[1.0, 1.0, 0.0, -1.0, 1.0, 0.0, -1.0, -1.0, 0.0, 1.0, -1.0, 0.0],
        )
        .unwrap();
        for i in 0..4 {
            mesh.add_element(1, &[i, (i + 1) % 4]).unwrap();
        }
        let total = evaluate::total(&AreaEnclosed::new(), &mesh, &[], None).unwrap();
        assert!((total - 4.0).abs() < 1e-12);
        assert_gradient_matches_numerical(&AreaEnclosed::new(), &mesh, &[], 1e-5);
    }

    #[test]
    fn tetrahedron_volume_both_ways() {
        let coords = [
            0.0, 0.0, 0.0, //
            1.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, //
            0.0, 0.0, 1.0,
        ];
        let mut solid = Mesh::from_positions(3, &coords).unwrap();
        solid.add_element(3, &[0, 1, 2, 3]).unwrap();
        let v = evaluate::total(&Volume::new(), &solid, &[], None).unwrap();
        assert!((v - 1.0 / 6.0).abs() < 1e-12);
        assert_gradient_matches_numerical(&Volume::new(), &solid, &[], 1e-5);

        // Shift away from the origin so the enclosed-volume faces are in
        // general position.
        let coords_shifted = [
            0.1, 0.2, 0.3, //
            1.1, 0.2, 0.3, //
            0.1, 1.2, 0.3, //
            0.1, 0.2, 1.3,
        ];
        let mut shell = Mesh::from_positions(3, &coords_shifted).unwrap();
        shell.add_element(2, &[0, 1, 2]).unwrap();
        shell.add_element(2, &[0, 1, 3]).unwrap();
        shell.add_element(2, &[0, 2, 3]).unwrap();
        shell.add_element(2, &[1, 2, 3]).unwrap();
        assert_gradient_matches_numerical(&VolumeEnclosed::new(), &shell, &[], 1e-5);
    }

    #[test]
    fn degenerate_edge_reports_error() {
        let mut mesh = Mesh::from_positions(3, &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0]).unwrap();
        mesh.add_element(1, &[0, 1]).unwrap();
        assert!(evaluate::gradient(&Length::new(), &mesh, &[], None).is_err());
    }
}
