//! Frank elastic energy of a unit director field on triangulated surfaces,
//! and its electrostatic coupling. The per-face director gradient comes from
//! the triangle's edge Gram matrix; products of linear vertex quantities are
//! integrated exactly with the barycentric pair rule
//! ∫ f g dA = (A/12)(Σᵢ fᵢ gᵢ + Σᵢ fᵢ Σⱼ gⱼ).

use nalgebra::Vector3;

use crate::errors::{MorphoError, MorphoResult};
use crate::field::Field;
use crate::functional::{Element, EvalContext, Functional};
use crate::mesh::Mesh;
use crate::problem::FieldId;
use crate::EPS;

struct Frame {
    u: Vector3<f64>,
    w: Vector3<f64>,
    uu: f64,
    uw: f64,
    ww: f64,
    det: f64,
}

fn frame(ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<Frame> {
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
    Ok(Frame { u, w, uu, uw, ww, det })
}

impl Frame {
    fn area(&self) -> f64 {
        0.5 * self.det.sqrt()
    }

    /// In-plane gradient of a linear scalar with vertex differences d1, d2.
    fn gradient_of(&self, d1: f64, d2: f64) -> Vector3<f64> {
        let alpha = (self.ww * d1 - self.uw * d2) / self.det;
        let beta = (self.uu * d2 - self.uw * d1) / self.det;
        alpha * self.u + beta * self.w
    }
}

/// Director values at the triangle corners.
fn director_values(field: &Field, el: Element<'_>, name: &str) -> MorphoResult<[Vector3<f64>; 3]> {
    if field.shape()[0] == 0 || field.psize() != 3 {
        return Err(MorphoError::FieldLayout(format!("{name} needs a 3-vector vertex field")));
    }
    let mut out = [Vector3::zeros(); 3];
    for (k, slot) in out.iter_mut().enumerate() {
        let item = field.item(0, el.vertices[k], 0)?;
        *slot = Vector3::new(item[0], item[1], item[2]);
    }
    Ok(out)
}

/// Exact integral of the product of two linear vertex quantities.
fn quad_pair(area: f64, f: [f64; 3], g: [f64; 3]) -> f64 {
    let dot: f64 = (0..3).map(|i| f[i] * g[i]).sum();
    let sf: f64 = f.iter().sum();
    let sg: f64 = g.iter().sum();
    area / 12.0 * (dot + sf * sg)
}

/// Splay/twist/bend elastic energy of a director field, with optional
/// cholesteric pitch entering the twist term.
#[derive(Debug, Clone, Copy)]
pub struct Nematic {
    director: FieldId,
    pub ksplay: f64,
    pub ktwist: f64,
    pub kbend: f64,
    pub pitch: Option<f64>,
}

impl Nematic {
    pub fn new(director: FieldId) -> Self {
        Self { director, ksplay: 1.0, ktwist: 1.0, kbend: 1.0, pitch: None }
    }

    pub fn with_constants(director: FieldId, ksplay: f64, ktwist: f64, kbend: f64, pitch: Option<f64>) -> Self {
        Self { director, ksplay, ktwist, kbend, pitch }
    }
}

impl Functional for Nematic {
    fn name(&self) -> &str {
        "Nematic"
    }

    fn grade(&self, _mesh: &Mesh) -> usize {
        2
    }

    fn field(&self) -> Option<FieldId> {
        Some(self.director)
    }

    fn integrand(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<f64> {
        let fr = frame(ctx, el)?;
        let n = director_values(ctx.field(self.director)?, el, self.name())?;
        let area = fr.area();

        // Component-wise constant gradient of the director over the face.
        let g: Vec<Vector3<f64>> = (0..3)
            .map(|c| fr.gradient_of(n[1][c] - n[0][c], n[2][c] - n[0][c]))
            .collect();
        let div = g[0][0] + g[1][1] + g[2][2];
        let curl = Vector3::new(g[2][1] - g[1][2], g[0][2] - g[2][0], g[1][0] - g[0][1]);

        let q = self.pitch.unwrap_or(0.0);
        let twist: [f64; 3] = [n[0].dot(&curl) + q, n[1].dot(&curl) + q, n[2].dot(&curl) + q];
        let bend: [Vector3<f64>; 3] = [n[0].cross(&curl), n[1].cross(&curl), n[2].cross(&curl)];

        let mut energy = 0.5 * self.ksplay * div * div * area;
        energy += 0.5 * self.ktwist * quad_pair(area, twist, twist);
        for c in 0..3 {
            let bc = [bend[0][c], bend[1][c], bend[2][c]];
            energy += 0.5 * self.kbend * quad_pair(area, bc, bc);
        }
        Ok(energy)
    }
}

/// Electrostatic coupling ∫ (n·E)² dA with E = ∇φ constant per face.
#[derive(Debug, Clone, Copy)]
pub struct NematicElectric {
    director: FieldId,
    potential: FieldId,
}

impl NematicElectric {
    pub fn new(director: FieldId, potential: FieldId) -> Self {
        Self { director, potential }
    }
}

impl Functional for NematicElectric {
    fn name(&self) -> &str {
        "NematicElectric"
    }

    fn grade(&self, _mesh: &Mesh) -> usize {
        2
    }

    fn field(&self) -> Option<FieldId> {
        Some(self.director)
    }

    fn integrand(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<f64> {
        let fr = frame(ctx, el)?;
        let n = director_values(ctx.field(self.director)?, el, self.name())?;
        let phi = ctx.field(self.potential)?;
        if phi.shape()[0] == 0 {
            return Err(MorphoError::FieldLayout(format!(
                "{} needs a scalar potential on vertices",
                self.name()
            )));
        }
        let p0 = phi.get(0, el.vertices[0], 0, 0)?;
        let p1 = phi.get(0, el.vertices[1], 0, 0)?;
        let p2 = phi.get(0, el.vertices[2], 0, 0)?;
        let e = fr.gradient_of(p1 - p0, p2 - p0);
        let t: [f64; 3] = [n[0].dot(&e), n[1].dot(&e), n[2].dot(&e)];
        Ok(quad_pair(fr.area(), t, t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldPrototype;
    use crate::functional::evaluate;
    use crate::functional::tests_support::unit_triangle;

    fn uniform_director(mesh: &Mesh, n: [f64; 3]) -> Field {
        let mut d = Field::with_dof(mesh, FieldPrototype::Vector(3), [1, 0, 0, 0]);
        for v in 0..mesh.vertex_count() {
            for c in 0..3 {
                d.set(0, v, 0, c, n[c]).unwrap();
            }
        }
        d
    }

    #[test]
    fn uniform_director_has_no_elastic_energy() {
        let mesh = unit_triangle();
        let fields = vec![uniform_director(&mesh, [0.0, 0.0, 1.0])];
        let f = Nematic::new(FieldId(0));
        let total = evaluate::total(&f, &mesh, &fields, None).unwrap();
        assert!(total.abs() < 1e-14);
    }

    #[test]
    fn cholesteric_pitch_costs_twist() {
        let mesh = unit_triangle();
        let fields = vec![uniform_director(&mesh, [0.0, 0.0, 1.0])];
        let q = 0.7;
        let f = Nematic::with_constants(FieldId(0), 1.0, 2.0, 1.0, Some(q));
        let total = evaluate::total(&f, &mesh, &fields, None).unwrap();
        // ½ k₂ q² × area.
        let expected = 0.5 * 2.0 * q * q * 0.5;
        assert!((total - expected).abs() < 1e-12);
    }

    #[test]
    fn nematic_electric_on_unit_triangle() {
        let mesh = unit_triangle();
        let s = 1.0 / 2.0f64.sqrt();
        let director = uniform_director(&mesh, [s, s, 0.0]);
        let mut phi = Field::scalar(&mesh);
        phi.set(0, 1, 0, 0, 1.0).unwrap();
        let fields = vec![director, phi];

        let f = NematicElectric::new(FieldId(0), FieldId(1));
        let row = evaluate::integrand(&f, &mesh, &fields, None).unwrap();
        assert!((row[0] - 0.25).abs() < 1e-12);
        let total = evaluate::total(&f, &mesh, &fields, None).unwrap();
        assert!((total - 0.25).abs() < 1e-12);

        let grad = evaluate::gradient(&f, &mesh, &fields, None).unwrap();
        let expected = [
            [0.75, -0.25, -0.5], // ∂E/∂x per vertex
            [-0.25, 0.0, 0.25],  // ∂E/∂y
            [0.0, 0.0, 0.0],
        ];
        for d in 0..3 {
            for v in 0..3 {
                assert!(
                    (grad[[d, v]] - expected[d][v]).abs() < 1e-5,
                    "({d},{v}): {} vs {}",
                    grad[[d, v]],
                    expected[d][v]
                );
            }
        }
    }
}
