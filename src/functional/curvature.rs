//! Discrete curvature integrands. All gradients are numerical; each
//! functional reports the neighborhood vertices whose motion reaches its
//! integrand through [`Functional::dependencies`].

use std::collections::BTreeSet;
use std::f64::consts::PI;

use nalgebra::Vector3;

use crate::errors::MorphoResult;
use crate::functional::{Element, EvalContext, Functional};
use crate::mesh::Mesh;
use crate::EPS;

/// The vertex itself plus its symmetry synonyms.
fn vertex_orbit(mesh: &Mesh, v: usize) -> BTreeSet<usize> {
    let mut orbit: BTreeSet<usize> = mesh.synonyms(0, v).into_iter().collect();
    orbit.insert(v);
    orbit
}

/// Edges incident on any vertex of the orbit, each reported as
/// (orbit endpoint, outward endpoint, edge id). Edges lying entirely inside
/// the orbit are dropped.
fn incident_edges(
    ctx: &EvalContext<'_>,
    orbit: &BTreeSet<usize>,
) -> MorphoResult<Vec<(usize, usize, usize)>> {
    let table = ctx.mesh.element_table(1)?;
    let mut edges = BTreeSet::new();
    for &u in orbit {
        edges.extend(ctx.mesh.find_neighbors(0, u, 1)?);
    }
    let mut out = Vec::new();
    for e in edges {
        let verts = table.vertices(e);
        let inside: Vec<usize> = verts.iter().copied().filter(|v| orbit.contains(v)).collect();
        if inside.len() == 1 {
            let u = inside[0];
            let w = *verts.iter().find(|&&v| !orbit.contains(&v)).expect("one endpoint outside");
            out.push((u, w, e));
        }
    }
    Ok(out)
}

fn angle(a: Vector3<f64>, b: Vector3<f64>) -> f64 {
    a.cross(&b).norm().atan2(a.dot(&b))
}

/// Integrated squared curvature of a curve, vertex-centered: the turning
/// angle between the two adjacent edges squared over the half-sum of their
/// lengths. With `pointwise` set the bare squared curvature is reported
/// instead of the integrated density.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineCurvatureSq {
    pub pointwise: bool,
}

impl LineCurvatureSq {
    pub fn new() -> Self {
        Self { pointwise: false }
    }

    pub fn pointwise() -> Self {
        Self { pointwise: true }
    }
}

impl Functional for LineCurvatureSq {
    fn name(&self) -> &str {
        "LineCurvatureSq"
    }

    fn grade(&self, _mesh: &Mesh) -> usize {
        0
    }

    fn integrand(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<f64> {
        let orbit = vertex_orbit(ctx.mesh, el.id);
        let edges = incident_edges(ctx, &orbit)?;
        if edges.len() != 2 {
            return Ok(0.0);
        }
        let (u1, w1, _) = edges[0];
        let (u2, w2, _) = edges[1];
        // Tangents along the path w1 -> v -> w2.
        let t1 = ctx.pos(u1) - ctx.pos(w1);
        let t2 = ctx.pos(w2) - ctx.pos(u2);
        let theta = angle(t1, t2);
        let len = 0.5 * (t1.norm() + t2.norm());
        if len < EPS {
            return Ok(0.0);
        }
        let density = theta * theta / len;
        Ok(if self.pointwise { density / len } else { density })
    }

    fn dependencies(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<Vec<usize>> {
        let orbit = vertex_orbit(ctx.mesh, el.id);
        Ok(incident_edges(ctx, &orbit)?.into_iter().map(|(_, w, _)| w).collect())
    }
}

/// Integrated squared torsion of a curve, edge-centered: needs the two
/// edges flanking this one, assembled in path order through synonym lookup.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineTorsionSq;

impl LineTorsionSq {
    pub fn new() -> Self {
        Self
    }
}

impl LineTorsionSq {
    /// Flanking outward vertices (w0 adjacent to v1, w3 adjacent to v2) with
    /// the orbit endpoints they attach through.
    fn flanks(
        ctx: &EvalContext<'_>,
        el: Element<'_>,
    ) -> MorphoResult<Option<((usize, usize), (usize, usize))>> {
        let v1 = el.vertices[0];
        let v2 = el.vertices[1];
        let pair: BTreeSet<usize> = el.vertices.iter().copied().collect();
        let pick = |orbit: &BTreeSet<usize>| -> MorphoResult<Option<(usize, usize)>> {
            for (u, w, e) in incident_edges(ctx, orbit)? {
                if e != el.id && !pair.contains(&w) {
                    return Ok(Some((u, w)));
                }
            }
            Ok(None)
        };
        let prev = pick(&vertex_orbit(ctx.mesh, v1))?;
        let next = pick(&vertex_orbit(ctx.mesh, v2))?;
        Ok(prev.zip(next))
    }
}

impl Functional for LineTorsionSq {
    fn name(&self) -> &str {
        "LineTorsionSq"
    }

    fn grade(&self, _mesh: &Mesh) -> usize {
        1
    }

    fn integrand(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<f64> {
        let Some(((u1, w0), (u2, w3))) = Self::flanks(ctx, el)? else {
            return Ok(0.0);
        };
        let s0 = ctx.pos(u1) - ctx.pos(w0);
        let s1 = ctx.pos(el.vertices[1]) - ctx.pos(el.vertices[0]);
        let s2 = ctx.pos(w3) - ctx.pos(u2);
        let n1 = s0.cross(&s1);
        let n2 = s1.cross(&s2);
        let b = s1.norm();
        if n1.norm() < EPS || n2.norm() < EPS || b < EPS {
            return Ok(0.0);
        }
        let sin_theta = (n1.cross(&n2).dot(&s1) / (n1.norm() * n2.norm() * b)).clamp(-1.0, 1.0);
        let theta = sin_theta.asin();
        Ok(theta * theta / b)
    }

    fn dependencies(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<Vec<usize>> {
        Ok(match Self::flanks(ctx, el)? {
            Some(((_, w0), (_, w3))) => vec![w0, w3],
            None => Vec::new(),
        })
    }
}

/// Incident faces of the orbit: (orbit vertex, other two vertices, face id).
fn incident_faces(
    ctx: &EvalContext<'_>,
    orbit: &BTreeSet<usize>,
) -> MorphoResult<Vec<(usize, [usize; 2], usize)>> {
    let table = ctx.mesh.element_table(2)?;
    let mut faces = BTreeSet::new();
    for &u in orbit {
        faces.extend(ctx.mesh.find_neighbors(0, u, 2)?);
    }
    let mut out = Vec::new();
    for f in faces {
        let verts = table.vertices(f);
        let inside: Vec<usize> = verts.iter().copied().filter(|v| orbit.contains(v)).collect();
        if inside.len() == 1 {
            let rest: Vec<usize> = verts.iter().copied().filter(|v| !orbit.contains(v)).collect();
            out.push((inside[0], [rest[0], rest[1]], f));
        }
    }
    Ok(out)
}

/// Squared mean curvature of a triangulated surface, vertex-centered: the
/// squared norm of the incident-area gradient over four times the vertex
/// area (one third of the incident triangle area).
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanCurvatureSq;

impl MeanCurvatureSq {
    pub fn new() -> Self {
        Self
    }
}

impl Functional for MeanCurvatureSq {
    fn name(&self) -> &str {
        "MeanCurvatureSq"
    }

    fn grade(&self, _mesh: &Mesh) -> usize {
        0
    }

    fn integrand(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<f64> {
        let orbit = vertex_orbit(ctx.mesh, el.id);
        let mut force = Vector3::zeros();
        let mut area_sum = 0.0;
        for (u, [a, b], _) in incident_faces(ctx, &orbit)? {
            let s0 = ctx.pos(a) - ctx.pos(u);
            let s1 = ctx.pos(b) - ctx.pos(a);
            let c = s0.cross(&s1);
            let norm = c.norm();
            if norm < EPS {
                continue;
            }
            force += 0.5 * s1.cross(&c) / norm;
            area_sum += 0.5 * norm;
        }
        let vertex_area = area_sum / 3.0;
        if vertex_area < EPS {
            return Ok(0.0);
        }
        Ok(force.norm_squared() / (4.0 * vertex_area))
    }

    fn dependencies(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<Vec<usize>> {
        let orbit = vertex_orbit(ctx.mesh, el.id);
        let mut deps = BTreeSet::new();
        for (_, [a, b], _) in incident_faces(ctx, &orbit)? {
            deps.insert(a);
            deps.insert(b);
        }
        Ok(deps.into_iter().collect())
    }
}

/// Gaussian curvature as the angle defect 2π − Σ θ at each vertex; with
/// `pointwise` set the defect is divided by the vertex area.
#[derive(Debug, Default, Clone, Copy)]
pub struct GaussCurvature {
    pub pointwise: bool,
}

impl GaussCurvature {
    pub fn new() -> Self {
        Self { pointwise: false }
    }

    pub fn pointwise() -> Self {
        Self { pointwise: true }
    }
}

impl Functional for GaussCurvature {
    fn name(&self) -> &str {
        "GaussCurvature"
    }

    fn grade(&self, _mesh: &Mesh) -> usize {
        0
    }

    fn integrand(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<f64> {
        let orbit = vertex_orbit(ctx.mesh, el.id);
        let mut angle_sum = 0.0;
        let mut area_sum = 0.0;
        for (u, [a, b], _) in incident_faces(ctx, &orbit)? {
            let ea = ctx.pos(a) - ctx.pos(u);
            let eb = ctx.pos(b) - ctx.pos(u);
            angle_sum += angle(ea, eb);
            area_sum += 0.5 * ea.cross(&eb).norm();
        }
        let defect = 2.0 * PI - angle_sum;
        if self.pointwise {
            let vertex_area = area_sum / 3.0;
            if vertex_area < EPS {
                return Ok(0.0);
            }
            Ok(defect / vertex_area)
        } else {
            Ok(defect)
        }
    }

    fn dependencies(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<Vec<usize>> {
        let orbit = vertex_orbit(ctx.mesh, el.id);
        let mut deps = BTreeSet::new();
        for (_, [a, b], _) in incident_faces(ctx, &orbit)? {
            deps.insert(a);
            deps.insert(b);
        }
        Ok(deps.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functional::evaluate;
    use crate::mesh::Mesh;

    fn open_path(points: &[[f64; 3]]) -> Mesh {
        let coords: Vec<f64> = points.iter().flatten().copied().collect();
        let mut mesh = Mesh::from_positions(3, &coords).unwrap();
        for i in 0..points.len() - 1 {
            mesh.add_element(1, &[i, i + 1]).unwrap();
        }
        mesh
    }

    #[test]
    fn right_angle_turn() {
        let mesh = open_path(&[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0]]);
        let total = evaluate::total(&LineCurvatureSq::new(), &mesh, &[], None).unwrap();
        let expected = (PI / 2.0) * (PI / 2.0);
        assert!((total - expected).abs() < 1e-10);

        let bare = evaluate::total(&LineCurvatureSq::pointwise(), &mesh, &[], None).unwrap();
        assert!((bare - expected).abs() < 1e-10);
    }

    #[test]
    fn polygon_curvature_approximates_circle() {
        let n = 64;
        let points: Vec<[f64; 3]> = (0..n)
            .map(|i| {
                let t = 2.0 * PI * (i as f64) / (n as f64);
                [t.cos(), t.sin(), 0.0]
            })
            .collect();
        let coords: Vec<f64> = points.iter().flatten().copied().collect();
        let mut mesh = Mesh::from_positions(3, &coords).unwrap();
        for i in 0..n {
            mesh.add_element(1, &[i, (i + 1) % n]).unwrap();
        }
        let total = evaluate::total(&LineCurvatureSq::new(), &mesh, &[], None).unwrap();
        // ∫ κ² ds over a unit circle is 2π.
        assert!((total - 2.0 * PI).abs() / (2.0 * PI) < 1e-2);
    }

    #[test]
    fn torsion_vanishes_on_planar_z_path() {
        let mesh = open_path(&[
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0],
            [2.0, 1.0, 0.0],
        ]);
        let total = evaluate::total(&LineTorsionSq::new(), &mesh, &[], None).unwrap();
        assert!(total.abs() < 1e-12);
    }

    #[test]
    fn torsion_positive_off_plane() {
        let mesh = open_path(&[
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0],
            [1.0, 1.0, 1.0],
        ]);
        let total = evaluate::total(&LineTorsionSq::new(), &mesh, &[], None).unwrap();
        assert!(total > 1e-4);
    }

    #[test]
    fn flat_fan_has_zero_mean_curvature() {
        let mut mesh = Mesh::from_positions(
            3,
            &[
                0.5, 0.5, 0.0, // center
                0.0, 0.0, 0.0, //
                1.0, 0.0, 0.0, //
                1.0, 1.0, 0.0, //
                0.0, 1.0, 0.0,
            ],
        )
        .unwrap();
        for i in 0..4 {
            mesh.add_element(2, &[0, 1 + i, 1 + (i + 1) % 4]).unwrap();
        }
        let row = evaluate::integrand(&MeanCurvatureSq::new(), &mesh, &[], None).unwrap();
        assert!(row[0].abs() < 1e-15);
    }

    #[test]
    fn octahedron_total_angle_defect_is_four_pi() {
        let mut mesh = Mesh::from_positions(
            3,
            &[
                1.0, 0.0, 0.0, //
                -1.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, //
                0.0, -1.0, 0.0, //
                0.0, 0.0, 1.0, //
                0.0, 0.0, -1.0,
            ],
        )
        .unwrap();
        for &(a, b, c) in &[
            (0, 2, 4),
            (0, 2, 5),
            (0, 3, 4),
            (0, 3, 5),
            (1, 2, 4),
            (1, 2, 5),
            (1, 3, 4),
            (1, 3, 5),
        ] {
            mesh.add_element(2, &[a, b, c]).unwrap();
        }
        let total = evaluate::total(&GaussCurvature::new(), &mesh, &[], None).unwrap();
        assert!((total - 4.0 * PI).abs() < 1e-6);
    }
}
