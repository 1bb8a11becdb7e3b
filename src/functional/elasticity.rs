//! Linear (small-strain) elasticity against a reference mesh. Strain comes
//! from the Gram matrices of the reference and deformed simplex edge
//! vectors, so the energy is invariant under rigid motions of either
//! configuration.

use nalgebra::DMatrix;

use crate::errors::{MorphoError, MorphoResult};
use crate::functional::geometry::simplex_size;
use crate::functional::{Element, EvalContext, Functional};
use crate::mesh::Mesh;
use crate::refine::{Parentage, RefineMap};

/// Gram matrix of the edge vectors x_i − x_0 of one simplex.
fn edge_gram(positions: &ndarray::ArrayView2<'_, f64>, vids: &[usize]) -> DMatrix<f64> {
    let g = vids.len() - 1;
    let x0 = crate::linalg::vertex3(positions, vids[0]);
    let sides: Vec<_> = (1..=g)
        .map(|i| crate::linalg::vertex3(positions, vids[i]) - x0)
        .collect();
    DMatrix::from_fn(g, g, |i, j| sides[i].dot(&sides[j]))
}

#[derive(Debug, Clone)]
pub struct LinearElasticity {
    reference: Mesh,
    pub poisson: f64,
}

impl LinearElasticity {
    pub fn new(reference: Mesh) -> Self {
        Self { reference, poisson: 0.3 }
    }

    pub fn with_poisson(reference: Mesh, poisson: f64) -> Self {
        Self { reference, poisson }
    }

    pub fn reference(&self) -> &Mesh {
        &self.reference
    }

    /// Lamé coefficients for unit Young's modulus.
    fn lame(&self) -> (f64, f64) {
        let nu = self.poisson;
        let mu = 0.5 / (1.0 + nu);
        let lambda = nu / ((1.0 + nu) * (1.0 - 2.0 * nu));
        (mu, lambda)
    }
}

impl Functional for LinearElasticity {
    fn name(&self) -> &str {
        "LinearElasticity"
    }

    fn grade(&self, _mesh: &Mesh) -> usize {
        self.reference.max_grade()
    }

    fn integrand(&self, ctx: &EvalContext<'_>, el: Element<'_>) -> MorphoResult<f64> {
        let grade = self.reference.max_grade();
        let count = self.reference.count(grade);
        if el.id >= count {
            return Err(MorphoError::OutOfBounds {
                what: "reference element",
                index: el.id,
                len: count,
            });
        }
        let ref_table = self.reference.element_table(grade)?;
        let ref_vids = ref_table.vertices(el.id);
        let ref_positions = self.reference.vertex_matrix();

        let gram_ref = edge_gram(&ref_positions, ref_vids);
        let gram_def = edge_gram(&ctx.positions, el.vertices);
        let gram_ref_inv = gram_ref
            .try_inverse()
            .ok_or(MorphoError::Singular("elastic reference Gram"))?;

        let r = gram_def * gram_ref_inv;
        let strain = (r - DMatrix::identity(grade, grade)) * 0.5;
        let tr = strain.trace();
        let tr_sq = (&strain * &strain).trace();

        let (mu, lambda) = self.lame();
        let weight = simplex_size(&ref_positions, ref_vids);
        Ok(weight * (mu * tr_sq + 0.5 * lambda * tr * tr))
    }

    fn refresh_after_refine(&mut self, map: &RefineMap, new_mesh: &Mesh) -> MorphoResult<()> {
        let dim = self.reference.dim();
        let old = self.reference.positions().to_vec();
        let mut coords = Vec::with_capacity(new_mesh.vertex_count() * dim);
        for parent in map.parents(0) {
            match parent {
                Parentage::Copy(i) => coords.extend_from_slice(&old[i * dim..(i + 1) * dim]),
                Parentage::Midpoint(a, b) => {
                    for d in 0..dim {
                        coords.push(0.5 * (old[a * dim + d] + old[b * dim + d]));
                    }
                }
                Parentage::Average(ids) => {
                    for d in 0..dim {
                        let sum: f64 = ids.iter().map(|&i| old[i * dim + d]).sum();
                        coords.push(sum / ids.len() as f64);
                    }
                }
            }
        }
        self.reference = new_mesh.with_positions_like(coords)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functional::evaluate;
    use crate::functional::tests_support::unit_triangle;

    #[test]
    fn zero_energy_at_reference() {
        let mesh = unit_triangle();
        let f = LinearElasticity::new(mesh.clone());
        let total = evaluate::total(&f, &mesh, &[], None).unwrap();
        assert!(total.abs() < 1e-14);
    }

    #[test]
    fn stretch_costs_energy() {
        let reference = unit_triangle();
        let mut stretched = reference.clone();
        stretched.set_vertex(1, &[1.3, 0.0, 0.0]).unwrap();
        let f = LinearElasticity::new(reference);
        let total = evaluate::total(&f, &stretched, &[], None).unwrap();
        assert!(total > 1e-4);
    }

    #[test]
    fn rigid_rotation_costs_nothing() {
        let reference = unit_triangle();
        let theta: f64 = 0.7;
        let (s, c) = theta.sin_cos();
        let mut rotated = reference.clone();
        rotated.set_vertex(1, &[c, s, 0.0]).unwrap();
        rotated.set_vertex(2, &[-s, c, 0.0]).unwrap();
        let f = LinearElasticity::new(reference);
        let total = evaluate::total(&f, &rotated, &[], None).unwrap();
        assert!(total.abs() < 1e-12);
    }

    #[test]
    fn segment_stretch_energy_matches_closed_form() {
        let mut reference = crate::mesh::Mesh::from_positions(3, &[0.0, 0.0, 0.0, 2.0, 0.0, 0.0]).unwrap();
        reference.add_element(1, &[0, 1]).unwrap();
        let mut deformed = reference.clone();
        deformed.set_vertex(1, &[3.0, 0.0, 0.0]).unwrap();

        let nu = 0.25;
        let f = LinearElasticity::with_poisson(reference, nu);
        let total = evaluate::total(&f, &deformed, &[], None).unwrap();

        // R = (3/2)², C = (R − 1)/2, energy = L_ref (μ C² + ½ λ C²).
        let mu = 0.5 / (1.0 + nu);
        let lambda = nu / ((1.0 + nu) * (1.0 - 2.0 * nu));
        let c = (2.25 - 1.0) / 2.0;
        let expected = 2.0 * (mu * c * c + 0.5 * lambda * c * c);
        assert!((total - expected).abs() < 1e-12);
    }
}
