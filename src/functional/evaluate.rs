//! Traversal and assembly: integrand rows, Kahan-compensated totals, and
//! gradient matrices for any [`Functional`].
//!
//! Elements are visited in ascending id order; symmetry images are skipped
//! during integration and folded back in after gradient assembly when the
//! functional declares [`Symmetry::Add`].

use std::collections::BTreeSet;

use ndarray::{Array1, Array2};

use crate::errors::{MorphoError, MorphoResult};
use crate::field::Field;
use crate::functional::{Element, EvalContext, Functional, Symmetry, GRAD_STEP};
use crate::linalg::KahanSum;
use crate::mesh::{ElementTable, Mesh};
use crate::selection::Selection;

/// Elements the functional acts on: the grade's table plus the active id
/// list (selection-restricted, symmetry images removed).
fn active_elements(
    f: &dyn Functional,
    mesh: &Mesh,
    sel: Option<&Selection>,
) -> MorphoResult<(ElementTable, Vec<usize>)> {
    let grade = f.grade(mesh);
    let table = mesh.element_table(grade)?;
    let images = mesh.images(grade);
    let ids: Vec<usize> = match sel {
        Some(s) => s.ids(grade),
        None => (0..table.count()).collect(),
    };
    let ids = ids
        .into_iter()
        .filter(|id| images.binary_search(id).is_err())
        .collect();
    Ok((table, ids))
}

/// One scalar per element of the functional's native grade; unselected and
/// image elements read zero.
pub fn integrand(
    f: &dyn Functional,
    mesh: &Mesh,
    fields: &[Field],
    sel: Option<&Selection>,
) -> MorphoResult<Array1<f64>> {
    let (table, ids) = active_elements(f, mesh, sel)?;
    let ctx = EvalContext::new(mesh, fields);
    let mut out = Array1::zeros(table.count());
    for id in ids {
        out[id] = f.integrand(&ctx, Element { id, vertices: table.vertices(id) })?;
    }
    Ok(out)
}

/// Kahan-compensated sum of the integrand in ascending element order.
pub fn total(
    f: &dyn Functional,
    mesh: &Mesh,
    fields: &[Field],
    sel: Option<&Selection>,
) -> MorphoResult<f64> {
    let (table, ids) = active_elements(f, mesh, sel)?;
    let ctx = EvalContext::new(mesh, fields);
    let mut sum = KahanSum::new();
    for id in ids {
        sum.add(f.integrand(&ctx, Element { id, vertices: table.vertices(id) })?);
    }
    Ok(sum.total())
}

/// D×N matrix of vertex-position partial derivatives.
pub fn gradient(
    f: &dyn Functional,
    mesh: &Mesh,
    fields: &[Field],
    sel: Option<&Selection>,
) -> MorphoResult<Array2<f64>> {
    let (table, ids) = active_elements(f, mesh, sel)?;
    let mut out = Array2::zeros((mesh.dim(), mesh.vertex_count()));
    if f.analytic_gradient() {
        let ctx = EvalContext::new(mesh, fields);
        for &id in &ids {
            f.gradient(&ctx, Element { id, vertices: table.vertices(id) }, &mut out)?;
        }
    } else {
        numerical_gradient(f, mesh, fields, &table, &ids, &mut out)?;
    }
    if f.symmetry() == Symmetry::Add {
        apply_symmetry_add(mesh, &mut out);
    }
    Ok(out)
}

/// Field-shaped partial derivatives with respect to the consumed field's
/// components.
pub fn field_gradient(
    f: &dyn Functional,
    mesh: &Mesh,
    fields: &[Field],
    sel: Option<&Selection>,
) -> MorphoResult<Field> {
    let target = f
        .field()
        .ok_or_else(|| MorphoError::NoField(f.name().to_string()))?;
    let (table, ids) = active_elements(f, mesh, sel)?;
    let mut out = fields
        .get(target.0)
        .ok_or(MorphoError::OutOfBounds { what: "field", index: target.0, len: fields.len() })?
        .zero_like();
    if f.analytic_field_gradient() {
        let ctx = EvalContext::new(mesh, fields);
        for &id in &ids {
            f.field_gradient(&ctx, Element { id, vertices: table.vertices(id) }, &mut out)?;
        }
        return Ok(out);
    }

    // Central differences on a scratch copy of the field storage.
    let grade = f.grade(mesh);
    let mut scratch: Vec<Field> = fields.to_vec();
    let base = EvalContext::new(mesh, fields);
    for &id in &ids {
        let el = Element { id, vertices: table.vertices(id) };
        let mut indices: BTreeSet<usize> = scratch[target.0].dof_range(grade, id).collect();
        let mut verts: BTreeSet<usize> = el.vertices.iter().copied().collect();
        verts.extend(f.dependencies(&base, el)?);
        for v in verts {
            indices.extend(scratch[target.0].dof_range(0, v));
        }
        for k in indices {
            let orig = scratch[target.0].raw(k);
            scratch[target.0].set_raw(k, orig + GRAD_STEP);
            let fp = {
                let ctx = EvalContext::new(mesh, &scratch);
                f.integrand(&ctx, el)
            };
            scratch[target.0].set_raw(k, orig - GRAD_STEP);
            let fm = {
                let ctx = EvalContext::new(mesh, &scratch);
                f.integrand(&ctx, el)
            };
            scratch[target.0].set_raw(k, orig);
            out.data_mut()[k] += (fp? - fm?) / (2.0 * GRAD_STEP);
        }
    }
    Ok(out)
}

fn numerical_gradient(
    f: &dyn Functional,
    mesh: &Mesh,
    fields: &[Field],
    table: &ElementTable,
    ids: &[usize],
    out: &mut Array2<f64>,
) -> MorphoResult<()> {
    let dim = mesh.dim();
    let mut scratch = mesh.vertex_matrix().to_owned();
    let base = EvalContext::new(mesh, fields);
    for &id in ids {
        let el = Element { id, vertices: table.vertices(id) };
        let mut verts: BTreeSet<usize> = el.vertices.iter().copied().collect();
        verts.extend(f.dependencies(&base, el)?);
        for v in verts {
            for d in 0..dim {
                let orig = scratch[[d, v]];
                scratch[[d, v]] = orig + GRAD_STEP;
                let fp = {
                    let ctx = EvalContext::with_positions(mesh, scratch.view(), fields);
                    f.integrand(&ctx, el)
                };
                scratch[[d, v]] = orig - GRAD_STEP;
                let fm = {
                    let ctx = EvalContext::with_positions(mesh, scratch.view(), fields);
                    f.integrand(&ctx, el)
                };
                scratch[[d, v]] = orig;
                out[[d, v]] += (fp? - fm?) / (2.0 * GRAD_STEP);
            }
        }
    }
    Ok(())
}

/// Writes the pair sum to both entries of every symmetry-identified vertex
/// pair.
fn apply_symmetry_add(mesh: &Mesh, out: &mut Array2<f64>) {
    let dim = out.nrows();
    for (i, j) in mesh.symmetry_pairs(0) {
        for d in 0..dim {
            let sum = out[[d, i]] + out[[d, j]];
            out[[d, i]] = sum;
            out[[d, j]] = sum;
        }
    }
}
