//! Edge-midpoint refinement. Midpoints are keyed by their parent vertex
//! pair, which gives exact coincidence detection across elements sharing a
//! side. The result bundles the new mesh with a per-grade refinement map
//! relating every new element to its parents, which carries fields and
//! selections forward and lets the problem rebind its references.

use std::collections::{BTreeMap, BTreeSet};

use crate::errors::{MorphoError, MorphoResult};
use crate::field::Field;
use crate::linalg::sparse::Sparse;
use crate::mesh::{Mesh, MAX_GRADE};
use crate::selection::Selection;

/// How one new element relates to the pre-refinement mesh.
#[derive(Debug, Clone)]
pub enum Parentage {
    /// Verbatim copy of one old element of the same grade.
    Copy(usize),
    /// Field values average over these old elements of the same grade.
    Average(Vec<usize>),
    /// A new vertex at the midpoint of two old vertices.
    Midpoint(usize, usize),
}

#[derive(Debug, Default)]
pub struct RefineMap {
    grades: [Vec<Parentage>; 4],
}

impl RefineMap {
    pub fn parents(&self, grade: usize) -> &[Parentage] {
        &self.grades[grade]
    }
}

/// A refined mesh plus the map back to its parent.
pub struct Refined {
    pub mesh: Mesh,
    pub map: RefineMap,
}

/// Refines a mesh by splitting element sides at their midpoints. With a
/// selection, only sides of selected elements are split; neighbors sharing a
/// split side are subdivided as needed to keep the mesh conforming.
pub fn refine(mesh: &Mesh, selection: Option<&Selection>) -> MorphoResult<Refined> {
    if mesh.count(3) > 0 {
        return Err(MorphoError::Unsupported("refinement of solid meshes"));
    }
    let dim = mesh.dim();
    let has_edges = mesh.count(1) > 0;
    let has_faces = mesh.count(2) > 0;

    let mut out = Mesh::new(dim);
    let mut map = RefineMap::default();

    // Seed with every original vertex, ids preserved.
    for v in 0..mesh.vertex_count() {
        out.add_vertex(&mesh.positions()[v * dim..(v + 1) * dim])?;
        map.grades[0].push(Parentage::Copy(v));
    }

    // Vertex pairs whose midpoints we must create.
    let mut pairs: BTreeSet<(usize, usize)> = BTreeSet::new();
    let side = |a: usize, b: usize| (a.min(b), a.max(b));
    if has_edges {
        let edges = mesh.element_table(1)?;
        let ids: Vec<usize> = match selection {
            Some(sel) => sel.ids(1),
            None => (0..edges.count()).collect(),
        };
        for e in ids {
            let v = edges.vertices(e);
            pairs.insert(side(v[0], v[1]));
        }
    }
    if has_faces {
        let faces = mesh.element_table(2)?;
        let ids: Vec<usize> = match selection {
            Some(sel) => sel.ids(2),
            None => (0..faces.count()).collect(),
        };
        for f in ids {
            let v = faces.vertices(f);
            pairs.insert(side(v[0], v[1]));
            pairs.insert(side(v[0], v[2]));
            pairs.insert(side(v[1], v[2]));
        }
    }

    let mut midpoints: BTreeMap<(usize, usize), usize> = BTreeMap::new();
    for &(a, b) in &pairs {
        let coords: Vec<f64> = (0..dim)
            .map(|d| 0.5 * (mesh.positions()[a * dim + d] + mesh.positions()[b * dim + d]))
            .collect();
        let id = out.add_vertex(&coords)?;
        map.grades[0].push(Parentage::Midpoint(a, b));
        midpoints.insert((a, b), id);
    }

    // Split line elements at their midpoints.
    if has_edges {
        let edges = mesh.element_table(1)?;
        for e in 0..edges.count() {
            let v = edges.vertices(e);
            match midpoints.get(&side(v[0], v[1])) {
                Some(&m) => {
                    out.add_element(1, &[v[0], m])?;
                    map.grades[1].push(Parentage::Average(vec![e]));
                    out.add_element(1, &[m, v[1]])?;
                    map.grades[1].push(Parentage::Average(vec![e]));
                }
                None => {
                    out.add_element(1, &[v[0], v[1]])?;
                    map.grades[1].push(Parentage::Copy(e));
                }
            }
        }
    }

    // Split faces according to which of their sides were refined.
    if has_faces {
        let faces = mesh.element_table(2)?;
        let edge_lookup: BTreeMap<(usize, usize), usize> = if has_edges {
            let edges = mesh.element_table(1)?;
            (0..edges.count())
                .map(|e| {
                    let v = edges.vertices(e);
                    (side(v[0], v[1]), e)
                })
                .collect()
        } else {
            BTreeMap::new()
        };

        for f in 0..faces.count() {
            let v = faces.vertices(f);
            let (v0, v1, v2) = (v[0], v[1], v[2]);
            let face_edges: Vec<usize> = [side(v0, v1), side(v0, v2), side(v1, v2)]
                .iter()
                .filter_map(|key| edge_lookup.get(key).copied())
                .collect();
            let mid = |a: usize, b: usize| midpoints.get(&side(a, b)).copied();

            let mut new_faces: Vec<[usize; 3]> = Vec::new();
            let mut new_edges: Vec<[usize; 2]> = Vec::new();
            match (mid(v0, v1), mid(v0, v2), mid(v1, v2)) {
                (None, None, None) => {
                    out.add_element(2, &[v0, v1, v2])?;
                    map.grades[2].push(Parentage::Copy(f));
                }
                (Some(m01), Some(m02), Some(m12)) => {
                    new_faces.extend([
                        [v0, m01, m02],
                        [v1, m01, m12],
                        [v2, m02, m12],
                        [m01, m12, m02],
                    ]);
                    new_edges.extend([[m01, m02], [m01, m12], [m02, m12]]);
                }
                (one, two, three) => {
                    let refined: Vec<((usize, usize), usize)> = [
                        ((v0, v1), one),
                        ((v0, v2), two),
                        ((v1, v2), three),
                    ]
                    .into_iter()
                    .filter_map(|(pair, m)| m.map(|m| (pair, m)))
                    .collect();
                    if refined.len() == 1 {
                        // One side split: join the midpoint to the opposite
                        // vertex.
                        let ((a, b), m) = refined[0];
                        let c = [v0, v1, v2]
                            .into_iter()
                            .find(|&x| x != a && x != b)
                            .expect("triangle has a vertex off the split side");
                        new_faces.extend([[a, m, c], [m, b, c]]);
                        new_edges.push([m, c]);
                    } else {
                        // Two sides split: both share a vertex; cut off its
                        // corner and split the remaining quadrilateral.
                        let ((a1, b1), m1) = refined[0];
                        let ((a2, b2), m2) = refined[1];
                        let s = if a1 == a2 || a1 == b2 { a1 } else { b1 };
                        let x = if a1 == s { b1 } else { a1 };
                        let y = if a2 == s { b2 } else { a2 };
                        new_faces.extend([[s, m1, m2], [m1, x, y], [m1, y, m2]]);
                        new_edges.extend([[m1, m2], [m1, y]]);
                    }
                }
            }

            for face in new_faces {
                out.add_element(2, &face)?;
                map.grades[2].push(Parentage::Average(vec![f]));
            }
            if has_edges {
                for edge in new_edges {
                    out.add_element(1, &edge)?;
                    map.grades[1].push(Parentage::Average(face_edges.clone()));
                }
            }
        }
    }

    // Carry symmetry identifications over to the elements that survived
    // intact. Original vertices keep their ids; higher-grade elements are
    // renumbered, so pairs are remapped through their Copy parents. Pairs
    // whose elements were split are dropped (midpoints of image edges are
    // not re-identified).
    for grade in 0..=MAX_GRADE {
        let pairs = mesh.symmetry_pairs(grade);
        if pairs.is_empty() {
            continue;
        }
        let mut surviving: BTreeMap<usize, usize> = BTreeMap::new();
        for (el, parent) in map.grades[grade].iter().enumerate() {
            if let Parentage::Copy(old) = parent {
                surviving.insert(*old, el);
            }
        }
        let mut sym = Sparse::new(out.count(grade), out.count(grade));
        for (i, j) in pairs {
            if let (Some(&a), Some(&b)) = (surviving.get(&i), surviving.get(&j)) {
                sym.set(a, b, 1.0);
            }
        }
        if sym.nnz() > 0 {
            sym.grow_to(out.count(grade), out.count(grade));
            out.add_symmetry(grade, sym)?;
        }
    }

    Ok(Refined { mesh: out, map })
}

impl Refined {
    /// Carries a field forward: new values average the parents' values;
    /// midpoint vertices average their two endpoints.
    pub fn field(&self, old: &Field) -> MorphoResult<Field> {
        let mut new = Field::with_dof(&self.mesh, old.prototype(), old.shape());
        for grade in 0..4 {
            let width = old.shape()[grade] * old.psize();
            if width == 0 {
                continue;
            }
            for (el, parent) in self.map.parents(grade).iter().enumerate() {
                let dst = new.dof_range(grade, el);
                for (k, idx) in dst.enumerate() {
                    let value = match parent {
                        Parentage::Copy(i) => {
                            let src = old.dof_range(grade, *i);
                            old.raw(src.start + k)
                        }
                        Parentage::Midpoint(a, b) => {
                            let sa = old.dof_range(grade, *a);
                            let sb = old.dof_range(grade, *b);
                            0.5 * (old.raw(sa.start + k) + old.raw(sb.start + k))
                        }
                        Parentage::Average(ids) => {
                            if ids.is_empty() {
                                0.0
                            } else {
                                let sum: f64 = ids
                                    .iter()
                                    .map(|&i| old.raw(old.dof_range(grade, i).start + k))
                                    .sum();
                                sum / ids.len() as f64
                            }
                        }
                    };
                    new.set_raw(idx, value);
                }
            }
        }
        Ok(new)
    }

    /// Carries a selection forward: a new element is selected only when all
    /// of its parents are.
    pub fn selection(&self, old: &Selection) -> Selection {
        let mut new = Selection::new();
        for grade in 0..4 {
            for (el, parent) in self.map.parents(grade).iter().enumerate() {
                let selected = match parent {
                    Parentage::Copy(i) => old.is_selected(grade, *i),
                    Parentage::Midpoint(a, b) => {
                        old.is_selected(0, *a) && old.is_selected(0, *b)
                    }
                    Parentage::Average(ids) => {
                        !ids.is_empty() && ids.iter().all(|&i| old.is_selected(grade, i))
                    }
                };
                if selected {
                    new.select(grade, el);
                }
            }
        }
        new
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functional::evaluate;
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
    fn uniform_refinement_counts() {
        let mesh = square_mesh();
        let (nv, ne, nf) = (mesh.vertex_count(), mesh.count(1), mesh.count(2));
        let refined = refine(&mesh, None).unwrap();
        assert_eq!(refined.mesh.vertex_count(), nv + ne);
        assert_eq!(refined.mesh.count(1), 2 * ne + 3 * nf);
        assert_eq!(refined.mesh.count(2), 4 * nf);
    }

    #[test]
    fn refinement_preserves_measures() {
        let mesh = square_mesh();
        let area = evaluate::total(&Area::new(), &mesh, &[], None).unwrap();
        let length = evaluate::total(&Length::new(), &mesh, &[], None).unwrap();
        let refined = refine(&mesh, None).unwrap();
        let area_after = evaluate::total(&Area::new(), &refined.mesh, &[], None).unwrap();
        assert!((area - area_after).abs() < 1e-10);
        // Every old edge is split in place, and new interior edges are added
        // on top, so the original length is a strict lower bound.
        let length_after = evaluate::total(&Length::new(), &refined.mesh, &[], None).unwrap();
        assert!(length_after > length - 1e-10);
    }

    #[test]
    fn constant_and_linear_fields_carry_through() {
        let mesh = square_mesh();
        let mut constant = Field::scalar(&mesh);
        constant.fill(3.25);
        let mut linear = Field::scalar(&mesh);
        for v in 0..mesh.vertex_count() {
            let x = mesh.positions()[v * 2];
            let y = mesh.positions()[v * 2 + 1];
            linear.set(0, v, 0, 0, 2.0 * x - y).unwrap();
        }

        let refined = refine(&mesh, None).unwrap();
        let constant_new = refined.field(&constant).unwrap();
        for v in 0..refined.mesh.vertex_count() {
            assert!((constant_new.get(0, v, 0, 0).unwrap() - 3.25).abs() < 1e-14);
        }
        let linear_new = refined.field(&linear).unwrap();
        for v in 0..refined.mesh.vertex_count() {
            let x = refined.mesh.positions()[v * 2];
            let y = refined.mesh.positions()[v * 2 + 1];
            assert!((linear_new.get(0, v, 0, 0).unwrap() - (2.0 * x - y)).abs() < 1e-14);
        }
    }

    #[test]
    fn selection_restricted_refinement_stays_conforming() {
        let mesh = square_mesh();
        let mut sel = Selection::new();
        sel.select(2, 0);
        let refined = refine(&mesh, Some(&sel)).unwrap();
        // Selected face splits 4-to-1; the neighbor sharing one refined side
        // splits in two.
        assert_eq!(refined.mesh.count(2), 6);
        assert_eq!(refined.mesh.vertex_count(), 4 + 3);
        let area = evaluate::total(&Area::new(), &refined.mesh, &[], None).unwrap();
        assert!((area - 1.0).abs() < 1e-12);
    }

    #[test]
    fn selection_carries_to_children() {
        let mesh = square_mesh();
        let mut sel = Selection::entire(&mesh);
        sel.deselect(2, 1);
        let refined = refine(&mesh, None).unwrap();
        let new_sel = refined.selection(&sel);
        // Children of face 0 stay selected, children of face 1 do not.
        assert_eq!(new_sel.count(2), 4);
        for f in new_sel.ids(2) {
            assert!(matches!(refined.map.parents(2)[f], Parentage::Average(ref ids) if ids == &[0]));
        }
    }

    #[test]
    fn symmetry_identifications_survive_refinement() {
        // Open chain whose endpoints are identified: vertex 2 is the image
        // of vertex 0.
        let mut mesh =
            Mesh::from_positions(3, &[0.0, 0.0, 0.0, 1.0, 0.3, 0.0, 2.0, 0.0, 0.0]).unwrap();
        mesh.add_element(1, &[0, 1]).unwrap();
        mesh.add_element(1, &[1, 2]).unwrap();
        let mut sym = Sparse::new(3, 3);
        sym.set(0, 2, 1.0);
        mesh.add_symmetry(0, sym).unwrap();

        let refined = refine(&mesh, None).unwrap();
        // Original vertices keep their ids, so the identified pair does too.
        assert_eq!(refined.mesh.symmetry_pairs(0), vec![(0, 2)]);
        assert_eq!(refined.mesh.images(0), vec![2]);

        // Force folding across the identified pair still happens after
        // refinement.
        let grad = evaluate::gradient(&Length::new(), &refined.mesh, &[], None).unwrap();
        for d in 0..3 {
            assert!((grad[[d, 0]] - grad[[d, 2]]).abs() < 1e-14);
        }
    }

    #[test]
    fn split_element_symmetries_are_dropped() {
        // Identify the two edges of the chain; both are split, so the pair
        // cannot be carried over.
        let mut mesh =
            Mesh::from_positions(3, &[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 2.0, 0.0, 0.0]).unwrap();
        mesh.add_element(1, &[0, 1]).unwrap();
        mesh.add_element(1, &[1, 2]).unwrap();
        let mut sym = Sparse::new(2, 2);
        sym.set(0, 1, 1.0);
        mesh.add_symmetry(1, sym).unwrap();

        let refined = refine(&mesh, None).unwrap();
        assert!(refined.mesh.symmetry_pairs(1).is_empty());
        assert!(refined.mesh.images(1).is_empty());
    }

    #[test]
    fn solid_meshes_are_rejected() {
        let mut mesh = Mesh::from_positions(
            3,
            &[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
        )
        .unwrap();
        mesh.add_element(3, &[0, 1, 2, 3]).unwrap();
        assert!(refine(&mesh, None).is_err());
    }
}
