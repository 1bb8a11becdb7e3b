//! Simplicial meshes with graded elements and cached connectivity.
//!
//! A mesh stores a column-major vertex table and, per grade g ≥ 1, the
//! incidence matrix C(0,g) whose columns are elements and whose rows are
//! vertices. Any other connectivity C(g1,g2) is derived on demand and cached
//! until the next structural change. C(g,g) holds symmetry identifications:
//! an entry (i, j) marks vertex j as the image of vertex i.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};

use nalgebra::Vector3;
use ndarray::{ArrayView2, ArrayViewMut2, ShapeBuilder};

use crate::errors::{MorphoError, MorphoResult};
use crate::linalg::sparse::Sparse;
use crate::linalg::vertex3;

pub const MAX_GRADE: usize = 3;

/// Vertex lists of every element of one grade, extracted from the
/// column-compressed incidence so vertex ids come out ascending.
#[derive(Debug, Clone)]
pub struct ElementTable {
    grade: usize,
    arity: usize,
    verts: Vec<usize>,
}

impl ElementTable {
    pub fn grade(&self) -> usize {
        self.grade
    }

    pub fn count(&self) -> usize {
        if self.arity == 0 { 0 } else { self.verts.len() / self.arity }
    }

    pub fn vertices(&self, el: usize) -> &[usize] {
        &self.verts[el * self.arity..(el + 1) * self.arity]
    }
}

#[derive(Debug)]
pub struct Mesh {
    dim: usize,
    positions: Vec<f64>,
    elements: [Option<Sparse>; 4],
    symmetries: [Option<Sparse>; 4],
    derived: RefCell<HashMap<(usize, usize), Sparse>>,
}

impl Clone for Mesh {
    fn clone(&self) -> Self {
        Self {
            dim: self.dim,
            positions: self.positions.clone(),
            elements: self.elements.clone(),
            symmetries: self.symmetries.clone(),
            derived: RefCell::new(self.derived.borrow().clone()),
        }
    }
}

impl Mesh {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            positions: Vec::new(),
            elements: [None, None, None, None],
            symmetries: [None, None, None, None],
            derived: RefCell::new(HashMap::new()),
        }
    }

    /// Builds a mesh from a column-major coordinate slice.
    pub fn from_positions(dim: usize, coords: &[f64]) -> MorphoResult<Self> {
        if dim == 0 || coords.len() % dim != 0 {
            return Err(MorphoError::ShapeMismatch {
                expected: vec![dim],
                found: vec![coords.len()],
            });
        }
        let mut mesh = Self::new(dim);
        mesh.positions.extend_from_slice(coords);
        Ok(mesh)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len() / self.dim
    }

    /// Number of elements of grade `g`.
    pub fn count(&self, grade: usize) -> usize {
        if grade == 0 {
            self.vertex_count()
        } else {
            self.elements
                .get(grade)
                .and_then(|e| e.as_ref())
                .map_or(0, |c| c.ncols())
        }
    }

    pub fn max_grade(&self) -> usize {
        (1..=MAX_GRADE).rev().find(|&g| self.count(g) > 0).unwrap_or(0)
    }

    /// D×N view of the vertex table.
    pub fn vertex_matrix(&self) -> ArrayView2<'_, f64> {
        let n = self.vertex_count();
        ArrayView2::from_shape((self.dim, n).f(), &self.positions)
            .expect("positions length is dim * vertex_count")
    }

    pub fn vertex_matrix_mut(&mut self) -> ArrayViewMut2<'_, f64> {
        let n = self.vertex_count();
        ArrayViewMut2::from_shape((self.dim, n).f(), &mut self.positions)
            .expect("positions length is dim * vertex_count")
    }

    /// Column-major flat view of the vertex table.
    pub fn positions(&self) -> &[f64] {
        &self.positions
    }

    pub fn set_positions(&mut self, coords: &[f64]) -> MorphoResult<()> {
        if coords.len() != self.positions.len() {
            return Err(MorphoError::ShapeMismatch {
                expected: vec![self.positions.len()],
                found: vec![coords.len()],
            });
        }
        self.positions.copy_from_slice(coords);
        Ok(())
    }

    pub fn vertex(&self, v: usize) -> Vector3<f64> {
        vertex3(&self.vertex_matrix(), v)
    }

    pub fn add_vertex(&mut self, coords: &[f64]) -> MorphoResult<usize> {
        if coords.len() != self.dim {
            return Err(MorphoError::ShapeMismatch {
                expected: vec![self.dim],
                found: vec![coords.len()],
            });
        }
        self.positions.extend_from_slice(coords);
        self.derived.borrow_mut().clear();
        Ok(self.vertex_count() - 1)
    }

    pub fn set_vertex(&mut self, v: usize, coords: &[f64]) -> MorphoResult<()> {
        let n = self.vertex_count();
        if v >= n {
            return Err(MorphoError::OutOfBounds { what: "vertex", index: v, len: n });
        }
        if coords.len() != self.dim {
            return Err(MorphoError::ShapeMismatch {
                expected: vec![self.dim],
                found: vec![coords.len()],
            });
        }
        self.positions[v * self.dim..(v + 1) * self.dim].copy_from_slice(coords);
        Ok(())
    }

    /// Appends an element of grade `grade` given its vertex ids.
    pub fn add_element(&mut self, grade: usize, vids: &[usize]) -> MorphoResult<usize> {
        if grade == 0 || grade > MAX_GRADE {
            return Err(MorphoError::MissingGrade(grade));
        }
        let id = self.count(grade);
        if vids.len() != grade + 1 {
            return Err(MorphoError::ElementArity {
                grade,
                element: id,
                expected: grade + 1,
                found: vids.len(),
            });
        }
        let n = self.vertex_count();
        for &v in vids {
            if v >= n {
                return Err(MorphoError::OutOfBounds { what: "vertex", index: v, len: n });
            }
        }
        let conn = self.elements[grade].get_or_insert_with(|| Sparse::new(n, 0));
        for &v in vids {
            conn.set(v, id, 1.0);
        }
        self.derived.borrow_mut().clear();
        Ok(id)
    }

    /// Installs a full incidence matrix for one grade, replacing any
    /// existing elements of that grade.
    pub fn add_grade_explicit(&mut self, grade: usize, conn: Sparse) -> MorphoResult<()> {
        if grade == 0 || grade > MAX_GRADE {
            return Err(MorphoError::MissingGrade(grade));
        }
        self.elements[grade] = Some(conn);
        self.derived.borrow_mut().clear();
        Ok(())
    }

    /// Derives a grade from the elements already present. Grade 1 is built
    /// from the vertex pairs of grade-2 faces.
    pub fn add_grade(&mut self, grade: usize) -> MorphoResult<()> {
        if self.count(grade) > 0 {
            return Ok(());
        }
        if grade != 1 || self.count(2) == 0 {
            return Err(MorphoError::Unsupported("grade derivation needs grade-2 faces"));
        }
        let faces = self.element_table(2)?;
        let mut pairs = BTreeSet::new();
        for f in 0..faces.count() {
            let v = faces.vertices(f);
            for i in 0..v.len() {
                for j in (i + 1)..v.len() {
                    pairs.insert((v[i].min(v[j]), v[i].max(v[j])));
                }
            }
        }
        for (a, b) in pairs {
            self.add_element(1, &[a, b])?;
        }
        Ok(())
    }

    /// Installs symmetry identifications C(g,g); entry (i, j) makes element
    /// j the image of element i.
    pub fn add_symmetry(&mut self, grade: usize, pairs: Sparse) -> MorphoResult<()> {
        if grade > MAX_GRADE {
            return Err(MorphoError::MissingGrade(grade));
        }
        self.symmetries[grade] = Some(pairs);
        self.derived.borrow_mut().clear();
        Ok(())
    }

    /// Drops every derived connectivity; explicit incidences are kept.
    pub fn reset_connectivity(&mut self) {
        self.derived.borrow_mut().clear();
    }

    /// The connectivity C(g1,g2): rows are grade-g1 elements, columns are
    /// grade-g2 elements. Derived matrices are cached.
    pub fn connectivity(&self, g1: usize, g2: usize) -> MorphoResult<Sparse> {
        if g1 > MAX_GRADE || g2 > MAX_GRADE {
            return Err(MorphoError::MissingGrade(g1.max(g2)));
        }
        if g1 == g2 {
            // The diagonal is reserved for symmetry identifications.
            return Ok(match &self.symmetries[g1] {
                Some(s) => {
                    let mut s = s.clone();
                    s.grow_to(self.count(g1), self.count(g1));
                    s
                }
                None => Sparse::new(self.count(g1), self.count(g1)),
            });
        }
        if let Some(cached) = self.derived.borrow().get(&(g1, g2)) {
            return Ok(cached.clone());
        }
        let result = if g1 == 0 {
            let mut conn = self.elements[g2]
                .as_ref()
                .ok_or(MorphoError::MissingGrade(g2))?
                .clone();
            conn.grow_to(self.vertex_count(), conn.ncols());
            conn
        } else if g1 > g2 {
            self.connectivity(g2, g1)?.transpose()
        } else {
            // 0 < g1 < g2: elements of grade g1 sharing all their vertices
            // with an element of grade g2.
            let shared = self
                .connectivity(g1, 0)?
                .mul(&self.connectivity(0, g2)?)?;
            let full = (g1 + 1) as f64;
            let mut incidence = Sparse::new(shared.nrows(), shared.ncols());
            for (r, c, v) in shared.iter() {
                if (v - full).abs() < 0.5 {
                    incidence.set(r, c, 1.0);
                }
            }
            incidence.grow_to(shared.nrows(), shared.ncols());
            incidence
        };
        self.derived.borrow_mut().insert((g1, g2), result.clone());
        Ok(result)
    }

    /// Vertex lists for every element of `grade`.
    pub fn element_table(&self, grade: usize) -> MorphoResult<ElementTable> {
        if grade == 0 {
            return Ok(ElementTable {
                grade: 0,
                arity: 1,
                verts: (0..self.vertex_count()).collect(),
            });
        }
        let conn = self.connectivity(0, grade)?;
        let arity = grade + 1;
        let n = conn.ncols();
        let mut verts = Vec::with_capacity(n * arity);
        for el in 0..n {
            let rows = conn.rows_for_col(el);
            if rows.len() != arity {
                return Err(MorphoError::ElementArity {
                    grade,
                    element: el,
                    expected: arity,
                    found: rows.len(),
                });
            }
            verts.extend_from_slice(&rows);
        }
        Ok(ElementTable { grade, arity, verts })
    }

    /// Elements of grade `gr` incident on element `id` of grade `g`.
    pub fn find_neighbors(&self, g: usize, id: usize, gr: usize) -> MorphoResult<Vec<usize>> {
        if g != gr {
            return Ok(self.connectivity(gr, g)?.rows_for_col(id));
        }
        // Same grade: neighbors through any shared vertex.
        let vertices = if g == 0 { vec![id] } else { self.connectivity(0, g)?.rows_for_col(id) };
        let by_vertex = self.connectivity(g, 0)?;
        let mut out = BTreeSet::new();
        for v in vertices {
            out.extend(by_vertex.rows_for_col(v));
        }
        out.remove(&id);
        Ok(out.into_iter().collect())
    }

    /// Elements identified with `id` through the grade-`g` symmetry, in
    /// either direction.
    pub fn synonyms(&self, grade: usize, id: usize) -> Vec<usize> {
        let mut out = BTreeSet::new();
        if let Some(s) = self.symmetries.get(grade).and_then(|s| s.as_ref()) {
            for (r, c, _) in s.iter() {
                if r == id {
                    out.insert(c);
                }
                if c == id {
                    out.insert(r);
                }
            }
        }
        out.into_iter().collect()
    }

    /// Image elements of grade `g` (targets of the symmetry relation),
    /// ascending. These are skipped during integration.
    pub fn images(&self, grade: usize) -> Vec<usize> {
        let mut out = BTreeSet::new();
        if let Some(s) = self.symmetries.get(grade).and_then(|s| s.as_ref()) {
            for (_, c, _) in s.iter() {
                out.insert(c);
            }
        }
        out.into_iter().collect()
    }

    /// Symmetry pairs (source, image) of grade `g` in insertion order.
    pub fn symmetry_pairs(&self, grade: usize) -> Vec<(usize, usize)> {
        match self.symmetries.get(grade).and_then(|s| s.as_ref()) {
            Some(s) => s.iter().map(|(r, c, _)| (r, c)).collect(),
            None => Vec::new(),
        }
    }

    /// A mesh sharing this mesh's elements and symmetries but carrying a
    /// different vertex table.
    pub fn with_positions_like(&self, coords: Vec<f64>) -> MorphoResult<Mesh> {
        if coords.len() != self.positions.len() {
            return Err(MorphoError::ShapeMismatch {
                expected: vec![self.positions.len()],
                found: vec![coords.len()],
            });
        }
        Ok(Mesh {
            dim: self.dim,
            positions: coords,
            elements: self.elements.clone(),
            symmetries: self.symmetries.clone(),
            derived: RefCell::new(HashMap::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_triangles() -> Mesh {
        // 3 --- 2
        // | \   |
        // |   \ |
        // 0 --- 1
        let mut mesh =
            Mesh::from_positions(2, &[0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0]).unwrap();
        mesh.add_element(2, &[0, 1, 2]).unwrap();
        mesh.add_element(2, &[0, 2, 3]).unwrap();
        mesh
    }

    #[test]
    fn counts_and_max_grade() {
        let mesh = two_triangles();
        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.count(2), 2);
        assert_eq!(mesh.count(1), 0);
        assert_eq!(mesh.max_grade(), 2);
    }

    #[test]
    fn grade_one_derived_from_faces() {
        let mut mesh = two_triangles();
        mesh.add_grade(1).unwrap();
        assert_eq!(mesh.count(1), 5);
        let edges = mesh.element_table(1).unwrap();
        let mut pairs: Vec<Vec<usize>> =
            (0..edges.count()).map(|e| edges.vertices(e).to_vec()).collect();
        pairs.sort();
        assert!(pairs.contains(&vec![0, 2]));
    }

    #[test]
    fn derived_connectivity_edges_of_face() {
        let mut mesh = two_triangles();
        mesh.add_grade(1).unwrap();
        let edge_face = mesh.connectivity(1, 2).unwrap();
        assert_eq!(edge_face.rows_for_col(0).len(), 3);
        assert_eq!(edge_face.rows_for_col(1).len(), 3);
        // Shared diagonal edge {0,2} borders both faces.
        let edges = mesh.element_table(1).unwrap();
        let diag = (0..edges.count()).find(|&e| edges.vertices(e) == [0, 2]).unwrap();
        assert_eq!(edge_face.cols_for_row(diag), vec![0, 1]);
    }

    #[test]
    fn find_neighbors_across_grades() {
        let mut mesh = two_triangles();
        mesh.add_grade(1).unwrap();
        let faces_at_0 = mesh.find_neighbors(0, 0, 2).unwrap();
        assert_eq!(faces_at_0, vec![0, 1]);
        let faces_at_1 = mesh.find_neighbors(0, 1, 2).unwrap();
        assert_eq!(faces_at_1, vec![0]);
        let face_neighbors = mesh.find_neighbors(2, 0, 2).unwrap();
        assert_eq!(face_neighbors, vec![1]);
    }

    #[test]
    fn symmetry_images_and_synonyms() {
        let mut mesh = two_triangles();
        let mut sym = Sparse::new(4, 4);
        sym.set(0, 3, 1.0);
        mesh.add_symmetry(0, sym).unwrap();
        assert_eq!(mesh.images(0), vec![3]);
        assert_eq!(mesh.synonyms(0, 0), vec![3]);
        assert_eq!(mesh.synonyms(0, 3), vec![0]);
        assert!(mesh.synonyms(0, 1).is_empty());
    }

    #[test]
    fn missing_grade_is_an_error() {
        let mesh = two_triangles();
        assert!(matches!(mesh.connectivity(0, 3), Err(MorphoError::MissingGrade(3))));
        assert!(mesh.element_table(3).is_err());
    }

    #[test]
    fn cache_reset_after_structural_change() {
        let mut mesh = two_triangles();
        mesh.add_grade(1).unwrap();
        let before = mesh.connectivity(1, 2).unwrap().ncols();
        mesh.add_element(2, &[1, 2, 3]).unwrap();
        let after = mesh.connectivity(1, 2).unwrap().ncols();
        assert_eq!(before, 2);
        assert_eq!(after, 3);
    }
}
