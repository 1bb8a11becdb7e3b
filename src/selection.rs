//! Per-grade element subsets used to restrict where functionals act.

use std::collections::BTreeSet;

use crate::errors::{MorphoError, MorphoResult};
use crate::mesh::Mesh;

#[derive(Debug, Clone, Default)]
pub struct Selection {
    sets: [BTreeSet<usize>; 4],
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects every element of every grade the mesh carries.
    pub fn entire(mesh: &Mesh) -> Self {
        let mut sel = Self::new();
        for grade in 0..4 {
            sel.sets[grade] = (0..mesh.count(grade)).collect();
        }
        sel
    }

    pub fn select(&mut self, grade: usize, id: usize) {
        self.sets[grade].insert(id);
    }

    pub fn deselect(&mut self, grade: usize, id: usize) {
        self.sets[grade].remove(&id);
    }

    pub fn is_selected(&self, grade: usize, id: usize) -> bool {
        self.sets[grade].contains(&id)
    }

    /// Selected ids of one grade, ascending.
    pub fn ids(&self, grade: usize) -> Vec<usize> {
        self.sets[grade].iter().copied().collect()
    }

    pub fn count(&self, grade: usize) -> usize {
        self.sets[grade].len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.iter().all(|s| s.is_empty())
    }

    pub fn union(&self, other: &Selection) -> Selection {
        let mut out = self.clone();
        for grade in 0..4 {
            out.sets[grade].extend(other.sets[grade].iter().copied());
        }
        out
    }

    pub fn intersection(&self, other: &Selection) -> Selection {
        let mut out = Selection::new();
        for grade in 0..4 {
            out.sets[grade] = self.sets[grade]
                .intersection(&other.sets[grade])
                .copied()
                .collect();
        }
        out
    }

    pub fn difference(&self, other: &Selection) -> Selection {
        let mut out = Selection::new();
        for grade in 0..4 {
            out.sets[grade] = self.sets[grade]
                .difference(&other.sets[grade])
                .copied()
                .collect();
        }
        out
    }

    pub fn complement(&self, mesh: &Mesh) -> Selection {
        let mut out = Selection::new();
        for grade in 0..4 {
            out.sets[grade] = (0..mesh.count(grade))
                .filter(|id| !self.sets[grade].contains(id))
                .collect();
        }
        out
    }

    /// Extends a vertex selection to elements of `grade`. By default an
    /// element is selected only when all of its vertices are; with
    /// `partials` a single selected vertex suffices.
    pub fn add_grade(&mut self, mesh: &Mesh, grade: usize, partials: bool) -> MorphoResult<()> {
        if grade == 0 {
            return Ok(());
        }
        let table = mesh.element_table(grade)?;
        for el in 0..table.count() {
            let verts = table.vertices(el);
            let hit = if partials {
                verts.iter().any(|v| self.sets[0].contains(v))
            } else {
                verts.iter().all(|v| self.sets[0].contains(v))
            };
            if hit {
                self.sets[grade].insert(el);
            }
        }
        Ok(())
    }

    pub fn remove_grade(&mut self, grade: usize) {
        self.sets[grade].clear();
    }

    /// Elements on the topological boundary: facets of the highest grade
    /// with exactly one parent, together with their vertices.
    pub fn boundary(mesh: &Mesh) -> MorphoResult<Selection> {
        let top = mesh.max_grade();
        if top == 0 {
            return Err(MorphoError::Unsupported("boundary of a point cloud"));
        }
        let facet_grade = top - 1;
        let parents = mesh.connectivity(top, facet_grade)?;
        let table = mesh.element_table(facet_grade)?;
        let mut sel = Selection::new();
        for facet in 0..table.count() {
            if parents.rows_for_col(facet).len() == 1 {
                sel.sets[facet_grade].insert(facet);
                for &v in table.vertices(facet) {
                    sel.sets[0].insert(v);
                }
            }
        }
        Ok(sel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip() -> Mesh {
        // Two triangles sharing edge {0, 2}; boundary is the outer square.
        let mut mesh =
            Mesh::from_positions(2, &[0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0]).unwrap();
        mesh.add_element(2, &[0, 1, 2]).unwrap();
        mesh.add_element(2, &[0, 2, 3]).unwrap();
        mesh.add_grade(1).unwrap();
        mesh
    }

    #[test]
    fn set_algebra() {
        let mesh = strip();
        let mut a = Selection::new();
        a.select(0, 0);
        a.select(0, 1);
        let mut b = Selection::new();
        b.select(0, 1);
        b.select(0, 2);
        assert_eq!(a.union(&b).ids(0), vec![0, 1, 2]);
        assert_eq!(a.intersection(&b).ids(0), vec![1]);
        assert_eq!(a.difference(&b).ids(0), vec![0]);
        assert_eq!(a.complement(&mesh).ids(0), vec![2, 3]);
    }

    #[test]
    fn add_grade_full_and_partial() {
        let mesh = strip();
        let mut sel = Selection::new();
        sel.select(0, 0);
        sel.select(0, 1);
        sel.select(0, 2);

        let mut full = sel.clone();
        full.add_grade(&mesh, 2, false).unwrap();
        assert_eq!(full.ids(2), vec![0]);

        let mut partial = sel.clone();
        partial.add_grade(&mesh, 2, true).unwrap();
        assert_eq!(partial.ids(2), vec![0, 1]);

        full.remove_grade(2);
        assert_eq!(full.count(2), 0);
    }

    #[test]
    fn boundary_of_a_strip() {
        let mesh = strip();
        let b = Selection::boundary(&mesh).unwrap();
        // Four outer edges; the shared diagonal is interior.
        assert_eq!(b.count(1), 4);
        assert_eq!(b.ids(0), vec![0, 1, 2, 3]);
        let edges = mesh.element_table(1).unwrap();
        for e in b.ids(1) {
            assert_ne!(edges.vertices(e), [0, 2]);
        }
    }
}
