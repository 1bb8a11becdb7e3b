//! Per-element numerical data attached to a mesh.
//!
//! A field declares, per grade, how many items each element carries and a
//! prototype describing one item (scalar, vector, or fixed-shape matrix).
//! Storage is a single flat vector addressed through a per-grade offset
//! table, so optimizers can treat a field as one degree-of-freedom vector.

use crate::errors::{MorphoError, MorphoResult};
use crate::mesh::Mesh;

/// Shape of a single field item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPrototype {
    Scalar,
    Vector(usize),
    Matrix(usize, usize),
}

impl FieldPrototype {
    /// Number of scalar components per item.
    pub fn psize(&self) -> usize {
        match *self {
            FieldPrototype::Scalar => 1,
            FieldPrototype::Vector(n) => n,
            FieldPrototype::Matrix(r, c) => r * c,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    prototype: FieldPrototype,
    dof: [usize; 4],
    counts: [usize; 4],
    offsets: [usize; 5],
    data: Vec<f64>,
}

impl Field {
    /// A field with `dof[g]` items on every element of grade g, initialized
    /// to zero. Element counts are inherited from the mesh.
    pub fn with_dof(mesh: &Mesh, prototype: FieldPrototype, dof: [usize; 4]) -> Self {
        let mut counts = [0usize; 4];
        for (g, slot) in counts.iter_mut().enumerate() {
            *slot = mesh.count(g);
        }
        let psize = prototype.psize();
        let mut offsets = [0usize; 5];
        for g in 0..4 {
            offsets[g + 1] = offsets[g] + counts[g] * dof[g] * psize;
        }
        Self { prototype, dof, counts, offsets, data: vec![0.0; offsets[4]] }
    }

    /// One scalar per vertex.
    pub fn scalar(mesh: &Mesh) -> Self {
        Self::with_dof(mesh, FieldPrototype::Scalar, [1, 0, 0, 0])
    }

    /// One n-vector per vertex.
    pub fn vector(mesh: &Mesh, n: usize) -> Self {
        Self::with_dof(mesh, FieldPrototype::Vector(n), [1, 0, 0, 0])
    }

    pub fn prototype(&self) -> FieldPrototype {
        self.prototype
    }

    pub fn psize(&self) -> usize {
        self.prototype.psize()
    }

    /// Items per element, by grade.
    pub fn shape(&self) -> [usize; 4] {
        self.dof
    }

    pub fn count(&self, grade: usize) -> usize {
        self.counts[grade]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn index_of(&self, grade: usize, el: usize, item: usize, comp: usize) -> MorphoResult<usize> {
        if grade > 3 || el >= self.counts[grade] {
            return Err(MorphoError::OutOfBounds {
                what: "field element",
                index: el,
                len: self.counts[grade.min(3)],
            });
        }
        let psize = self.psize();
        if item >= self.dof[grade] || comp >= psize {
            return Err(MorphoError::OutOfBounds {
                what: "field component",
                index: item * psize + comp,
                len: self.dof[grade] * psize,
            });
        }
        Ok(self.offsets[grade] + (el * self.dof[grade] + item) * psize + comp)
    }

    pub fn get(&self, grade: usize, el: usize, item: usize, comp: usize) -> MorphoResult<f64> {
        Ok(self.data[self.index_of(grade, el, item, comp)?])
    }

    pub fn set(&mut self, grade: usize, el: usize, item: usize, comp: usize, value: f64) -> MorphoResult<()> {
        let i = self.index_of(grade, el, item, comp)?;
        self.data[i] = value;
        Ok(())
    }

    /// One item as a component slice.
    pub fn item(&self, grade: usize, el: usize, item: usize) -> MorphoResult<&[f64]> {
        let start = self.index_of(grade, el, item, 0)?;
        Ok(&self.data[start..start + self.psize()])
    }

    pub fn item_mut(&mut self, grade: usize, el: usize, item: usize) -> MorphoResult<&mut [f64]> {
        let start = self.index_of(grade, el, item, 0)?;
        let psize = self.psize();
        Ok(&mut self.data[start..start + psize])
    }

    /// Flat storage indices covering every component of element `el` at
    /// `grade`; empty when the grade carries no items.
    pub fn dof_range(&self, grade: usize, el: usize) -> std::ops::Range<usize> {
        let width = self.dof[grade] * self.psize();
        let start = self.offsets[grade] + el * width;
        start..start + width
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn raw(&self, idx: usize) -> f64 {
        self.data[idx]
    }

    pub fn set_raw(&mut self, idx: usize, value: f64) {
        self.data[idx] = value;
    }

    /// A zeroed field with this field's layout.
    pub fn zero_like(&self) -> Field {
        let mut out = self.clone();
        out.data.iter_mut().for_each(|v| *v = 0.0);
        out
    }

    pub fn fill(&mut self, value: f64) {
        self.data.iter_mut().for_each(|v| *v = value);
    }

    fn check_layout(&self, other: &Field) -> MorphoResult<()> {
        if self.dof != other.dof || self.counts != other.counts || self.psize() != other.psize() {
            return Err(MorphoError::FieldLayout(format!(
                "dof {:?} vs {:?}",
                self.dof, other.dof
            )));
        }
        Ok(())
    }

    pub fn add(&self, other: &Field) -> MorphoResult<Field> {
        self.check_layout(other)?;
        let mut out = self.clone();
        for (a, b) in out.data.iter_mut().zip(&other.data) {
            *a += b;
        }
        Ok(out)
    }

    pub fn sub(&self, other: &Field) -> MorphoResult<Field> {
        self.check_layout(other)?;
        let mut out = self.clone();
        for (a, b) in out.data.iter_mut().zip(&other.data) {
            *a -= b;
        }
        Ok(out)
    }

    pub fn scale(&mut self, lambda: f64) {
        self.data.iter_mut().for_each(|v| *v *= lambda);
    }

    /// In-place accumulate `self ← self + lambda * other`.
    pub fn accumulate(&mut self, lambda: f64, other: &Field) -> MorphoResult<()> {
        self.check_layout(other)?;
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += lambda * b;
        }
        Ok(())
    }

    /// Applies `f` to every item across this field and zero or more
    /// co-indexed fields, producing a new field. The closure receives the
    /// output item (pre-filled with this field's values) and one input slice
    /// per supplied field.
    pub fn op<F>(&self, others: &[&Field], mut f: F) -> MorphoResult<Field>
    where
        F: FnMut(&mut [f64], &[&[f64]]) -> MorphoResult<()>,
    {
        for other in others {
            self.check_layout(other)?;
        }
        let mut out = self.clone();
        let psize = self.psize();
        for grade in 0..4 {
            for el in 0..self.counts[grade] {
                for item in 0..self.dof[grade] {
                    let start = self.offsets[grade] + (el * self.dof[grade] + item) * psize;
                    let inputs: Vec<&[f64]> = others
                        .iter()
                        .map(|o| &o.data[start..start + psize])
                        .collect();
                    f(&mut out.data[start..start + psize], &inputs)?;
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment_mesh() -> Mesh {
        let mut mesh = Mesh::from_positions(3, &[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 2.0, 0.0, 0.0]).unwrap();
        mesh.add_element(1, &[0, 1]).unwrap();
        mesh.add_element(1, &[1, 2]).unwrap();
        mesh
    }

    #[test]
    fn addressing_by_grade_and_component() {
        let mesh = segment_mesh();
        let mut f = Field::with_dof(&mesh, FieldPrototype::Vector(2), [1, 1, 0, 0]);
        f.set(0, 2, 0, 1, 7.0).unwrap();
        f.set(1, 1, 0, 0, -2.0).unwrap();
        assert_eq!(f.get(0, 2, 0, 1).unwrap(), 7.0);
        assert_eq!(f.get(1, 1, 0, 0).unwrap(), -2.0);
        assert_eq!(f.len(), 3 * 2 + 2 * 2);
        assert_eq!(f.item(0, 2, 0).unwrap(), &[0.0, 7.0]);
        assert!(f.get(0, 3, 0, 0).is_err());
        assert!(f.get(0, 0, 1, 0).is_err());
    }

    #[test]
    fn dof_range_addresses_one_element() {
        let mesh = segment_mesh();
        let f = Field::with_dof(&mesh, FieldPrototype::Vector(3), [1, 0, 0, 0]);
        assert_eq!(f.dof_range(0, 1), 3..6);
        assert_eq!(f.dof_range(1, 0), f.len()..f.len());
    }

    #[test]
    fn arithmetic_and_accumulate() {
        let mesh = segment_mesh();
        let mut a = Field::scalar(&mesh);
        let mut b = Field::scalar(&mesh);
        for v in 0..3 {
            a.set(0, v, 0, 0, v as f64).unwrap();
            b.set(0, v, 0, 0, 1.0).unwrap();
        }
        let sum = a.add(&b).unwrap();
        assert_eq!(sum.get(0, 2, 0, 0).unwrap(), 3.0);
        a.accumulate(0.5, &b).unwrap();
        assert_eq!(a.get(0, 0, 0, 0).unwrap(), 0.5);
        let diff = sum.sub(&b).unwrap();
        assert_eq!(diff.get(0, 1, 0, 0).unwrap(), 1.0);
    }

    #[test]
    fn op_maps_items_with_coindexed_fields() {
        let mesh = segment_mesh();
        let mut a = Field::vector(&mesh, 2);
        let mut b = Field::vector(&mesh, 2);
        for v in 0..3 {
            a.set(0, v, 0, 0, v as f64).unwrap();
            b.set(0, v, 0, 1, 2.0).unwrap();
        }
        let dotted = a
            .op(&[&b], |out, inputs| {
                let other = inputs[0];
                out[0] += other[1];
                Ok(())
            })
            .unwrap();
        assert_eq!(dotted.get(0, 1, 0, 0).unwrap(), 3.0);

        let mismatched = Field::scalar(&mesh);
        assert!(a.op(&[&mismatched], |_, _| Ok(())).is_err());
    }
}
