//! Sparse matrices with an editable dictionary-of-keys form and a derived
//! column-compressed form.
//!
//! The DOK side preserves key insertion order and is the only mutable
//! representation. The CCS side is built on demand through
//! `nalgebra-sparse` (columns sorted ascending by row index, so the
//! conversion is deterministic) and is dropped whenever the DOK changes.

use std::cell::{Ref, RefCell};
use std::collections::HashMap;

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CscMatrix};

use crate::errors::{MorphoError, MorphoResult};

#[derive(Debug)]
pub struct Sparse {
    nrows: usize,
    ncols: usize,
    values: HashMap<(usize, usize), f64>,
    order: Vec<(usize, usize)>,
    ccs: RefCell<Option<CscMatrix<f64>>>,
}

impl Clone for Sparse {
    fn clone(&self) -> Self {
        Self {
            nrows: self.nrows,
            ncols: self.ncols,
            values: self.values.clone(),
            order: self.order.clone(),
            ccs: RefCell::new(self.ccs.borrow().clone()),
        }
    }
}

impl Sparse {
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            values: HashMap::new(),
            order: Vec::new(),
            ccs: RefCell::new(None),
        }
    }

    pub fn from_triplets<I>(nrows: usize, ncols: usize, triplets: I) -> Self
    where
        I: IntoIterator<Item = (usize, usize, f64)>,
    {
        let mut m = Self::new(nrows, ncols);
        for (r, c, v) in triplets {
            m.set(r, c, v);
        }
        m
    }

    fn from_csc(csc: CscMatrix<f64>) -> Self {
        let mut m = Self::new(csc.nrows(), csc.ncols());
        for (r, c, v) in csc.triplet_iter() {
            m.set(r, c, *v);
        }
        *m.ccs.borrow_mut() = Some(csc);
        m
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn nnz(&self) -> usize {
        self.order.len()
    }

    /// Inserts or overwrites one entry, growing the dimensions as needed.
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        if row >= self.nrows {
            self.nrows = row + 1;
        }
        if col >= self.ncols {
            self.ncols = col + 1;
        }
        if self.values.insert((row, col), value).is_none() {
            self.order.push((row, col));
        }
        *self.ccs.borrow_mut() = None;
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values.get(&(row, col)).copied().unwrap_or(0.0)
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        self.values.contains_key(&(row, col))
    }

    /// Grows the logical dimensions without touching any entry.
    pub fn grow_to(&mut self, nrows: usize, ncols: usize) {
        if nrows > self.nrows || ncols > self.ncols {
            self.nrows = self.nrows.max(nrows);
            self.ncols = self.ncols.max(ncols);
            *self.ccs.borrow_mut() = None;
        }
    }

    /// Entries in key insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.order.iter().map(move |&(r, c)| (r, c, self.values[&(r, c)]))
    }

    /// The derived column-compressed form; built lazily and cached until the
    /// next edit.
    pub fn ccs(&self) -> Ref<'_, CscMatrix<f64>> {
        if self.ccs.borrow().is_none() {
            let mut coo = CooMatrix::new(self.nrows, self.ncols);
            for &(r, c) in &self.order {
                coo.push(r, c, self.values[&(r, c)]);
            }
            *self.ccs.borrow_mut() = Some(CscMatrix::from(&coo));
        }
        Ref::map(self.ccs.borrow(), |c| c.as_ref().expect("ccs built above"))
    }

    /// Row indices of the stored entries in column `col`, ascending.
    pub fn rows_for_col(&self, col: usize) -> Vec<usize> {
        if col >= self.ncols {
            return Vec::new();
        }
        self.ccs().col(col).row_indices().to_vec()
    }

    /// Column indices of the stored entries in row `row`, ascending.
    pub fn cols_for_row(&self, row: usize) -> Vec<usize> {
        let mut cols: Vec<usize> = self
            .order
            .iter()
            .filter(|&&(r, _)| r == row)
            .map(|&(_, c)| c)
            .collect();
        cols.sort_unstable();
        cols
    }

    pub fn transpose(&self) -> Sparse {
        Self::from_csc(self.ccs().transpose())
    }

    /// Returns `alpha * self + beta * other` as a fresh matrix.
    pub fn add(&self, alpha: f64, other: &Sparse, beta: f64) -> MorphoResult<Sparse> {
        if self.nrows != other.nrows || self.ncols != other.ncols {
            return Err(MorphoError::ShapeMismatch {
                expected: vec![self.nrows, self.ncols],
                found: vec![other.nrows, other.ncols],
            });
        }
        let a = &*self.ccs() * alpha;
        let b = &*other.ccs() * beta;
        Ok(Self::from_csc(&a + &b))
    }

    /// Sparse-sparse product `self * other` as a fresh matrix.
    pub fn mul(&self, other: &Sparse) -> MorphoResult<Sparse> {
        if self.ncols != other.nrows {
            return Err(MorphoError::ShapeMismatch {
                expected: vec![self.ncols],
                found: vec![other.nrows],
            });
        }
        Ok(Self::from_csc(&*self.ccs() * &*other.ccs()))
    }

    /// Sparse-dense product against a dense right-hand side.
    pub fn mul_dense(&self, rhs: &DMatrix<f64>) -> MorphoResult<DMatrix<f64>> {
        if self.ncols != rhs.nrows() {
            return Err(MorphoError::ShapeMismatch {
                expected: vec![self.ncols],
                found: vec![rhs.nrows()],
            });
        }
        let mut out = DMatrix::zeros(self.nrows, rhs.ncols());
        for (r, c, v) in self.iter() {
            for j in 0..rhs.ncols() {
                out[(r, j)] += v * rhs[(c, j)];
            }
        }
        Ok(out)
    }

    /// Solves `self * x = b` for a dense right-hand side: LU on square
    /// systems, thin-QR least squares on overdetermined ones.
    pub fn solve(&self, b: &DVector<f64>) -> MorphoResult<DVector<f64>> {
        if self.nrows != b.nrows() || self.ncols == 0 {
            return Err(MorphoError::ShapeMismatch {
                expected: vec![self.nrows, self.ncols],
                found: vec![b.nrows()],
            });
        }
        if self.nrows < self.ncols {
            return Err(MorphoError::Unsupported("underdetermined sparse solve"));
        }
        let mut dense = DMatrix::zeros(self.nrows, self.ncols);
        for (r, c, v) in self.iter() {
            dense[(r, c)] = v;
        }
        if self.nrows == self.ncols {
            return dense.lu().solve(b).ok_or(MorphoError::Singular("sparse solve"));
        }
        let qr = dense.qr();
        let rhs = qr.q().transpose() * b;
        qr.r()
            .solve_upper_triangular(&rhs)
            .ok_or(MorphoError::Singular("sparse solve"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_and_growth() {
        let mut m = Sparse::new(2, 2);
        m.set(0, 1, 3.0);
        m.set(4, 0, -1.0);
        assert_eq!(m.get(0, 1), 3.0);
        assert_eq!(m.get(1, 1), 0.0);
        assert_eq!(m.nrows(), 5);
        m.set(0, 1, 5.0);
        assert_eq!(m.get(0, 1), 5.0);
        assert_eq!(m.nnz(), 2);
    }

    #[test]
    fn ccs_is_sorted_per_column() {
        let m = Sparse::from_triplets(4, 2, vec![(3, 0, 1.0), (0, 0, 2.0), (2, 1, 4.0), (1, 0, 3.0)]);
        assert_eq!(m.rows_for_col(0), vec![0, 1, 3]);
        assert_eq!(m.rows_for_col(1), vec![2]);
        assert_eq!(m.cols_for_row(2), vec![1]);
    }

    #[test]
    fn insertion_order_preserved() {
        let mut m = Sparse::new(3, 3);
        m.set(2, 2, 1.0);
        m.set(0, 0, 2.0);
        m.set(1, 2, 3.0);
        let keys: Vec<(usize, usize)> = m.iter().map(|(r, c, _)| (r, c)).collect();
        assert_eq!(keys, vec![(2, 2), (0, 0), (1, 2)]);
    }

    #[test]
    fn add_and_mul() {
        let a = Sparse::from_triplets(2, 2, vec![(0, 0, 1.0), (1, 1, 2.0)]);
        let b = Sparse::from_triplets(2, 2, vec![(0, 1, 1.0), (1, 1, 1.0)]);
        let s = a.add(2.0, &b, 3.0).unwrap();
        assert_eq!(s.get(0, 0), 2.0);
        assert_eq!(s.get(0, 1), 3.0);
        assert_eq!(s.get(1, 1), 7.0);

        let p = a.mul(&b).unwrap();
        assert_eq!(p.get(0, 1), 1.0);
        assert_eq!(p.get(1, 1), 2.0);
        assert_eq!(p.get(0, 0), 0.0);
    }

    #[test]
    fn transpose_swaps_indices() {
        let m = Sparse::from_triplets(2, 3, vec![(0, 2, 5.0), (1, 0, 6.0)]);
        let t = m.transpose();
        assert_eq!(t.nrows(), 3);
        assert_eq!(t.ncols(), 2);
        assert_eq!(t.get(2, 0), 5.0);
        assert_eq!(t.get(0, 1), 6.0);
    }

    #[test]
    fn solve_square_system() {
        let a = Sparse::from_triplets(
            2,
            2,
            vec![(0, 0, 4.0), (0, 1, 1.0), (1, 0, 1.0), (1, 1, 3.0)],
        );
        let b = DVector::from_vec(vec![1.0, 2.0]);
        let x = a.solve(&b).unwrap();
        let r = a.mul_dense(&DMatrix::from_column_slice(2, 1, x.as_slice())).unwrap();
        assert!((r[(0, 0)] - 1.0).abs() < 1e-12);
        assert!((r[(1, 0)] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn solve_overdetermined_least_squares() {
        let a = Sparse::from_triplets(
            3,
            2,
            vec![(0, 0, 1.0), (1, 1, 1.0), (2, 0, 1.0), (2, 1, 1.0)],
        );
        let b = DVector::from_vec(vec![1.0, 2.0, 2.0]);
        let x = a.solve(&b).unwrap();
        // Normal equations give x = (2/3, 5/3).
        assert!((x[0] - 2.0 / 3.0).abs() < 1e-12);
        assert!((x[1] - 5.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn solve_rejects_singular_and_underdetermined() {
        let singular = Sparse::from_triplets(
            2,
            2,
            vec![(0, 0, 1.0), (0, 1, 2.0), (1, 0, 2.0), (1, 1, 4.0)],
        );
        let b = DVector::from_vec(vec![1.0, 1.0]);
        assert!(matches!(singular.solve(&b), Err(MorphoError::Singular(_))));

        let wide = Sparse::from_triplets(1, 2, vec![(0, 0, 1.0), (0, 1, 1.0)]);
        let b1 = DVector::from_vec(vec![1.0]);
        assert!(matches!(wide.solve(&b1), Err(MorphoError::Unsupported(_))));
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let a = Sparse::new(2, 3);
        let b = Sparse::new(2, 2);
        assert!(a.add(1.0, &b, 1.0).is_err());
        assert!(b.mul(&a).is_ok());
        assert!(a.mul(&a).is_err());
    }
}
