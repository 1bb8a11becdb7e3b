//! Dense helpers shared across the crate.
//!
//! Large element-indexed data (vertex tables, gradients, field storage) lives
//! in `ndarray` containers; per-element geometry and small linear solves use
//! `nalgebra`.

pub mod sparse;

use nalgebra::{DMatrix, DVector, Vector3};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use num_traits::Float;

use crate::errors::{MorphoError, MorphoResult};

/// Compensated (Kahan) accumulator. Summation order is fixed by the caller;
/// the compensation term bounds rounding independent of the number of terms.
#[derive(Debug, Clone, Copy)]
pub struct KahanSum<T: Float> {
    sum: T,
    comp: T,
}

impl<T: Float> KahanSum<T> {
    pub fn new() -> Self {
        Self { sum: T::zero(), comp: T::zero() }
    }

    pub fn add(&mut self, value: T) {
        let y = value - self.comp;
        let t = self.sum + y;
        self.comp = (t - self.sum) - y;
        self.sum = t;
    }

    pub fn total(&self) -> T {
        self.sum
    }
}

impl<T: Float> Default for KahanSum<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads column `v` of a D×N position matrix as a 3-vector, zero-padded when
/// the mesh is embedded in fewer than three dimensions.
pub fn vertex3(positions: &ArrayView2<'_, f64>, v: usize) -> Vector3<f64> {
    let dim = positions.nrows();
    let mut x = Vector3::zeros();
    for d in 0..dim.min(3) {
        x[d] = positions[[d, v]];
    }
    x
}

/// Adds a 3-vector contribution into column `v` of a gradient matrix,
/// discarding components beyond the matrix row count.
pub fn accumulate_column(out: &mut Array2<f64>, v: usize, g: Vector3<f64>) {
    let dim = out.nrows();
    for d in 0..dim.min(3) {
        out[[d, v]] += g[d];
    }
}

/// Flattens a D×N matrix column-major, so each column occupies a contiguous
/// run of D entries.
pub fn flatten_columns(m: &Array2<f64>) -> Array1<f64> {
    let (rows, cols) = m.dim();
    let mut out = Array1::zeros(rows * cols);
    for c in 0..cols {
        for r in 0..rows {
            out[c * rows + r] = m[[r, c]];
        }
    }
    out
}

/// Inverse of [`flatten_columns`].
pub fn unflatten_columns(x: &ArrayView1<'_, f64>, rows: usize) -> Array2<f64> {
    let cols = x.len() / rows;
    let mut out = Array2::zeros((rows, cols));
    for c in 0..cols {
        for r in 0..rows {
            out[[r, c]] = x[c * rows + r];
        }
    }
    out
}

/// Dense LU solve for a small square system. `context` names the caller in
/// the singular-system error.
pub fn solve_lu(a: DMatrix<f64>, b: DVector<f64>, context: &'static str) -> MorphoResult<DVector<f64>> {
    a.lu().solve(&b).ok_or(MorphoError::Singular(context))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn kahan_compensates_small_addends() {
        let mut k = KahanSum::new();
        for _ in 0..10 {
            k.add(0.1f64);
        }
        assert!((k.total() - 1.0).abs() < 1e-15);

        // Terms below half an ulp of the running sum vanish under naive
        // summation but survive compensation.
        let mut naive = 1.0f64;
        let mut comp = KahanSum::new();
        comp.add(1.0);
        for _ in 0..1000 {
            naive += 1e-17;
            comp.add(1e-17);
        }
        assert_eq!(naive, 1.0);
        assert!((comp.total() - (1.0 + 1000.0 * 1e-17)).abs() < 5e-16);
    }

    #[test]
    fn flatten_roundtrip() {
        let m = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let flat = flatten_columns(&m);
        assert_eq!(flat.as_slice().unwrap(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        let back = unflatten_columns(&flat.view(), 2);
        assert_eq!(back, m);
    }

    #[test]
    fn vertex3_pads_missing_dimensions() {
        let m = array![[1.0, 2.0], [3.0, 4.0]];
        let v = vertex3(&m.view(), 1);
        assert_eq!(v, Vector3::new(2.0, 4.0, 0.0));
    }

    #[test]
    fn solve_lu_reports_singularity() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        let b = DVector::from_vec(vec![1.0, 1.0]);
        assert!(solve_lu(a, b, "test").is_err());
    }
}
