//! Sparse LU solver for Newton corrections and coupling directions.

use crate::error::{Result, TwoLevelError};
use crate::sparse::CsrMatrix;
use faer::prelude::*;
use faer::sparse::{SparseColMat, Triplet};
use std::panic::{self, AssertUnwindSafe};

use super::LinearSolver;

/// Direct solver: one factorization per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct SparseLuSolver;

impl SparseLuSolver {
    pub fn new() -> Self {
        Self
    }
}

impl LinearSolver for SparseLuSolver {
    fn solve(&self, a: &CsrMatrix, b: &[f64]) -> Result<Vec<f64>> {
        solve_sparse_lu(a, b)
    }
}

/// Solve `a x = b` with faer's sparse LU.
pub fn solve_sparse_lu(a: &CsrMatrix, b: &[f64]) -> Result<Vec<f64>> {
    let n = a.nrows;
    if a.ncols != n || b.len() != n {
        return Err(TwoLevelError::Solve(format!(
            "dimension mismatch: matrix is {}x{}, rhs length is {}",
            a.nrows,
            a.ncols,
            b.len()
        )));
    }
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut triplets = Vec::with_capacity(a.nnz());
    for row in 0..n {
        for (col, val) in a.row(row) {
            if !val.is_finite() {
                return Err(TwoLevelError::Solve("Jacobian contains NaN/Inf".into()));
            }
            triplets.push(Triplet::new(row, col, val));
        }
    }

    let a_sp = SparseColMat::<usize, f64>::try_new_from_triplets(n, n, &triplets)
        .map_err(|e| TwoLevelError::Solve(format!("sparse matrix build failed: {e:?}")))?;

    let rhs = faer::Mat::<f64>::from_fn(n, 1, |i, _| b[i]);

    // faer panics on a zero pivot rather than returning an error.
    let x = panic::catch_unwind(AssertUnwindSafe(|| {
        a_sp.sp_lu().map(|lu| lu.solve(rhs))
    }))
    .map_err(|_| TwoLevelError::Solve("singular Jacobian: zero pivot in sparse LU".into()))?
    .map_err(|e| TwoLevelError::Solve(format!("sparse LU factorization failed: {e:?}")))?;

    let out: Vec<f64> = (0..n).map(|i| x[(i, 0)]).collect();
    if out.iter().any(|v| !v.is_finite()) {
        return Err(TwoLevelError::Solve("sparse LU produced NaN/Inf solution".into()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn solves_known_2x2() {
        let a =
            CsrMatrix::from_triplets(2, 2, &[(0, 0, 2.0), (0, 1, 1.0), (1, 0, 5.0), (1, 1, 7.0)]);
        let x = SparseLuSolver.solve(&a, &[11.0, 13.0]).expect("sparse LU should solve");
        assert_abs_diff_eq!(x[0], 64.0 / 9.0, epsilon = 1e-10);
        assert_abs_diff_eq!(x[1], -29.0 / 9.0, epsilon = 1e-10);
    }

    #[test]
    fn reports_singular_or_non_finite() {
        let a = CsrMatrix::from_triplets(2, 2, &[(0, 0, 1.0), (1, 0, 1.0)]);
        let err = solve_sparse_lu(&a, &[1.0, 1.0]).expect_err("matrix should be singular");
        assert!(format!("{err}").contains("Solve error"));
    }

    #[test]
    fn zero_pivot_is_an_error() {
        // Full structure, numerically rank one.
        let a =
            CsrMatrix::from_triplets(2, 2, &[(0, 0, 1.0), (0, 1, 1.0), (1, 0, 1.0), (1, 1, 1.0)]);
        let err = SparseLuSolver.solve(&a, &[1.0, 2.0]).expect_err("matrix is singular");
        assert!(matches!(err, TwoLevelError::Solve(_)));

        let zero = CsrMatrix::from_triplets(1, 1, &[(0, 0, 0.0)]);
        assert!(solve_sparse_lu(&zero, &[1.0]).is_err());
    }

    #[test]
    fn rejects_dimension_mismatch() {
        let a = CsrMatrix::from_triplets(2, 2, &[(0, 0, 1.0), (1, 1, 1.0)]);
        assert!(solve_sparse_lu(&a, &[1.0]).is_err());
    }
}
