//! Compressed Sparse Row (CSR) matrix.
//!
//! Holds the Jacobian of the coupled circuit/device system. Loaders assemble
//! it from `(row, col, value)` stamps; duplicate stamps accumulate the way
//! device contributions do in MNA assembly.

/// Sparse matrix in Compressed Sparse Row format.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix {
    pub nrows: usize,
    pub ncols: usize,
    /// Non-zero values, stored row by row.
    pub values: Vec<f64>,
    /// Column index for each non-zero value.
    pub col_indices: Vec<usize>,
    /// `row_pointers[i]` is where row i starts in `values`/`col_indices`.
    pub row_pointers: Vec<usize>,
}

impl CsrMatrix {
    /// Create an empty matrix with no non-zero entries.
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            values: Vec::new(),
            col_indices: Vec::new(),
            row_pointers: vec![0; nrows + 1],
        }
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Build from `(row, col, value)` stamps. Stamps at the same position
    /// are summed.
    pub fn from_triplets(nrows: usize, ncols: usize, triplets: &[(usize, usize, f64)]) -> Self {
        let mut sorted = triplets.to_vec();
        sorted.sort_by_key(|&(r, c, _)| (r, c));

        let mut values: Vec<f64> = Vec::with_capacity(sorted.len());
        let mut col_indices: Vec<usize> = Vec::with_capacity(sorted.len());
        let mut row_pointers = vec![0usize; nrows + 1];
        let mut last: Option<(usize, usize)> = None;

        for (row, col, val) in sorted {
            if last == Some((row, col)) {
                if let Some(v) = values.last_mut() {
                    *v += val;
                }
                continue;
            }
            values.push(val);
            col_indices.push(col);
            row_pointers[row + 1] += 1;
            last = Some((row, col));
        }
        for i in 1..=nrows {
            row_pointers[i] += row_pointers[i - 1];
        }

        Self {
            nrows,
            ncols,
            values,
            col_indices,
            row_pointers,
        }
    }

    /// Iterate `(col, value)` over the stored entries of one row.
    pub fn row(&self, row: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let span = self.row_pointers[row]..self.row_pointers[row + 1];
        self.col_indices[span.clone()]
            .iter()
            .copied()
            .zip(self.values[span].iter().copied())
    }

    /// Stored value at `(row, col)`, zero when absent.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.row(row)
            .filter(|&(c, _)| c == col)
            .map(|(_, v)| v)
            .sum()
    }

    /// Sparse matrix-vector multiply: y = A * x
    pub fn spmv(&self, x: &[f64]) -> Vec<f64> {
        assert_eq!(x.len(), self.ncols, "spmv dimension mismatch");
        (0..self.nrows)
            .map(|r| self.row(r).map(|(c, v)| v * x[c]).sum())
            .collect()
    }

    /// Transposed multiply: y = A^T * x
    pub fn spmv_transpose(&self, x: &[f64]) -> Vec<f64> {
        assert_eq!(x.len(), self.nrows, "spmv_transpose dimension mismatch");
        let mut y = vec![0.0; self.ncols];
        for (r, &xr) in x.iter().enumerate() {
            for (c, v) in self.row(r) {
                y[c] += v * xr;
            }
        }
        y
    }

    /// Convert to a dense row-major matrix. For tests and small systems.
    pub fn to_dense(&self) -> Vec<Vec<f64>> {
        let mut dense = vec![vec![0.0; self.ncols]; self.nrows];
        for (r, dense_row) in dense.iter_mut().enumerate() {
            for (c, v) in self.row(r) {
                dense_row[c] = v;
            }
        }
        dense
    }
}
