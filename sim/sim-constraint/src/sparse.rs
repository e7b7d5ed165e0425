//! Sparse assembly sinks for constraint Jacobians.
//!
//! Constraints never build the global Jacobian themselves. They paste their
//! row segments into a [`SparseSink`] at `(row, block.offset + col)`, or the
//! transposed segments at `(block.offset + row, col)`.
//!
//! # Sparsity Pattern
//!
//! For a system with `n` coordinates and `m` active constraints, the Jacobian
//! has `m` rows and `n` columns. A body/body/shaft row holds at most
//! `6 + 6 + 1 = 13` non-zeros, so CSR storage is O(13 m) instead of O(m n).

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CsrMatrix};

/// How a pasted value combines with what is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PasteMode {
    /// Replace the stored value.
    #[default]
    Overwrite,
    /// Add to the stored value.
    Add,
}

/// Target of Jacobian pastes: an explicit (sparse or dense) matrix.
pub trait SparseSink {
    /// Number of rows.
    fn nrows(&self) -> usize;

    /// Number of columns.
    fn ncols(&self) -> usize;

    /// Write one element.
    fn set_element(&mut self, row: usize, col: usize, value: f64, mode: PasteMode);

    /// Write a row segment starting at `(row, col)`.
    fn paste_row(&mut self, row: usize, col: usize, values: &[f64], mode: PasteMode) {
        for (j, &v) in values.iter().enumerate() {
            self.set_element(row, col + j, v, mode);
        }
    }

    /// Write a column segment starting at `(row, col)`.
    fn paste_column(&mut self, row: usize, col: usize, values: &[f64], mode: PasteMode) {
        for (i, &v) in values.iter().enumerate() {
            self.set_element(row + i, col, v, mode);
        }
    }
}

impl SparseSink for DMatrix<f64> {
    fn nrows(&self) -> usize {
        self.shape().0
    }

    fn ncols(&self) -> usize {
        self.shape().1
    }

    fn set_element(&mut self, row: usize, col: usize, value: f64, mode: PasteMode) {
        debug_assert!(row < self.shape().0);
        debug_assert!(col < self.shape().1);
        match mode {
            PasteMode::Overwrite => self[(row, col)] = value,
            PasteMode::Add => self[(row, col)] += value,
        }
    }
}

/// Triplet accumulator with overwrite/add semantics.
///
/// Entries are kept ordered by `(row, col)` so the CSR conversion is
/// deterministic.
#[derive(Debug, Clone)]
pub struct TripletSink {
    entries: BTreeMap<(usize, usize), f64>,
    num_rows: usize,
    num_cols: usize,
}

impl TripletSink {
    /// Create an empty sink of the given shape.
    #[must_use]
    pub fn new(num_rows: usize, num_cols: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            num_rows,
            num_cols,
        }
    }

    /// Stored value, zero when absent.
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.entries.get(&(row, col)).copied().unwrap_or(0.0)
    }

    /// Number of stored entries (explicit zeros included).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stored `(row, col, value)` triplets in row-major order.
    #[must_use]
    pub fn triplets(&self) -> Vec<(usize, usize, f64)> {
        self.entries.iter().map(|(&(r, c), &v)| (r, c, v)).collect()
    }

    /// Build the sparse Jacobian.
    #[must_use]
    pub fn build(&self) -> SparseJacobian {
        SparseJacobian::from_triplets(self.num_rows, self.num_cols, &self.triplets())
    }
}

impl SparseSink for TripletSink {
    fn nrows(&self) -> usize {
        self.num_rows
    }

    fn ncols(&self) -> usize {
        self.num_cols
    }

    fn set_element(&mut self, row: usize, col: usize, value: f64, mode: PasteMode) {
        debug_assert!(row < self.num_rows);
        debug_assert!(col < self.num_cols);
        match mode {
            PasteMode::Overwrite => {
                self.entries.insert((row, col), value);
            }
            PasteMode::Add => *self.entries.entry((row, col)).or_insert(0.0) += value,
        }
    }
}

/// Assembled constraint Jacobian, one CSR row per active constraint.
///
/// Built from [`TripletSink`] pastes. Entries that are exactly zero are not
/// stored, since unset Jacobian coefficients paste as `0.0`; every other
/// value, however small, is kept.
#[derive(Debug, Clone)]
pub struct SparseJacobian {
    matrix: CsrMatrix<f64>,
}

impl SparseJacobian {
    /// Assemble from `(row, col, value)` triplets. Duplicates are summed.
    #[must_use]
    pub fn from_triplets(nrows: usize, ncols: usize, triplets: &[(usize, usize, f64)]) -> Self {
        let mut coo = CooMatrix::new(nrows, ncols);
        for &(row, col, value) in triplets.iter().filter(|t| t.2 != 0.0) {
            coo.push(row, col, value);
        }
        Self {
            matrix: CsrMatrix::from(&coo),
        }
    }

    /// Number of constraint rows.
    #[must_use]
    pub fn nrows(&self) -> usize {
        self.matrix.nrows()
    }

    /// Number of coordinates.
    #[must_use]
    pub fn ncols(&self) -> usize {
        self.matrix.ncols()
    }

    /// Stored entries.
    #[must_use]
    pub fn nnz(&self) -> usize {
        self.matrix.nnz()
    }

    /// `Cq · v`, the constraint-space image of a velocity.
    #[must_use]
    pub fn mul_vec(&self, v: &DVector<f64>) -> DVector<f64> {
        debug_assert_eq!(v.len(), self.ncols());
        let mut out = DVector::zeros(self.nrows());
        for (row, col, value) in self.matrix.triplet_iter() {
            out[row] += value * v[col];
        }
        out
    }

    /// `Cqᵀ · λ`, the generalized reaction of a set of multipliers.
    #[must_use]
    pub fn mul_transpose_vec(&self, lambda: &DVector<f64>) -> DVector<f64> {
        debug_assert_eq!(lambda.len(), self.nrows());
        let mut out = DVector::zeros(self.ncols());
        for (row, col, value) in self.matrix.triplet_iter() {
            out[col] += value * lambda[row];
        }
        out
    }

    /// Dense copy, for small systems and inspection.
    #[must_use]
    pub fn to_dense(&self) -> DMatrix<f64> {
        DMatrix::from(&self.matrix)
    }
}
