#![allow(non_snake_case)]

//! Dimensionality reduction. Truncated SVD methods operate on dense `cells x features`
//! matrices and return `(U, s, V)` with `U` `m x k`, `s` descending and `V` `n x k`, so that
//! `A V = U diag(s)`. Principal components are `U diag(s)`.

use anyhow::Error;
use nalgebra::DMatrix;
use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Randomized SVD method
pub mod rand_svd;

/// PCA on highly variable genes, with component-count selection
pub mod pca;

/// UMAP layout of an embedding
pub mod umap;

pub type SvdResult = (Array2<f64>, Array1<f64>, Array2<f64>);

/// Perform a rank `k` SVD of a `matrix`. This is always the plain SVD; PCA is obtained by
/// centering `matrix` first.
pub trait Svd {
    fn run_svd(&self, matrix: ArrayView2<f64>, k: usize) -> Result<SvdResult, Error>;
}

/// Subtract the column means; returns the centered matrix and the means
pub fn center_columns(a: ArrayView2<f64>) -> (Array2<f64>, Array1<f64>) {
    let means = a.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(a.ncols()));
    let centered = &a - &means.view().insert_axis(Axis(0));
    (centered, means)
}

pub(crate) fn to_nalgebra(a: ArrayView2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

pub(crate) fn from_nalgebra(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

/// Flip signs so the largest-magnitude loading of each component is positive
pub(crate) fn fix_signs(U: &mut Array2<f64>, V: &mut Array2<f64>) {
    for c in 0..V.ncols() {
        let col = V.column(c);
        let pivot = col.iter().fold(0.0f64, |best, &v| if v.abs() > best.abs() { v } else { best });
        if pivot < 0.0 {
            V.column_mut(c).mapv_inplace(|v| -v);
            U.column_mut(c).mapv_inplace(|v| -v);
        }
    }
}
