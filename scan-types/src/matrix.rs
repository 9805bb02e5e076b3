use anyhow::{bail, Error};
use ndarray::{Array2, ArrayView2};
use sprs::CsMat;

/// Sparse feature-barcode matrix with genes in rows and cells in columns. Stored column-major
/// (CSC) so that per-cell work walks contiguous memory.
#[derive(Clone, Debug, PartialEq)]
pub struct SparseColumns<N> {
    inner: CsMat<N>,
}

/// Raw UMI / read counts
pub type CountMatrix = SparseColumns<u32>;

/// Transformed expression values (e.g. log-normalized counts). Zeros of the count matrix stay
/// zero, so the sparsity pattern is shared with the counts it was derived from.
pub type ExprMatrix = SparseColumns<f64>;

impl<N> SparseColumns<N>
where
    N: Copy + Default + PartialEq + Into<f64>,
{
    /// Wrap an existing sprs matrix, converting to CSC if required.
    pub fn from_csmat(inner: CsMat<N>) -> Self {
        let inner = if inner.is_csc() { inner } else { inner.to_other_storage() };
        SparseColumns { inner }
    }

    /// Build from per-cell lists of `(gene, value)` entries. Entries need not be sorted, but a
    /// gene may appear only once per cell.
    pub fn from_columns(genes: usize, columns: Vec<Vec<(usize, N)>>) -> Result<Self, Error> {
        let cells = columns.len();
        let mut indptr = Vec::with_capacity(cells + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for (cell, mut col) in columns.into_iter().enumerate() {
            col.sort_by_key(|&(g, _)| g);
            for w in col.windows(2) {
                if w[0].0 == w[1].0 {
                    bail!("gene {} appears twice in cell {}", w[0].0, cell);
                }
            }
            for (g, v) in col {
                if g >= genes {
                    bail!("gene index {} out of range for {} genes (cell {})", g, genes, cell);
                }
                if v != N::default() {
                    indices.push(g);
                    data.push(v);
                }
            }
            indptr.push(indices.len());
        }
        Ok(SparseColumns {
            inner: CsMat::new_csc((genes, cells), indptr, indices, data),
        })
    }

    /// Build from a dense genes x cells array
    pub fn from_dense(dense: ArrayView2<N>) -> Self {
        let (genes, cells) = dense.dim();
        let mut indptr = Vec::with_capacity(cells + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for c in 0..cells {
            for g in 0..genes {
                let v = dense[[g, c]];
                if v != N::default() {
                    indices.push(g);
                    data.push(v);
                }
            }
            indptr.push(indices.len());
        }
        SparseColumns {
            inner: CsMat::new_csc((genes, cells), indptr, indices, data),
        }
    }

    /// Underlying sprs matrix
    pub fn inner(&self) -> &CsMat<N> {
        &self.inner
    }

    /// Number of genes (rows)
    pub fn genes(&self) -> usize {
        self.inner.rows()
    }

    /// Number of cells (columns)
    pub fn cells(&self) -> usize {
        self.inner.cols()
    }

    /// `(genes, cells)`
    pub fn shape(&self) -> (usize, usize) {
        (self.genes(), self.cells())
    }

    /// Number of stored non-zeros
    pub fn nnz(&self) -> usize {
        self.inner.nnz()
    }

    /// Non-zero `(gene, value)` entries of one cell, sorted by gene.
    pub fn column(&self, cell: usize) -> Vec<(usize, N)> {
        match self.inner.outer_view(cell) {
            Some(col) => col.iter().map(|(g, &v)| (g, v)).collect(),
            None => Vec::new(),
        }
    }

    /// Total per cell
    pub fn column_sums(&self) -> Vec<f64> {
        self.inner
            .outer_iterator()
            .map(|col| col.iter().map(|(_, &v)| v.into()).sum())
            .collect()
    }

    /// Total per cell restricted to genes with `mask[gene] == true`
    pub fn column_sums_masked(&self, mask: &[bool]) -> Vec<f64> {
        self.inner
            .outer_iterator()
            .map(|col| col.iter().filter(|(g, _)| mask[*g]).map(|(_, &v)| v.into()).sum())
            .collect()
    }

    /// Number of non-zero genes per cell
    pub fn column_nnz(&self) -> Vec<usize> {
        self.inner.outer_iterator().map(|col| col.nnz()).collect()
    }

    /// Total per gene
    pub fn row_sums(&self) -> Vec<f64> {
        let mut sums = vec![0.0; self.genes()];
        for col in self.inner.outer_iterator() {
            for (g, &v) in col.iter() {
                sums[g] += v.into();
            }
        }
        sums
    }

    /// Per-gene mean and sample variance (n - 1 denominator) over the cells in `cells`.
    /// Variance is zero when fewer than two cells are given.
    pub fn row_mean_var(&self, cells: &[usize]) -> (Vec<f64>, Vec<f64>) {
        let genes = self.genes();
        let mut sum = vec![0.0; genes];
        let mut sum_sq = vec![0.0; genes];
        for &c in cells {
            if let Some(col) = self.inner.outer_view(c) {
                for (g, &v) in col.iter() {
                    let v: f64 = v.into();
                    sum[g] += v;
                    sum_sq[g] += v * v;
                }
            }
        }
        let n = cells.len() as f64;
        let mean: Vec<f64> = sum.iter().map(|&s| if n > 0.0 { s / n } else { 0.0 }).collect();
        let var = sum_sq
            .iter()
            .zip(mean.iter())
            .map(|(&ss, &m)| {
                if n > 1.0 {
                    ((ss - n * m * m) / (n - 1.0)).max(0.0)
                } else {
                    0.0
                }
            })
            .collect();
        (mean, var)
    }

    /// Restrict to the cells (columns) in `cells`, in that order.
    pub fn select_cells(&self, cells: &[usize]) -> Result<Self, Error> {
        let mut indptr = Vec::with_capacity(cells.len() + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for &c in cells {
            let Some(col) = self.inner.outer_view(c) else {
                bail!("cell index {} out of range for {} cells", c, self.cells());
            };
            for (g, &v) in col.iter() {
                indices.push(g);
                data.push(v);
            }
            indptr.push(indices.len());
        }
        Ok(SparseColumns {
            inner: CsMat::new_csc((self.genes(), cells.len()), indptr, indices, data),
        })
    }

    /// Restrict to the genes (rows) in `genes`, in that order.
    pub fn select_genes(&self, genes: &[usize]) -> Result<Self, Error> {
        let mut remap = vec![usize::MAX; self.genes()];
        for (new, &old) in genes.iter().enumerate() {
            if old >= self.genes() {
                bail!("gene index {} out of range for {} genes", old, self.genes());
            }
            if remap[old] != usize::MAX {
                bail!("gene index {} selected twice", old);
            }
            remap[old] = new;
        }
        let columns = self
            .inner
            .outer_iterator()
            .map(|col| {
                col.iter()
                    .filter(|(g, _)| remap[*g] != usize::MAX)
                    .map(|(g, &v)| (remap[g], v))
                    .collect()
            })
            .collect();
        Self::from_columns(genes.len(), columns)
    }

    /// Apply `f(gene, cell, value)` to every stored entry, producing an expression matrix with
    /// the same sparsity pattern.
    pub fn map_entries<F>(&self, f: F) -> ExprMatrix
    where
        F: Fn(usize, usize, N) -> f64,
    {
        let mut indptr = Vec::with_capacity(self.cells() + 1);
        let mut indices = Vec::with_capacity(self.nnz());
        let mut data = Vec::with_capacity(self.nnz());
        indptr.push(0);
        for (c, col) in self.inner.outer_iterator().enumerate() {
            for (g, &v) in col.iter() {
                indices.push(g);
                data.push(f(g, c, v));
            }
            indptr.push(indices.len());
        }
        SparseColumns {
            inner: CsMat::new_csc(self.shape(), indptr, indices, data),
        }
    }

    /// Dense genes x cells copy
    pub fn to_dense(&self) -> Array2<f64> {
        let mut out = Array2::zeros(self.shape());
        for (c, col) in self.inner.outer_iterator().enumerate() {
            for (g, &v) in col.iter() {
                out[[g, c]] = v.into();
            }
        }
        out
    }

    /// Dense cells x genes array restricted to `genes` (columns in that order) and to `cells`
    /// (rows in that order).
    pub fn dense_cells_by_genes(&self, cells: &[usize], genes: &[usize]) -> Array2<f64> {
        let mut position = vec![usize::MAX; self.genes()];
        for (j, &g) in genes.iter().enumerate() {
            position[g] = j;
        }
        let mut out = Array2::zeros((cells.len(), genes.len()));
        for (i, &c) in cells.iter().enumerate() {
            if let Some(col) = self.inner.outer_view(c) {
                for (g, &v) in col.iter() {
                    if position[g] != usize::MAX {
                        out[[i, position[g]]] = v.into();
                    }
                }
            }
        }
        out
    }

    /// Sum the columns of each group. Returns a genes x groups array.
    pub fn sum_by_group(&self, groups: &[Vec<usize>]) -> Array2<f64> {
        let mut out = Array2::zeros((self.genes(), groups.len()));
        for (k, members) in groups.iter().enumerate() {
            for &c in members {
                if let Some(col) = self.inner.outer_view(c) {
                    for (g, &v) in col.iter() {
                        out[[g, k]] += v.into();
                    }
                }
            }
        }
        out
    }
}
