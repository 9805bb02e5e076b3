use crate::matrix::{CountMatrix, ExprMatrix};
use crate::table::{Column, Table};
use anyhow::{bail, format_err, Error};
use ndarray::{Array1, Array2, Axis};
use std::collections::BTreeMap;

/// Count matrix plus everything that is aligned with its rows (genes) or columns (cells).
///
/// Fields are private: the only ways to narrow a `Dataset` are [`Dataset::select_cells`] and
/// [`Dataset::select_genes`], which subset the matrix, both tables, the size factors, the log
/// matrix and every embedding together.
#[derive(Clone, Debug)]
pub struct Dataset {
    name: String,
    counts: CountMatrix,
    genes: Table,
    cells: Table,
    size_factors: Option<Array1<f64>>,
    logcounts: Option<ExprMatrix>,
    embeddings: BTreeMap<String, Array2<f64>>,
}

impl Dataset {
    /// Assemble a dataset, checking that the tables match the matrix shape.
    pub fn new(name: impl Into<String>, counts: CountMatrix, genes: Table, cells: Table) -> Result<Dataset, Error> {
        let name = name.into();
        if counts.genes() != genes.nrows() {
            bail!(
                "dataset '{}': matrix has {} genes but gene table has {} rows",
                name,
                counts.genes(),
                genes.nrows()
            );
        }
        if counts.cells() != cells.nrows() {
            bail!(
                "dataset '{}': matrix has {} cells but cell table has {} rows",
                name,
                counts.cells(),
                cells.nrows()
            );
        }
        Ok(Dataset {
            name,
            counts,
            genes,
            cells,
            size_factors: None,
            logcounts: None,
            embeddings: BTreeMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn counts(&self) -> &CountMatrix {
        &self.counts
    }

    pub fn genes(&self) -> &Table {
        &self.genes
    }

    pub fn cells(&self) -> &Table {
        &self.cells
    }

    pub fn n_genes(&self) -> usize {
        self.counts.genes()
    }

    pub fn n_cells(&self) -> usize {
        self.counts.cells()
    }

    pub fn gene_ids(&self) -> &[String] {
        self.genes.ids()
    }

    pub fn barcodes(&self) -> &[String] {
        self.cells.ids()
    }

    /// Row index of a gene id
    pub fn gene_index(&self, id: &str) -> Option<usize> {
        self.genes.ids().iter().position(|g| g == id)
    }

    pub fn size_factors(&self) -> Option<&Array1<f64>> {
        self.size_factors.as_ref()
    }

    pub fn logcounts(&self) -> Option<&ExprMatrix> {
        self.logcounts.as_ref()
    }

    /// Log-normalized matrix, or an error naming the dataset if normalization hasn't run.
    pub fn require_logcounts(&self) -> Result<&ExprMatrix, Error> {
        self.logcounts
            .as_ref()
            .ok_or_else(|| format_err!("dataset '{}' has not been normalized", self.name))
    }

    pub fn embedding(&self, name: &str) -> Option<&Array2<f64>> {
        self.embeddings.get(name)
    }

    /// Embedding by name, or an error listing the ones that exist.
    pub fn require_embedding(&self, name: &str) -> Result<&Array2<f64>, Error> {
        self.embeddings.get(name).ok_or_else(|| {
            format_err!(
                "dataset '{}' has no embedding '{}' (have: {:?})",
                self.name,
                name,
                self.embeddings.keys().collect::<Vec<_>>()
            )
        })
    }

    pub fn embedding_names(&self) -> impl Iterator<Item = &str> {
        self.embeddings.keys().map(String::as_str)
    }

    /// Add or replace a per-cell metadata column
    pub fn with_cell_column(mut self, name: impl Into<String>, column: Column) -> Result<Dataset, Error> {
        self.cells = self.cells.with_column(name, column)?;
        Ok(self)
    }

    /// Add or replace a per-gene metadata column
    pub fn with_gene_column(mut self, name: impl Into<String>, column: Column) -> Result<Dataset, Error> {
        self.genes = self.genes.with_column(name, column)?;
        Ok(self)
    }

    /// Add or replace a named embedding (cells x components)
    pub fn with_embedding(mut self, name: impl Into<String>, embedding: Array2<f64>) -> Result<Dataset, Error> {
        let name = name.into();
        if embedding.nrows() != self.n_cells() {
            bail!(
                "embedding '{}' has {} rows but dataset '{}' has {} cells",
                name,
                embedding.nrows(),
                self.name,
                self.n_cells()
            );
        }
        self.embeddings.insert(name, embedding);
        Ok(self)
    }

    /// Attach size factors and the matching log-normalized matrix.
    pub fn with_normalization(mut self, size_factors: Array1<f64>, logcounts: ExprMatrix) -> Result<Dataset, Error> {
        if size_factors.len() != self.n_cells() {
            bail!(
                "{} size factors for {} cells in dataset '{}'",
                size_factors.len(),
                self.n_cells(),
                self.name
            );
        }
        if logcounts.shape() != self.counts.shape() {
            bail!(
                "log matrix shape {:?} doesn't match count matrix shape {:?}",
                logcounts.shape(),
                self.counts.shape()
            );
        }
        self.cells = self
            .cells
            .with_column("size_factor", Column::Num(size_factors.to_vec()))?;
        self.size_factors = Some(size_factors);
        self.logcounts = Some(logcounts);
        Ok(self)
    }

    /// Keep the cells at `idx`, in that order, across every cell-aligned component.
    pub fn select_cells(&self, idx: &[usize]) -> Result<Dataset, Error> {
        if let Some(&bad) = idx.iter().find(|&&i| i >= self.n_cells()) {
            bail!("cell index {} out of range for {} cells", bad, self.n_cells());
        }
        let logcounts = match &self.logcounts {
            Some(l) => Some(l.select_cells(idx)?),
            None => None,
        };
        Ok(Dataset {
            name: self.name.clone(),
            counts: self.counts.select_cells(idx)?,
            genes: self.genes.clone(),
            cells: self.cells.subset(idx),
            size_factors: self.size_factors.as_ref().map(|s| s.select(Axis(0), idx)),
            logcounts,
            embeddings: self
                .embeddings
                .iter()
                .map(|(k, e)| (k.clone(), e.select(Axis(0), idx)))
                .collect(),
        })
    }

    /// Keep the cells whose flag is true
    pub fn retain_cells(&self, keep: &[bool]) -> Result<Dataset, Error> {
        if keep.len() != self.n_cells() {
            bail!("{} flags for {} cells", keep.len(), self.n_cells());
        }
        let idx: Vec<usize> = (0..keep.len()).filter(|&i| keep[i]).collect();
        self.select_cells(&idx)
    }

    /// Keep the genes at `idx`, in that order. Embeddings are cell-aligned and are kept as is.
    pub fn select_genes(&self, idx: &[usize]) -> Result<Dataset, Error> {
        let logcounts = match &self.logcounts {
            Some(l) => Some(l.select_genes(idx)?),
            None => None,
        };
        Ok(Dataset {
            name: self.name.clone(),
            counts: self.counts.select_genes(idx)?,
            genes: self.genes.subset(idx),
            cells: self.cells.clone(),
            size_factors: self.size_factors.clone(),
            logcounts,
            embeddings: self.embeddings.clone(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Factor;
    use ndarray::array;

    fn toy() -> Dataset {
        let counts: Array2<u32> = array![[1, 0, 3, 2], [0, 6, 4, 1], [2, 5, 0, 1]];
        let genes = Table::new(vec!["g1".into(), "g2".into(), "g3".into()]);
        let cells = Table::new((0..4).map(|i| format!("AC{i}-1")).collect())
            .with_column("batch", Column::Factor(Factor::from_labels(&["a", "a", "b", "b"])))
            .unwrap();
        Dataset::new("toy", CountMatrix::from_dense(counts.view()), genes, cells).unwrap()
    }

    #[test]
    fn test_shape_checked() {
        let counts: Array2<u32> = array![[1, 0], [0, 1]];
        let genes = Table::new(vec!["g1".into()]);
        let cells = Table::new(vec!["c1".into(), "c2".into()]);
        assert!(Dataset::new("bad", CountMatrix::from_dense(counts.view()), genes, cells).is_err());
    }

    #[test]
    fn test_select_cells_lockstep() {
        let ds = toy();
        let sf = array![1.0, 2.0, 3.0, 4.0];
        let log = ds.counts().map_entries(|_, _, v| v as f64);
        let ds = ds
            .with_normalization(sf, log)
            .unwrap()
            .with_embedding("PCA", array![[0.0, 0.5], [1.0, 1.5], [2.0, 2.5], [3.0, 3.5]])
            .unwrap();
        let sub = ds.retain_cells(&[false, true, false, true]).unwrap();
        assert_eq!(sub.n_cells(), 2);
        assert_eq!(sub.barcodes(), &["AC1-1", "AC3-1"]);
        assert_eq!(sub.size_factors().unwrap(), &array![2.0, 4.0]);
        assert_eq!(sub.cells().num("size_factor").unwrap(), &[2.0, 4.0]);
        assert_eq!(sub.embedding("PCA").unwrap(), &array![[1.0, 1.5], [3.0, 3.5]]);
        assert_eq!(sub.logcounts().unwrap().cells(), 2);
        assert_eq!(sub.counts().column_sums(), vec![11.0, 4.0]);
        assert_eq!(sub.cells().factor("batch").unwrap().codes(), &[0, 1]);
        assert!(ds.select_cells(&[7]).is_err());
    }

    #[test]
    fn test_select_genes() {
        let ds = toy();
        let sub = ds.select_genes(&[2, 0]).unwrap();
        assert_eq!(sub.gene_ids(), &["g3", "g1"]);
        assert_eq!(sub.counts().row_sums(), vec![8.0, 6.0]);
        assert_eq!(sub.gene_index("g1"), Some(1));
    }

    #[test]
    fn test_embedding_rows_checked() {
        let ds = toy();
        assert!(ds.clone().with_embedding("UMAP", Array2::zeros((3, 2))).is_err());
        assert!(ds.require_embedding("UMAP").is_err());
        assert!(ds.require_logcounts().is_err());
    }
}
