//! Deterministic synthetic count data with known cell types and batches.

use crate::classify::Reference;
use crate::source::DatasetSource;
use anyhow::{bail, Error};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Poisson};
use rand_pcg::Pcg64Mcg;
use scan_types::{Column, CountMatrix, Dataset, Factor, Table, BATCH};
use serde::{Deserialize, Serialize};

/// Cell-table column holding the simulated cell type
pub const TRUTH: &str = "truth";

/// Settings for a synthetic dataset.
///
/// Every gene is expressed in every cell at a moderate level. Each cell type has its own block
/// of `markers_per_type` genes scaled up by `marker_fold`; each batch rescales every gene by a
/// fixed random factor within `exp(+/- batch_effect)`; each cell has a library size factor drawn
/// from `[1 - library_spread, 1 + library_spread]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Simulated {
    pub n_cells: usize,
    pub n_genes: usize,
    pub n_batches: usize,
    pub n_types: usize,
    pub markers_per_type: usize,
    pub base_mean: (f64, f64),
    pub marker_fold: f64,
    pub batch_effect: f64,
    pub library_spread: f64,
    pub seed: u64,
}

impl Default for Simulated {
    fn default() -> Self {
        Simulated {
            n_cells: 100,
            n_genes: 50,
            n_batches: 2,
            n_types: 2,
            markers_per_type: 5,
            base_mean: (30.0, 60.0),
            marker_fold: 4.0,
            batch_effect: 0.2,
            library_spread: 0.3,
            seed: 0,
        }
    }
}

impl Simulated {
    fn check(&self) -> Result<(), Error> {
        if self.n_types == 0 || self.n_batches == 0 {
            bail!("simulation needs at least one cell type and one batch");
        }
        if self.n_types * self.markers_per_type > self.n_genes {
            bail!(
                "{} types x {} markers don't fit in {} genes",
                self.n_types,
                self.markers_per_type,
                self.n_genes
            );
        }
        if !(0.0..1.0).contains(&self.library_spread) || self.base_mean.0 <= 0.0 || self.base_mean.1 < self.base_mean.0 {
            bail!("invalid simulation means or library spread");
        }
        Ok(())
    }

    pub fn gene_ids(&self) -> Vec<String> {
        (0..self.n_genes).map(|g| format!("SIM{:05}", g + 1)).collect()
    }

    /// Gene symbols: `T<t>M<j>` for the j-th marker of type t, `HK<g>` otherwise
    pub fn gene_symbols(&self) -> Vec<String> {
        (0..self.n_genes)
            .map(|g| match self.marker_of(g) {
                Some(t) => format!("T{}M{}", t + 1, g % self.markers_per_type.max(1) + 1),
                None => format!("HK{}", g + 1),
            })
            .collect()
    }

    pub fn type_name(t: usize) -> String {
        format!("type{}", t + 1)
    }

    fn marker_of(&self, gene: usize) -> Option<usize> {
        if self.markers_per_type == 0 {
            return None;
        }
        let t = gene / self.markers_per_type;
        (t < self.n_types).then_some(t)
    }

    /// Cell `i` belongs to batch `i % n_batches` and type `(i / n_batches) % n_types`, so every
    /// batch contains every type.
    pub fn cell_type(&self, cell: usize) -> usize {
        (cell / self.n_batches) % self.n_types
    }

    pub fn cell_batch(&self, cell: usize) -> usize {
        cell % self.n_batches
    }

    /// Expected counts per gene for each type at unit library size, genes x types
    fn expected(&self, rng: &mut Pcg64Mcg) -> Array2<f64> {
        let (lo, hi) = self.base_mean;
        let base: Vec<f64> = (0..self.n_genes).map(|_| rng.gen_range(lo..=hi)).collect();
        Array2::from_shape_fn((self.n_genes, self.n_types), |(g, t)| {
            if self.marker_of(g) == Some(t) {
                base[g] * self.marker_fold
            } else {
                base[g]
            }
        })
    }

    /// Generate the dataset
    pub fn simulate(&self, name: &str) -> Result<Dataset, Error> {
        self.check()?;
        let mut rng = Pcg64Mcg::seed_from_u64(self.seed);
        let expected = self.expected(&mut rng);
        let batch_factor = Array2::from_shape_fn((self.n_genes, self.n_batches), |_| {
            rng.gen_range(-self.batch_effect..=self.batch_effect).exp()
        });

        let mut columns = Vec::with_capacity(self.n_cells);
        for cell in 0..self.n_cells {
            let (t, b) = (self.cell_type(cell), self.cell_batch(cell));
            let library = 1.0 + rng.gen_range(-self.library_spread..=self.library_spread);
            let mut col = Vec::new();
            for g in 0..self.n_genes {
                let lambda = expected[[g, t]] * batch_factor[[g, b]] * library;
                let x: f64 = Poisson::new(lambda)?.sample(&mut rng);
                if x > 0.0 {
                    col.push((g, x as u32));
                }
            }
            columns.push(col);
        }

        let genes = Table::new(self.gene_ids())
            .with_column("symbol", Column::Str(self.gene_symbols().into_iter().map(Some).collect()))?;
        let batches: Vec<String> = (0..self.n_cells).map(|c| format!("b{}", self.cell_batch(c) + 1)).collect();
        let types: Vec<String> = (0..self.n_cells).map(|c| Self::type_name(self.cell_type(c))).collect();
        let cells = Table::new(
            (0..self.n_cells)
                .map(|c| format!("{}_{:04}-1", batches[c], c + 1))
                .collect(),
        )
        .with_column(BATCH, Column::Factor(Factor::from_labels(&batches)))?
        .with_column(TRUTH, Column::Factor(Factor::from_labels(&types)))?;

        Dataset::new(name, CountMatrix::from_columns(self.n_genes, columns)?, genes, cells)
    }

    /// Reference profiles for the simulated types: log2 CPM of each type's expected counts,
    /// with `profiles_per_type` copies perturbed by a little noise.
    pub fn reference(&self, profiles_per_type: usize) -> Result<Reference, Error> {
        self.check()?;
        let mut rng = Pcg64Mcg::seed_from_u64(self.seed);
        let expected = self.expected(&mut rng);
        let n = self.n_types * profiles_per_type.max(1);
        let mut profiles = Array2::zeros((self.n_genes, n));
        let mut labels = Vec::with_capacity(n);
        for t in 0..self.n_types {
            let total: f64 = expected.column(t).sum();
            for p in 0..profiles_per_type.max(1) {
                let j = labels.len();
                for g in 0..self.n_genes {
                    let cpm = expected[[g, t]] / total * 1e6;
                    let noise = if p == 0 { 0.0 } else { rng.gen_range(-0.05..0.05) };
                    profiles[[g, j]] = (cpm + 1.0).log2() + noise;
                }
                labels.push(Self::type_name(t));
            }
        }
        Reference::new(self.gene_ids(), labels, profiles)
    }
}

impl DatasetSource for Simulated {
    fn load(&self, id: &str) -> Result<Dataset, Error> {
        self.simulate(if id.is_empty() { "simulated" } else { id })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_simulation_layout() {
        let sim = Simulated::default();
        let ds = sim.load("").unwrap();
        assert_eq!((ds.n_genes(), ds.n_cells()), (50, 100));
        let batch = ds.cells().factor(BATCH).unwrap();
        let truth = ds.cells().factor(TRUTH).unwrap();
        assert_eq!(batch.counts(), vec![50, 50]);
        assert_eq!(truth.counts(), vec![50, 50]);
        // every gene is detected in every cell
        assert!(ds.counts().column_nnz().iter().all(|&n| n == 50));
        // first marker block is higher in type 1
        let sums = ds.counts().sum_by_group(&truth.groups());
        assert!(sums[[0, 0]] > 2.0 * sums[[0, 1]]);
        assert!(sums[[5, 1]] > 2.0 * sums[[5, 0]]);
    }

    #[test]
    fn test_simulation_is_seeded() {
        let sim = Simulated::default();
        assert_eq!(sim.simulate("a").unwrap().counts(), sim.simulate("b").unwrap().counts());
        let other = Simulated { seed: 1, ..Simulated::default() };
        assert_ne!(sim.simulate("a").unwrap().counts(), other.simulate("a").unwrap().counts());
    }

    #[test]
    fn test_bad_settings() {
        let sim = Simulated {
            markers_per_type: 30,
            ..Simulated::default()
        };
        assert!(sim.simulate("x").is_err());
    }
}
