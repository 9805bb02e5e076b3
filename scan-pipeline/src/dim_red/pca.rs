use super::rand_svd::RandSvd;
use super::{center_columns, Svd};
use crate::error::{PipelineError, Stage};
use anyhow::{bail, Error};
use log::info;
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// How many principal components to keep
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Components {
    Fixed(usize),
    /// Drop trailing components until the dropped variance covers the technical variance of the
    /// selected genes, then clamp to `[min_rank, max_rank]`.
    Denoise { min_rank: usize, max_rank: usize },
    /// Keep up to the elbow of the variance-explained curve
    Elbow { max_rank: usize },
}

impl Default for Components {
    fn default() -> Self {
        Components::Denoise {
            min_rank: 5,
            max_rank: 50,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcaConfig {
    pub components: Components,
    /// power iterations of the randomized SVD
    pub n_iter: usize,
    pub seed: u64,
}

impl Default for PcaConfig {
    fn default() -> Self {
        PcaConfig {
            components: Components::default(),
            n_iter: 2,
            seed: 0,
        }
    }
}

impl PcaConfig {
    fn svd(&self) -> RandSvd {
        RandSvd {
            n_iter: self.n_iter,
            ..RandSvd::new().with_seed(self.seed)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PcaSummary {
    pub n_components: usize,
    /// variance of each retained component
    pub variance: Vec<f64>,
    /// percentage of the total variance of the selected genes
    pub percent_var: Vec<f64>,
    pub total_variance: f64,
}

/// Principal component scores (`cells x k`) and per-component variance of a centered matrix
pub fn principal_components(
    centered: ArrayView2<f64>,
    k: usize,
    svd: &impl Svd,
) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>), Error> {
    let (u, s, v) = svd.run_svd(centered, k)?;
    let n = centered.nrows() as f64;
    let scores = &u * &s;
    let variance = s.mapv(|x| x * x / (n - 1.0));
    Ok((scores, variance, v))
}

/// Number of leading components to keep so that the variance in the discarded ones, plus
/// whatever the computed components don't capture, just covers `tech`.
pub fn denoised_rank(variance: &[f64], tech: f64, total: f64) -> usize {
    let npcs = variance.len();
    let uncaptured = (total - variance.iter().sum::<f64>()).max(0.0);
    let mut dropped = uncaptured;
    for (i, v) in variance.iter().rev().enumerate() {
        dropped += v;
        if dropped > tech {
            return npcs - i;
        }
    }
    npcs
}

/// Index (1-based) of the point furthest from the line joining the first and last points of
/// the variance-explained curve.
pub fn elbow_rank(percent_var: &[f64]) -> usize {
    let n = percent_var.len();
    if n < 3 {
        return n.max(1);
    }
    let (x0, y0) = (1.0, percent_var[0]);
    let (x1, y1) = (n as f64, percent_var[n - 1]);
    let norm = ((x1 - x0).powi(2) + (y1 - y0).powi(2)).sqrt();
    let mut best = (0, f64::NEG_INFINITY);
    for (i, &y) in percent_var.iter().enumerate() {
        let x = (i + 1) as f64;
        let d = ((y1 - y0) * x - (x1 - x0) * y + x1 * y0 - y1 * x0).abs() / norm;
        if d > best.1 {
            best = (i + 1, d);
        }
    }
    best.0
}

/// Sum of the column variances of a centered matrix
fn total_variance(centered: ArrayView2<f64>) -> f64 {
    let n = centered.nrows() as f64;
    centered.iter().map(|v| v * v).sum::<f64>() / (n - 1.0)
}

/// PCA of the log-expression of `hvgs`, attached as the `PCA` embedding. `tech` holds the
/// technical variance of each gene and drives `Components::Denoise`.
pub fn run_pca(
    ds: scan_types::Dataset,
    hvgs: &[usize],
    tech: &[f64],
    cfg: &PcaConfig,
) -> Result<(scan_types::Dataset, PcaSummary), Error> {
    let log = ds.require_logcounts()?;
    let cells: Vec<usize> = (0..ds.n_cells()).collect();
    let x = log.dense_cells_by_genes(&cells, hvgs);
    let (centered, _) = center_columns(x.view());

    let max_k = std::cmp::min(centered.nrows().saturating_sub(1), centered.ncols());
    if max_k < 1 {
        return Err(PipelineError::insufficient(
            Stage::DimensionReduction,
            format!("dataset '{}'", ds.name()),
            format!("{} cells x {} genes is too small for PCA", centered.nrows(), centered.ncols()),
        ));
    }
    let requested = match cfg.components {
        Components::Fixed(n) => n,
        Components::Denoise { max_rank, .. } => max_rank,
        Components::Elbow { max_rank } => max_rank,
    };
    if requested == 0 {
        bail!("{}: number of components must be positive", Stage::DimensionReduction);
    }
    let k = requested.min(max_k);

    let (scores, variance, _) = principal_components(centered.view(), k, &cfg.svd())?;
    let total = total_variance(centered.view());
    let percent: Vec<f64> = variance.iter().map(|v| 100.0 * v / total).collect();

    let keep = match cfg.components {
        Components::Fixed(_) => k,
        Components::Denoise { min_rank, max_rank } => {
            let tech_total: f64 = hvgs.iter().map(|&g| tech[g]).sum();
            denoised_rank(variance.as_slice().unwrap_or(&[]), tech_total, total).clamp(min_rank.min(max_rank), max_rank)
        }
        Components::Elbow { .. } => elbow_rank(&percent),
    }
    .min(k);

    info!(
        "{}: kept {} of {} components ({:.1}% of variance) over {} genes",
        Stage::DimensionReduction,
        keep,
        k,
        percent[..keep].iter().sum::<f64>(),
        hvgs.len()
    );
    let summary = PcaSummary {
        n_components: keep,
        variance: variance.slice(s![..keep]).to_vec(),
        percent_var: percent[..keep].to_vec(),
        total_variance: total,
    };
    let ds = ds.with_embedding(scan_types::PCA, scores.slice(s![.., ..keep]).to_owned())?;
    Ok((ds, summary))
}

/// PCA across batches in which every batch contributes equally to the rotation, regardless of
/// its size. `x` is `cells x genes`; returns scores of all cells on `k` components, centered on
/// the average of the batch means.
pub fn multi_batch_pca(x: ArrayView2<f64>, batches: &[Vec<usize>], k: usize, svd: &impl Svd) -> Result<Array2<f64>, Error> {
    let p = x.ncols();
    let mut stacked = Array2::zeros((0, p));
    let mut center = Array1::<f64>::zeros(p);
    for cells in batches {
        let block = x.select(Axis(0), cells);
        let (centered, means) = center_columns(block.view());
        center += &means;
        let scale = 1.0 / (cells.len() as f64).sqrt();
        stacked.append(Axis(0), (centered * scale).view())?;
    }
    center /= batches.len().max(1) as f64;
    let k = k.min(stacked.nrows().min(p));
    let (_, _, rotation) = svd.run_svd(stacked.view(), k)?;
    let shifted = &x - &center.view().insert_axis(Axis(0));
    Ok(shifted.dot(&rotation))
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_denoised_rank() {
        // total 10: 6 + 2 + 1 + 0.5 computed, 0.5 uncaptured
        let var = [6.0, 2.0, 1.0, 0.5];
        assert_eq!(denoised_rank(&var, 1.9, 10.0), 3);
        assert_eq!(denoised_rank(&var, 2.5, 10.0), 2);
        assert_eq!(denoised_rank(&var, 0.9, 10.0), 4);
        assert_eq!(denoised_rank(&var, 20.0, 10.0), 4);
    }

    #[test]
    fn test_elbow() {
        assert_eq!(elbow_rank(&[50.0, 20.0, 5.0, 4.0, 3.0, 2.0]), 3);
        assert_eq!(elbow_rank(&[10.0]), 1);
    }

    #[test]
    fn test_scores_capture_variance() {
        let x = array![[1.0, 2.0, 0.0], [2.0, 4.1, 0.1], [3.0, 6.0, 0.0], [4.0, 8.2, 0.2], [5.0, 9.9, 0.1]];
        let (c, _) = center_columns(x.view());
        let (scores, variance, _) = principal_components(c.view(), 2, &RandSvd::new()).unwrap();
        assert_eq!(scores.dim(), (5, 2));
        let total = total_variance(c.view());
        assert!(variance[0] / total > 0.99);
        // component variance equals the sample variance of the scores
        let col = scores.column(0);
        let v0 = col.iter().map(|s| s * s).sum::<f64>() / 4.0;
        assert_abs_diff_eq!(v0, variance[0], epsilon = 1e-10);
    }

    #[test]
    fn test_multi_batch_weights() {
        // batch 2 is ten times larger but both batches vary along different axes
        let mut rows = vec![[0.0, 0.0], [4.0, 0.0]];
        for i in 0..20 {
            rows.push([10.0, (i % 2) as f64 * 4.0]);
        }
        let x = Array2::from_shape_fn((rows.len(), 2), |(i, j)| rows[i][j]);
        let batches = vec![vec![0, 1], (2..22).collect::<Vec<_>>()];
        let scores = multi_batch_pca(x.view(), &batches, 2, &RandSvd::new()).unwrap();
        assert_eq!(scores.dim(), (22, 2));
        // both axes are kept, so within-batch distances are preserved
        let dist = |a: usize, b: usize| (&scores.row(a) - &scores.row(b)).mapv(|v| v * v).sum().sqrt();
        let spread0 = dist(0, 1);
        let spread1 = dist(2, 3);
        assert_abs_diff_eq!(spread0, 4.0, epsilon = 1e-8);
        assert_abs_diff_eq!(spread1, 4.0, epsilon = 1e-8);
    }
}
