//! Size factors and log-normalization.

use crate::cluster::kmeans;
use crate::error::{PipelineError, Stage};
use crate::stats::{median, median_mut, FiveNumber};
use anyhow::{bail, format_err, Error};
use log::{debug, info, warn};
use ndarray::Array2;
use noisy_float::types::n64;
use rayon::prelude::*;
use scan_types::{CountMatrix, Dataset, ExprMatrix};
use serde::{Deserialize, Serialize};
use sprs::{CsMat, TriMat};
use std::str::FromStr;

/// Size factor estimation scheme
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Total count per cell
    LibrarySize,
    /// Pooling and deconvolution: cells are summed in pools to avoid zero-dominated ratios,
    /// pool factors are estimated by median ratio to an average pseudo-cell, and per-cell
    /// factors are solved from the pool equations by least squares.
    Deconvolution,
}

impl FromStr for Normalization {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "library_size" => Ok(Normalization::LibrarySize),
            "deconvolution" => Ok(Normalization::Deconvolution),
            _ => bail!("Normalization not recognized: {}", s),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormConfig {
    pub method: Normalization,
    /// pre-clusters for deconvolution come from this cell column instead of k-means
    pub cluster_column: Option<String>,
    /// k-means pre-clustering only runs with at least twice this many cells, and uses at most
    /// one cluster per this many cells
    pub min_cluster_size: usize,
    pub max_preclusters: usize,
    /// genes used for pre-clustering, by average expression
    pub precluster_genes: usize,
    pub pool_sizes: Vec<usize>,
    /// genes whose average library-normalized count is below this don't enter the pool ratios
    pub min_mean: f64,
    pub seed: u64,
}

impl Default for NormConfig {
    fn default() -> Self {
        NormConfig {
            method: Normalization::Deconvolution,
            cluster_column: None,
            min_cluster_size: 100,
            max_preclusters: 10,
            precluster_genes: 500,
            pool_sizes: (21..=101).step_by(5).collect(),
            min_mean: 0.1,
            seed: 0,
        }
    }
}

/// What the normalizer did
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SizeFactorSummary {
    pub method: Normalization,
    pub n_clusters: usize,
    /// cells whose deconvolution estimate was unusable and fell back to library size
    pub n_fallback: usize,
    pub size_factors: FiveNumber,
}

/// Total count per cell
pub fn library_size_factors(counts: &CountMatrix) -> Vec<f64> {
    counts.column_sums()
}

/// Scale size factors to unit median. All factors must be positive.
pub fn center_size_factors(sf: &mut [f64]) -> Result<(), Error> {
    if let Some(bad) = sf.iter().position(|&s| !(s > 0.0 && s.is_finite())) {
        bail!("size factor {} of cell {} is not positive", sf[bad], bad);
    }
    let m = median(sf).ok_or_else(|| format_err!("no size factors to center"))?;
    sf.iter_mut().for_each(|s| *s /= m);
    Ok(())
}

/// `log2(x / s + 1)` per entry. Zeros stay zero.
pub fn log_normalize(counts: &CountMatrix, size_factors: &[f64]) -> ExprMatrix {
    counts.map_entries(|_, c, v| (v as f64 / size_factors[c] + 1.0).log2())
}

/// Indices arranged so that library sizes rise along one side of a ring and fall along the
/// other: any window of consecutive cells mixes small and large libraries.
fn ring_order(cells: &[usize], lib: &[f64]) -> Vec<usize> {
    let mut sorted: Vec<usize> = cells.to_vec();
    sorted.sort_by_key(|&c| (n64(lib[c]), c));
    let mut ring: Vec<usize> = sorted.iter().step_by(2).copied().collect();
    let odd: Vec<usize> = sorted.iter().skip(1).step_by(2).copied().collect();
    ring.extend(odd.into_iter().rev());
    ring
}

const POOL_PRIOR: f64 = 1e-6;
const CG_MAX_ITER: usize = 5000;
const CG_TOLERANCE: f64 = 1e-10;

/// `A^T A + prior I` for the pool design `A` whose rows are the windows of every size in
/// `sizes` sliding around `ring`. Entries depend only on the ring distance `d` between two
/// cells: the number of windows holding both, so the matrix has `2 * max(sizes) - 1`
/// non-zeros per row.
fn pool_gram(ring: &[usize], sizes: &[usize], prior: f64) -> CsMat<f64> {
    let n = ring.len();
    let max_s = sizes.iter().copied().max().unwrap_or(0);
    let shared = |d: usize| -> f64 {
        sizes
            .iter()
            .map(|&s| s.saturating_sub(d) + s.saturating_sub(n - d))
            .sum::<usize>() as f64
    };
    let offsets: Vec<(usize, f64)> = (0..n)
        .filter(|&d| d < max_s || d + max_s > n)
        .map(|d| (d, shared(d)))
        .filter(|&(_, c)| c > 0.0)
        .collect();
    let mut tri = TriMat::with_capacity((n, n), n * offsets.len());
    for p in 0..n {
        for &(d, c) in &offsets {
            let v = if d == 0 { c + prior } else { c };
            tri.add_triplet(ring[p], ring[(p + d) % n], v);
        }
    }
    tri.to_csr()
}

fn mat_vec(a: &CsMat<f64>, x: &[f64], out: &mut [f64]) {
    for (i, row) in a.outer_iterator().enumerate() {
        out[i] = row.iter().map(|(j, &v)| v * x[j]).sum();
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Conjugate gradients for a symmetric positive definite `a`. Returns the solution, the
/// iterations used and the final residual relative to `b`.
fn conjugate_gradient(a: &CsMat<f64>, b: &[f64], mut x: Vec<f64>, max_iter: usize, tol: f64) -> (Vec<f64>, usize, f64) {
    let n = b.len();
    let b_norm = dot(b, b).sqrt().max(f64::MIN_POSITIVE);
    let mut ax = vec![0.0; n];
    mat_vec(a, &x, &mut ax);
    let mut r: Vec<f64> = b.iter().zip(&ax).map(|(b, ax)| b - ax).collect();
    let mut p = r.clone();
    let mut rr = dot(&r, &r);
    let mut ap = vec![0.0; n];
    let mut iter = 0;
    while iter < max_iter && rr.sqrt() > tol * b_norm {
        mat_vec(a, &p, &mut ap);
        let pap = dot(&p, &ap);
        if pap <= 0.0 {
            break;
        }
        let alpha = rr / pap;
        for j in 0..n {
            x[j] += alpha * p[j];
            r[j] -= alpha * ap[j];
        }
        let rr_next = dot(&r, &r);
        let beta = rr_next / rr;
        for j in 0..n {
            p[j] = r[j] + beta * p[j];
        }
        rr = rr_next;
        iter += 1;
    }
    (x, iter, rr.sqrt() / b_norm)
}

/// Deconvolution size factors for one group of cells, on the scale of their library sizes.
/// Returns the factors (in the order of `cells`) and the number of cells that fell back to
/// their library size.
pub fn pool_size_factors(
    counts: &CountMatrix,
    cells: &[usize],
    lib: &[f64],
    pool_sizes: &[usize],
    min_mean: f64,
) -> Result<(Vec<f64>, usize), Error> {
    let n = cells.len();
    let sizes: Vec<usize> = pool_sizes.iter().copied().filter(|&s| s > 0 && s <= n).collect();
    if sizes.is_empty() {
        warn!(
            "{}: group of {} cells is smaller than every pool size, using library sizes",
            Stage::Normalization,
            n
        );
        return Ok((cells.iter().map(|&c| lib[c]).collect(), n));
    }

    let mean_lib = cells.iter().map(|&c| lib[c]).sum::<f64>() / n as f64;
    let mut ave = vec![0.0; counts.genes()];
    for &c in cells {
        for (g, v) in counts.column(c) {
            ave[g] += v as f64 / lib[c] * mean_lib / n as f64;
        }
    }
    let mut position = vec![usize::MAX; counts.genes()];
    let mut kept = Vec::new();
    for (g, &a) in ave.iter().enumerate() {
        if a >= min_mean && a > 0.0 {
            position[g] = kept.len();
            kept.push(a);
        }
    }
    if kept.is_empty() {
        bail!("no gene reaches an average of {} normalized counts", min_mean);
    }
    let normalized: Vec<Vec<(usize, f64)>> = cells
        .iter()
        .map(|&c| {
            counts
                .column(c)
                .into_iter()
                .filter(|(g, _)| position[*g] != usize::MAX)
                .map(|(g, v)| (position[g], v as f64 / lib[c] * mean_lib))
                .collect()
        })
        .collect();

    // ring positions refer to rows of `normalized`
    let local: Vec<usize> = (0..n).collect();
    let local_lib: Vec<f64> = cells.iter().map(|&c| lib[c]).collect();
    let ring = ring_order(&local, &local_lib);

    // normal equations of the pool system: sum_{j in pool} t_j = median ratio
    let mut atb = vec![0.0; n];
    let mut pool = vec![0.0; kept.len()];
    let mut ratios = vec![0.0; kept.len()];
    for &s in &sizes {
        pool.iter_mut().for_each(|p| *p = 0.0);
        for &j in &ring[..s] {
            for &(g, v) in &normalized[j] {
                pool[g] += v;
            }
        }
        for start in 0..n {
            for (r, (&p, &a)) in ratios.iter_mut().zip(pool.iter().zip(&kept)) {
                *r = p / a;
            }
            let b = median_mut(&mut ratios).unwrap_or(0.0);
            for i in 0..s {
                atb[ring[(start + i) % n]] += b;
            }
            for &(g, v) in &normalized[ring[start]] {
                pool[g] -= v;
            }
            for &(g, v) in &normalized[ring[(start + s) % n]] {
                pool[g] += v;
            }
        }
    }
    // each cell's average pool estimate is the starting point
    let per_cell: f64 = sizes.iter().sum::<usize>() as f64;
    let start: Vec<f64> = atb.iter().map(|&b| b / per_cell).collect();
    // weak prior t_j = 1 keeps the system full rank
    atb.iter_mut().for_each(|b| *b += POOL_PRIOR);
    let gram = pool_gram(&ring, &sizes, POOL_PRIOR);
    let (t, iterations, residual) = conjugate_gradient(&gram, &atb, start, CG_MAX_ITER, CG_TOLERANCE);
    if residual > CG_TOLERANCE {
        warn!(
            "{}: pool equations of {} cells stopped after {} iterations at relative residual {:.2e}",
            Stage::Normalization,
            n,
            iterations,
            residual
        );
    } else {
        debug!("{}: pool equations of {} cells solved in {} iterations", Stage::Normalization, n, iterations);
    }

    let mut n_fallback = 0;
    let factors: Vec<f64> = cells
        .iter()
        .enumerate()
        .map(|(j, &c)| {
            if t[j] > 0.0 && t[j].is_finite() {
                t[j] * lib[c]
            } else {
                n_fallback += 1;
                lib[c]
            }
        })
        .collect();
    if n_fallback > 0 {
        warn!(
            "{}: {} of {} cells had non-positive deconvolution factors, using library sizes",
            Stage::Normalization,
            n_fallback,
            n
        );
    }
    Ok((factors, n_fallback))
}

/// Coarse clusters of cells with similar expression so that pools are drawn from comparable
/// cells. One cluster unless there are at least `2 * min_cluster_size` cells.
pub fn quick_cluster(counts: &CountMatrix, lib: &[f64], cfg: &NormConfig) -> Result<Vec<Vec<usize>>, Error> {
    let n = counts.cells();
    let min_size = cfg.min_cluster_size.max(1);
    if n < 2 * min_size {
        return Ok(vec![(0..n).collect()]);
    }
    let k = (n / min_size).clamp(1, cfg.max_preclusters.max(1));
    let mut by_mean: Vec<(usize, f64)> = counts.row_sums().into_iter().enumerate().collect();
    by_mean.sort_by_key(|&(g, s)| (std::cmp::Reverse(n64(s)), g));
    let genes: Vec<usize> = by_mean.iter().take(cfg.precluster_genes).map(|&(g, _)| g).collect();
    let mean_lib = lib.iter().sum::<f64>() / n as f64;
    let sf: Vec<f64> = lib.iter().map(|&l| l / mean_lib).collect();
    let cells: Vec<usize> = (0..n).collect();
    let points: Array2<f64> = log_normalize(counts, &sf).dense_cells_by_genes(&cells, &genes);
    let fit = kmeans(points.view(), k, 3, 100, cfg.seed)?;
    let mut groups = vec![Vec::new(); k];
    for (c, &l) in fit.labels.iter().enumerate() {
        groups[l].push(c);
    }
    groups.retain(|g| !g.is_empty());
    Ok(groups)
}

/// Rescale each group's factors so that its average normalized profile matches that of a
/// reference group (the group with the median library size).
fn rescale_groups(counts: &CountMatrix, groups: &[Vec<usize>], sf: &mut [f64], min_mean: f64) {
    if groups.len() < 2 {
        return;
    }
    let scale = sf.iter().sum::<f64>() / sf.len() as f64;
    let profiles: Vec<Vec<f64>> = groups
        .par_iter()
        .map(|cells| {
            let mut p = vec![0.0; counts.genes()];
            for &c in cells {
                for (g, v) in counts.column(c) {
                    p[g] += v as f64 / (sf[c] / scale) / cells.len() as f64;
                }
            }
            p
        })
        .collect();
    let mut order: Vec<(usize, f64)> = groups
        .iter()
        .enumerate()
        .map(|(i, cells)| {
            let mut l: Vec<f64> = cells.iter().map(|&c| counts.column(c).iter().map(|&(_, v)| v as f64).sum()).collect();
            (i, median_mut(&mut l).unwrap_or(0.0))
        })
        .collect();
    order.sort_by_key(|&(i, m)| (n64(m), i));
    let reference = order[(order.len() - 1) / 2].0;

    for (i, cells) in groups.iter().enumerate() {
        if i == reference {
            continue;
        }
        let ratios: Vec<f64> = profiles[i]
            .iter()
            .zip(&profiles[reference])
            .filter(|&(&a, &r)| a > 0.0 && r > 0.0 && (a + r) / 2.0 >= min_mean)
            .map(|(&a, &r)| a / r)
            .collect();
        match median(&ratios) {
            Some(f) if f > 0.0 => {
                debug!("{}: group {} rescaled by {:.4}", Stage::Normalization, i, f);
                for &c in cells {
                    sf[c] *= f;
                }
            }
            _ => warn!(
                "{}: group {} shares no expressed genes with the reference group, not rescaled",
                Stage::Normalization,
                i
            ),
        }
    }
}

/// Estimate size factors, center them to unit median and attach the log-normalized matrix.
/// Cells with a zero total count are an error; quality control must remove them first.
pub fn normalize(ds: &Dataset, cfg: &NormConfig) -> Result<(Dataset, SizeFactorSummary), Error> {
    let counts = ds.counts();
    let lib = library_size_factors(counts);
    if let Some(c) = lib.iter().position(|&l| l <= 0.0) {
        return Err(PipelineError::insufficient(
            Stage::Normalization,
            format!("cell '{}'", ds.barcodes()[c]),
            "zero total count; remove empty cells before normalizing",
        ));
    }

    let (mut sf, n_clusters, n_fallback) = match cfg.method {
        Normalization::LibrarySize => (lib.clone(), 1, 0),
        Normalization::Deconvolution => {
            let groups: Vec<Vec<usize>> = match &cfg.cluster_column {
                Some(col) => ds.cells().factor(col)?.groups().into_iter().filter(|g| !g.is_empty()).collect(),
                None => quick_cluster(counts, &lib, cfg)?,
            };
            let results: Vec<Result<(Vec<f64>, usize), Error>> = groups
                .par_iter()
                .map(|cells| pool_size_factors(counts, cells, &lib, &cfg.pool_sizes, cfg.min_mean))
                .collect();
            let mut sf = vec![0.0; ds.n_cells()];
            let mut n_fallback = 0;
            for (cells, res) in groups.iter().zip(results) {
                let (factors, fb) = res?;
                n_fallback += fb;
                for (&c, f) in cells.iter().zip(factors) {
                    sf[c] = f;
                }
            }
            rescale_groups(counts, &groups, &mut sf, cfg.min_mean);
            (sf, groups.len(), n_fallback)
        }
    };
    center_size_factors(&mut sf)?;

    let log = log_normalize(counts, &sf);
    let summary = SizeFactorSummary {
        method: cfg.method,
        n_clusters,
        n_fallback,
        size_factors: FiveNumber::of(&sf).ok_or_else(|| format_err!("no cells to normalize"))?,
    };
    info!(
        "{}: {:?} size factors over {} cells in {} groups: min {:.3} median {:.3} max {:.3}",
        Stage::Normalization,
        cfg.method,
        sf.len(),
        n_clusters,
        summary.size_factors.min,
        summary.size_factors.median,
        summary.size_factors.max
    );
    let ds = ds.clone().with_normalization(sf.into(), log)?;
    Ok((ds, summary))
}
