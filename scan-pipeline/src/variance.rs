//! Per-gene variance decomposition into technical (trend) and biological (residual) parts.

use crate::error::{PipelineError, Stage};
use crate::stats::median_mut;
use anyhow::{bail, Error};
use log::{debug, info};
use noisy_float::types::n64;
use rayon::prelude::*;
use scan_types::{Column, Dataset, Factor};
use serde::{Deserialize, Serialize};
use statrs::distribution::{Discrete, Poisson};
use std::cmp::Reverse;

/// How the technical component is obtained
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendKind {
    /// Robust local regression of variance on mean across genes
    Empirical,
    /// Exact variance of log-normalized Poisson counts at each mean
    Poisson,
}

/// Highly variable gene selection
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvgSelection {
    /// this fraction of all genes, rounded up
    TopFraction(f64),
    TopCount(usize),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VarianceConfig {
    pub trend: TrendKind,
    /// fraction of fitted genes in each local regression
    pub span: f64,
    pub robustness_iterations: usize,
    /// genes with a lower mean log-expression don't enter the empirical fit
    pub min_mean: f64,
    pub selection: HvgSelection,
    /// only genes with biological variance strictly above this are selected
    pub min_bio: Option<f64>,
    /// points on the Poisson trend grid
    pub poisson_grid: usize,
    /// cells sampled to compute Poisson technical variance
    pub poisson_max_cells: usize,
}

impl Default for VarianceConfig {
    fn default() -> Self {
        VarianceConfig {
            trend: TrendKind::Empirical,
            span: 0.3,
            robustness_iterations: 3,
            min_mean: 0.1,
            selection: HvgSelection::TopFraction(0.1),
            min_bio: Some(0.0),
            poisson_grid: 100,
            poisson_max_cells: 200,
        }
    }
}

/// Per-gene decomposition. `total == tech + bio` for every gene.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct GeneVarTable {
    pub mean: Vec<f64>,
    pub total: Vec<f64>,
    pub tech: Vec<f64>,
    pub bio: Vec<f64>,
}

impl GeneVarTable {
    pub fn len(&self) -> usize {
        self.mean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }
}

/// A fitted trend, evaluated by linear interpolation between knots. Below the first knot it
/// goes linearly to zero at the origin, above the last it stays flat.
#[derive(Clone, Debug, PartialEq)]
pub struct Trend {
    xs: Vec<f64>,
    ys: Vec<f64>,
}

impl Trend {
    /// Knots need not be sorted; duplicate `x` keep their first `y`.
    pub fn new(xs: &[f64], ys: &[f64]) -> Result<Trend, Error> {
        if xs.len() != ys.len() || xs.is_empty() {
            bail!("trend needs matching, non-empty knots ({} x, {} y)", xs.len(), ys.len());
        }
        let mut order: Vec<usize> = (0..xs.len()).collect();
        order.sort_by_key(|&i| (n64(xs[i]), i));
        order.dedup_by_key(|i| n64(xs[*i]));
        Ok(Trend {
            xs: order.iter().map(|&i| xs[i]).collect(),
            ys: order.iter().map(|&i| ys[i]).collect(),
        })
    }

    pub fn predict(&self, x: f64) -> f64 {
        let n = self.xs.len();
        if x <= self.xs[0] {
            return if self.xs[0] > 0.0 && x >= 0.0 {
                self.ys[0] * x / self.xs[0]
            } else {
                self.ys[0]
            };
        }
        if x >= self.xs[n - 1] {
            return self.ys[n - 1];
        }
        let hi = self.xs.partition_point(|&k| k < x);
        if self.xs[hi] == x {
            return self.ys[hi];
        }
        let lo = hi - 1;
        let f = (x - self.xs[lo]) / (self.xs[hi] - self.xs[lo]);
        self.ys[lo] + f * (self.ys[hi] - self.ys[lo])
    }
}

/// Locally weighted linear regression (tricube kernel over the `span` nearest points) with
/// bisquare robustness iterations. Returns the fitted value at every input point.
pub fn lowess(x: &[f64], y: &[f64], span: f64, iterations: usize) -> Vec<f64> {
    let n = x.len();
    if n < 2 {
        return y.to_vec();
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&i| (n64(x[i]), i));
    let xs: Vec<f64> = order.iter().map(|&i| x[i]).collect();
    let ys: Vec<f64> = order.iter().map(|&i| y[i]).collect();
    let r = ((span * n as f64).ceil() as usize).clamp(2, n);

    // left end of the r-point neighbourhood of each point
    let mut windows = Vec::with_capacity(n);
    let mut lo = 0;
    for i in 0..n {
        while lo + r < n && xs[i] - xs[lo] > xs[lo + r] - xs[i] {
            lo += 1;
        }
        windows.push(lo);
    }

    let scale = ys.iter().map(|v| v.abs()).sum::<f64>() / n as f64;
    let mut robust = vec![1.0; n];
    let mut iter = 0;
    let fitted = loop {
        let fitted: Vec<f64> = (0..n)
            .into_par_iter()
            .map(|i| local_fit(&xs, &ys, &robust, windows[i], r, i))
            .collect();
        if iter == iterations {
            break fitted;
        }
        let residuals: Vec<f64> = ys.iter().zip(&fitted).map(|(y, f)| (y - f).abs()).collect();
        // the median is 0 once more than half of the points fit exactly; the mean residual
        // still separates the outliers from them
        let mean_abs = residuals.iter().sum::<f64>() / n as f64;
        let s = median_mut(&mut residuals.clone()).unwrap_or(0.0).max(0.1 * mean_abs);
        if s <= 1e-10 * scale {
            break fitted;
        }
        for (w, e) in robust.iter_mut().zip(&residuals) {
            let u = e / (6.0 * s);
            *w = if u < 1.0 { (1.0 - u * u).powi(2) } else { 0.0 };
        }
        iter += 1;
    };

    let mut out = vec![0.0; n];
    for (k, &i) in order.iter().enumerate() {
        out[i] = fitted[k];
    }
    out
}

fn local_fit(xs: &[f64], ys: &[f64], robust: &[f64], lo: usize, r: usize, i: usize) -> f64 {
    let x0 = xs[i];
    let h = (x0 - xs[lo]).max(xs[lo + r - 1] - x0);
    let (mut sw, mut swx, mut swy, mut swxx, mut swxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for k in lo..lo + r {
        let d = (xs[k] - x0).abs();
        let kernel = if h > 0.0 {
            let u = d / h;
            if u < 1.0 {
                (1.0 - u * u * u).powi(3)
            } else {
                0.0
            }
        } else {
            1.0
        };
        let w = kernel * robust[k];
        sw += w;
        swx += w * xs[k];
        swy += w * ys[k];
        swxx += w * xs[k] * xs[k];
        swxy += w * xs[k] * ys[k];
    }
    if sw <= 0.0 {
        return ys[i];
    }
    let mx = swx / sw;
    let my = swy / sw;
    let sxx = swxx / sw - mx * mx;
    if sxx <= 1e-12 * (1.0 + mx * mx) {
        return my;
    }
    let slope = (swxy / sw - mx * my) / sxx;
    my + slope * (x0 - mx)
}

/// Mean-variance trend fitted through the genes
pub fn fit_trend_empirical(mean: &[f64], var: &[f64], cfg: &VarianceConfig) -> Result<Trend, Error> {
    let mut fit: Vec<usize> = (0..mean.len()).filter(|&g| mean[g] >= cfg.min_mean).collect();
    if fit.len() < 3 {
        fit = (0..mean.len()).filter(|&g| mean[g] > 0.0).collect();
    }
    if fit.len() < 2 {
        return Err(PipelineError::insufficient(
            Stage::VarianceModel,
            "trend",
            format!("{} expressed genes, need at least 2", fit.len()),
        ));
    }
    let x: Vec<f64> = fit.iter().map(|&g| mean[g]).collect();
    let y: Vec<f64> = fit.iter().map(|&g| var[g]).collect();
    let fitted = lowess(&x, &y, cfg.span, cfg.robustness_iterations);
    Trend::new(&x, &fitted)
}

/// Mean and variance of `log2(X / s + 1)` for `X ~ Poisson(lambda * s)`
pub fn log_poisson_moments(lambda: f64, s: f64) -> (f64, f64) {
    let mu = lambda * s;
    if mu <= 0.0 {
        return (0.0, 0.0);
    }
    let Ok(pois) = Poisson::new(mu) else {
        return (0.0, 0.0);
    };
    let spread = 10.0 * mu.sqrt() + 5.0;
    let start = (mu - spread).max(0.0).floor() as u64;
    let end = (mu + spread).ceil() as u64;
    let (mut m1, mut m2) = (0.0, 0.0);
    for x in start..=end {
        let p = pois.pmf(x);
        let f = (x as f64 / s + 1.0).log2();
        m1 += p * f;
        m2 += p * f * f;
    }
    (m1, (m2 - m1 * m1).max(0.0))
}

/// Technical trend for log-normalized Poisson counts with the given size factors, evaluated on
/// a log-spaced grid of count-scale means.
pub fn fit_trend_poisson(size_factors: &[f64], lambda_range: (f64, f64), cfg: &VarianceConfig) -> Result<Trend, Error> {
    let step = size_factors.len().div_ceil(cfg.poisson_max_cells.max(1)).max(1);
    let sf: Vec<f64> = size_factors.iter().step_by(step).copied().collect();
    let (lo, hi) = lambda_range;
    if sf.is_empty() || !(lo > 0.0 && hi >= lo) {
        return Err(PipelineError::insufficient(
            Stage::VarianceModel,
            "Poisson trend",
            "no expressed genes or size factors",
        ));
    }
    let n_grid = cfg.poisson_grid.max(2);
    let points: Vec<(f64, f64)> = (0..n_grid)
        .into_par_iter()
        .map(|k| {
            let lambda = (lo.ln() + (hi / lo).ln() * k as f64 / (n_grid - 1) as f64).exp();
            let moments: Vec<(f64, f64)> = sf.iter().map(|&s| log_poisson_moments(lambda, s)).collect();
            let n = moments.len() as f64;
            let mean = moments.iter().map(|m| m.0).sum::<f64>() / n;
            let within = moments.iter().map(|m| m.1).sum::<f64>() / n;
            let between = moments.iter().map(|m| (m.0 - mean).powi(2)).sum::<f64>() / n;
            (mean, within + between)
        })
        .collect();
    let xs: Vec<f64> = points.iter().map(|p| p.0).collect();
    let ys: Vec<f64> = points.iter().map(|p| p.1).collect();
    Trend::new(&xs, &ys)
}

fn model_block(ds: &Dataset, cells: &[usize], cfg: &VarianceConfig) -> Result<GeneVarTable, Error> {
    let log = ds.require_logcounts()?;
    let (mean, total) = log.row_mean_var(cells);
    let trend = match cfg.trend {
        TrendKind::Empirical => fit_trend_empirical(&mean, &total, cfg)?,
        TrendKind::Poisson => {
            let Some(all_sf) = ds.size_factors() else {
                bail!("{}: Poisson trend needs size factors", Stage::VarianceModel);
            };
            let sf: Vec<f64> = cells.iter().map(|&c| all_sf[c]).collect();
            let counts = ds.counts();
            let mut lambda = vec![0.0; counts.genes()];
            for (&c, &s) in cells.iter().zip(&sf) {
                for (g, v) in counts.column(c) {
                    lambda[g] += v as f64 / s / cells.len() as f64;
                }
            }
            let positive = lambda.iter().copied().filter(|&l| l > 0.0);
            let lo = positive.clone().fold(f64::INFINITY, f64::min);
            let hi = positive.fold(0.0, f64::max);
            fit_trend_poisson(&sf, (lo, hi), cfg)?
        }
    };
    let tech: Vec<f64> = mean.iter().map(|&m| trend.predict(m)).collect();
    let bio = total.iter().zip(&tech).map(|(t, k)| t - k).collect();
    Ok(GeneVarTable { mean, total, tech, bio })
}

/// Model per-gene variance of the log-normalized matrix. With `block`, each level is modelled
/// separately (in parallel) and the results are averaged with weights `cells - 1`.
pub fn model_gene_var(ds: &Dataset, cfg: &VarianceConfig, block: Option<&Factor>) -> Result<GeneVarTable, Error> {
    let blocks: Vec<(String, Vec<usize>)> = match block {
        Some(f) => f
            .levels()
            .iter()
            .cloned()
            .zip(f.groups())
            .filter(|(_, cells)| !cells.is_empty())
            .collect(),
        None => vec![("all".to_string(), (0..ds.n_cells()).collect())],
    };
    let usable: Vec<&(String, Vec<usize>)> = blocks.iter().filter(|(_, c)| c.len() >= 2).collect();
    if usable.is_empty() {
        return Err(PipelineError::insufficient(
            Stage::VarianceModel,
            format!("dataset '{}'", ds.name()),
            "no block has two or more cells",
        ));
    }
    for (name, cells) in blocks.iter().filter(|(_, c)| c.len() < 2) {
        debug!("{}: skipping block '{}' with {} cells", Stage::VarianceModel, name, cells.len());
    }

    let fits: Vec<GeneVarTable> = usable
        .par_iter()
        .map(|(_, cells)| model_block(ds, cells, cfg))
        .collect::<Result<_, _>>()?;

    if fits.len() == 1 {
        return Ok(fits.into_iter().next().unwrap_or_default());
    }
    let weights: Vec<f64> = usable.iter().map(|(_, c)| (c.len() - 1) as f64).collect();
    let wsum: f64 = weights.iter().sum();
    let combine = |pick: fn(&GeneVarTable) -> &Vec<f64>| -> Vec<f64> {
        (0..ds.n_genes())
            .map(|g| fits.iter().zip(&weights).map(|(f, w)| pick(f)[g] * w).sum::<f64>() / wsum)
            .collect()
    };
    let mean = combine(|f| &f.mean);
    let total = combine(|f| &f.total);
    let tech = combine(|f| &f.tech);
    let bio = total.iter().zip(&tech).map(|(t, k)| t - k).collect();
    Ok(GeneVarTable { mean, total, tech, bio })
}

/// Highly variable genes: ranked by biological variance, largest first, ties broken by gene id.
pub fn select_hvgs(gene_ids: &[String], bio: &[f64], selection: HvgSelection, min_bio: Option<f64>) -> Vec<usize> {
    let n = match selection {
        HvgSelection::TopFraction(f) => ((f * gene_ids.len() as f64).ceil() as usize).max(1),
        HvgSelection::TopCount(n) => n,
    };
    let mut candidates: Vec<usize> = (0..bio.len())
        .filter(|&g| bio[g].is_finite() && min_bio.map_or(true, |m| bio[g] > m))
        .collect();
    candidates.sort_by(|&a, &b| (Reverse(n64(bio[a])), &gene_ids[a]).cmp(&(Reverse(n64(bio[b])), &gene_ids[b])));
    candidates.truncate(n);
    candidates
}

/// Model variance, attach `mean`/`total`/`tech`/`bio`/`hvg` gene columns and return the selected
/// genes in rank order.
pub fn model_and_select(
    ds: Dataset,
    cfg: &VarianceConfig,
    block: Option<&Factor>,
) -> Result<(Dataset, GeneVarTable, Vec<usize>), Error> {
    let table = model_gene_var(&ds, cfg, block)?;
    let hvgs = select_hvgs(ds.gene_ids(), &table.bio, cfg.selection, cfg.min_bio);
    if hvgs.is_empty() {
        return Err(PipelineError::insufficient(
            Stage::VarianceModel,
            "highly variable genes",
            "no gene has positive biological variance",
        ));
    }
    let mut flags = vec![false; ds.n_genes()];
    for &g in &hvgs {
        flags[g] = true;
    }
    info!(
        "{}: {:?} trend over {} genes, {} selected{}",
        Stage::VarianceModel,
        cfg.trend,
        table.len(),
        hvgs.len(),
        block.map_or(String::new(), |b| format!(" (blocked on {} levels)", b.n_levels()))
    );
    let ds = ds
        .with_gene_column("mean", Column::Num(table.mean.clone()))?
        .with_gene_column("total", Column::Num(table.total.clone()))?
        .with_gene_column("tech", Column::Num(table.tech.clone()))?
        .with_gene_column("bio", Column::Num(table.bio.clone()))?
        .with_gene_column("hvg", Column::Bool(flags))?;
    Ok((ds, table, hvgs))
}
