//! Marker genes from pairwise comparisons between clusters.
//!
//! Every ordered pair of clusters (A, B) gets a per-gene Welch t-test on log-expression. Genes are
//! ranked within each comparison, and a cluster's marker table combines its comparisons against
//! all other clusters.

use crate::dist::{bh_in_order, holm};
use crate::ttest::{blocked_welch, GroupStats, PairOutcome};
use anyhow::{bail, Error};
use log::{debug, info};
use noisy_float::types::n64;
use rayon::prelude::*;
use scan_types::{ExprMatrix, Factor};
use std::cmp::Ordering;
use std::str::FromStr;
use thiserror::Error;

/// Which kind of difference counts as evidence of a marker
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    /// higher in the cluster of interest
    Up,
    /// lower in the cluster of interest
    Down,
    /// either way
    Any,
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            "any" => Ok(Direction::Any),
            _ => bail!("Direction not recognized: {}", s),
        }
    }
}

/// How per-comparison results are combined into a cluster-level rank and p-value
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PvalType {
    /// a gene must rank well against every other cluster: worst rank, largest p-value
    All,
    /// a gene must rank well against some other cluster: best rank, Holm-corrected minimum p-value
    Any,
}

impl FromStr for PvalType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(PvalType::All),
            "any" => Ok(PvalType::Any),
            _ => bail!("PvalType not recognized: {}", s),
        }
    }
}

/// Marker detection settings
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MarkerConfig {
    /// direction of the tested difference
    pub direction: Direction,
    /// log-fold-change the difference must exceed
    pub lfc: f64,
    /// combination of the per-comparison results
    pub pval_type: PvalType,
    /// genes with `top <= top_cutoff` form the marker set
    pub top_cutoff: usize,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        MarkerConfig {
            direction: Direction::Up,
            lfc: 0.0,
            pval_type: PvalType::All,
            top_cutoff: 10,
        }
    }
}

/// A cluster without enough cells to be compared against the others. Travels inside the
/// `anyhow::Error` returned by [`find_markers`].
#[derive(Clone, Debug, PartialEq, Error)]
#[error("cluster '{cluster}' cannot be tested: {detail}")]
pub struct UntestableCluster {
    /// cluster label
    pub cluster: String,
    /// what is missing
    pub detail: String,
}

/// One gene in a cluster's marker table
#[derive(Clone, Debug, PartialEq)]
pub struct MarkerRow {
    /// gene (row) index in the expression matrix
    pub gene: usize,
    /// gene identifier
    pub gene_id: String,
    /// combined rank across comparisons, 1 is best
    pub top: usize,
    /// combined p-value
    pub p_value: f64,
    /// Benjamini-Hochberg FDR of the combined p-value
    pub fdr: f64,
    /// log-fold-change from the comparison that determined the combined p-value
    pub summary_logfc: f64,
    /// log-fold-change against each other cluster, in the order of [`MarkerTable::others`]
    pub logfc: Vec<f64>,
}

/// Ranked marker genes for one cluster against all other clusters
#[derive(Clone, Debug)]
pub struct MarkerTable {
    cluster: String,
    others: Vec<String>,
    top_cutoff: usize,
    rows: Vec<MarkerRow>,
}

impl MarkerTable {
    /// Cluster of interest
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// The clusters it was compared against
    pub fn others(&self) -> &[String] {
        &self.others
    }

    /// All genes, ordered by `top`, then p-value, then gene index
    pub fn rows(&self) -> &[MarkerRow] {
        &self.rows
    }

    /// Genes with `top` within the configured cutoff
    pub fn markers(&self) -> impl Iterator<Item = &MarkerRow> {
        let cutoff = self.top_cutoff;
        self.rows.iter().filter(move |r| r.top <= cutoff)
    }

    /// Row for a gene index
    pub fn gene(&self, gene: usize) -> Option<&MarkerRow> {
        self.rows.iter().find(|r| r.gene == gene)
    }

    /// Log-fold-change of `gene` against cluster `other`
    pub fn logfc(&self, gene: usize, other: &str) -> Option<f64> {
        let j = self.others.iter().position(|o| o == other)?;
        self.gene(gene).map(|r| r.logfc[j])
    }
}

/// p-value of one directed comparison
fn directed_p(o: &PairOutcome, direction: Direction) -> f64 {
    match direction {
        Direction::Up => o.right,
        Direction::Down => o.left,
        // x2 is a Bonferroni correction over the two one-sided tests
        Direction::Any => o.left.min(o.right).min(0.5) * 2.0,
    }
}

fn effect(o: &PairOutcome, direction: Direction) -> f64 {
    match direction {
        Direction::Up => o.logfc,
        Direction::Down => -o.logfc,
        Direction::Any => o.logfc.abs(),
    }
}

/// 1-based rank of each gene in one comparison: by p-value, then larger effect, then gene index.
fn comparison_ranks(outcomes: &[PairOutcome], direction: Direction) -> Vec<usize> {
    let mut order: Vec<usize> = (0..outcomes.len()).collect();
    let key = |g: usize| {
        let p = directed_p(&outcomes[g], direction);
        // untestable values sort last
        let p = if p.is_nan() { f64::INFINITY } else { p };
        (n64(p), n64(-effect(&outcomes[g], direction)))
    };
    order.sort_by(|&a, &b| key(a).cmp(&key(b)).then(a.cmp(&b)));
    let mut ranks = vec![0; outcomes.len()];
    for (r, g) in order.into_iter().enumerate() {
        ranks[g] = r + 1;
    }
    ranks
}

/// Find marker genes for every cluster.
///
/// `expr` is the genes x cells log-expression matrix, `clusters` labels every cell, and `block`
/// optionally labels a nuisance factor (e.g. batch) within which comparisons are made before
/// being combined. Runs in the current rayon pool.
pub fn find_markers(
    expr: &ExprMatrix,
    gene_ids: &[String],
    clusters: &Factor,
    block: Option<&Factor>,
    cfg: &MarkerConfig,
) -> Result<Vec<MarkerTable>, Error> {
    if clusters.len() != expr.cells() {
        bail!("{} cluster labels for {} cells", clusters.len(), expr.cells());
    }
    if gene_ids.len() != expr.genes() {
        bail!("{} gene ids for {} genes", gene_ids.len(), expr.genes());
    }
    if let Some(b) = block {
        if b.len() != expr.cells() {
            bail!("{} block labels for {} cells", b.len(), expr.cells());
        }
    }
    let clusters = clusters.clone().drop_unused_levels();
    let k = clusters.n_levels();
    if k < 2 {
        bail!("marker detection needs at least two clusters, found {}", k);
    }
    let genes = expr.genes();

    // cells of each (cluster, block) combination
    let n_blocks = block.map_or(1, |b| b.n_levels());
    let mut members = vec![vec![Vec::new(); n_blocks]; k];
    for cell in 0..expr.cells() {
        let b = block.map_or(0, |b| b.code(cell));
        members[clusters.code(cell)][b].push(cell);
    }

    // each unordered pair is tested once; (b, a) is derived by flipping (a, b)
    let pairs: Vec<(usize, usize)> = (0..k).flat_map(|a| ((a + 1)..k).map(move |b| (a, b))).collect();
    for (a, per_block) in members.iter().enumerate() {
        let n: usize = per_block.iter().map(Vec::len).sum();
        if n < 2 {
            return Err(UntestableCluster {
                cluster: clusters.levels()[a].clone(),
                detail: format!("{} cell(s), need at least 2", n),
            }
            .into());
        }
    }
    for &(a, b) in &pairs {
        let shared = (0..n_blocks).any(|j| members[a][j].len() >= 2 && members[b][j].len() >= 2);
        if !shared {
            let (small, other) = if members[a].iter().map(Vec::len).sum::<usize>()
                <= members[b].iter().map(Vec::len).sum::<usize>()
            {
                (a, b)
            } else {
                (b, a)
            };
            return Err(UntestableCluster {
                cluster: clusters.levels()[small].clone(),
                detail: format!(
                    "no block where it and cluster '{}' both have 2 or more cells",
                    clusters.levels()[other]
                ),
            }
            .into());
        }
    }

    info!(
        "testing {} clusters ({} pairs) over {} genes in {} block(s)",
        k,
        k * (k - 1) / 2,
        genes,
        n_blocks
    );

    let stats: Vec<Vec<GroupStats>> = members
        .par_iter()
        .map(|per_block| per_block.par_iter().map(|cells| GroupStats::compute(expr, cells)).collect())
        .collect();

    let outcomes: Vec<Vec<PairOutcome>> = pairs
        .par_iter()
        .map(|&(a, b)| {
            (0..genes)
                .map(|g| blocked_welch(&stats[a], &stats[b], g, cfg.lfc))
                .collect()
        })
        .collect();
    let pair_index = |a: usize, b: usize| -> usize {
        // position of (min, max) in `pairs`
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        lo * k - lo * (lo + 1) / 2 + (hi - lo - 1)
    };

    let tables = (0..k)
        .into_par_iter()
        .map(|a| {
            let others: Vec<usize> = (0..k).filter(|&b| b != a).collect();
            let directed: Vec<Vec<PairOutcome>> = others
                .iter()
                .map(|&b| {
                    let o = &outcomes[pair_index(a, b)];
                    if a < b {
                        o.clone()
                    } else {
                        o.iter().map(|x| x.flipped()).collect()
                    }
                })
                .collect();
            let ranks: Vec<Vec<usize>> = directed
                .iter()
                .map(|o| comparison_ranks(o, cfg.direction))
                .collect();

            let mut rows = Vec::with_capacity(genes);
            let mut combined_p = Vec::with_capacity(genes);
            for g in 0..genes {
                let p: Vec<f64> = directed.iter().map(|o| directed_p(&o[g], cfg.direction)).collect();
                let r = ranks.iter().map(|r| r[g]);
                let (top, p_value, pick) = match cfg.pval_type {
                    PvalType::All => {
                        let pick = argmax(&p);
                        (r.max().unwrap_or(0), p[pick], pick)
                    }
                    PvalType::Any => {
                        let pick = argmin(&p);
                        let adj = holm(&p);
                        let best = adj.iter().copied().fold(f64::INFINITY, f64::min);
                        (r.min().unwrap_or(0), best, pick)
                    }
                };
                combined_p.push(p_value);
                rows.push(MarkerRow {
                    gene: g,
                    gene_id: gene_ids[g].clone(),
                    top,
                    p_value,
                    fdr: f64::NAN,
                    summary_logfc: directed[pick][g].logfc,
                    logfc: directed.iter().map(|o| o[g].logfc).collect(),
                });
            }
            for (row, q) in rows.iter_mut().zip(bh_in_order(&combined_p)) {
                row.fdr = q;
            }
            rows.sort_by(|x, y| {
                x.top
                    .cmp(&y.top)
                    .then(x.p_value.partial_cmp(&y.p_value).unwrap_or(Ordering::Equal))
                    .then(x.gene.cmp(&y.gene))
            });
            debug!(
                "cluster {}: {} genes with top <= {}",
                clusters.levels()[a],
                rows.iter().filter(|r| r.top <= cfg.top_cutoff).count(),
                cfg.top_cutoff
            );
            MarkerTable {
                cluster: clusters.levels()[a].clone(),
                others: others.iter().map(|&b| clusters.levels()[b].clone()).collect(),
                top_cutoff: cfg.top_cutoff,
                rows,
            }
        })
        .collect();
    Ok(tables)
}

// first index of the largest value, NaN counted as largest
fn argmax(p: &[f64]) -> usize {
    let mut best = 0;
    for i in 1..p.len() {
        if p[i].is_nan() && !p[best].is_nan() || p[i] > p[best] {
            best = i;
        }
    }
    best
}

fn argmin(p: &[f64]) -> usize {
    let mut best = 0;
    for i in 1..p.len() {
        if p[i] < p[best] || p[best].is_nan() && !p[i].is_nan() {
            best = i;
        }
    }
    best
}
