//! Mutual nearest-neighbour batch correction in a shared low-dimensional space.
//!
//! Cells are cosine-normalized, projected with a PCA in which every batch weighs the same, and
//! batches are then merged one at a time into a growing reference. For each incoming batch,
//! pairs of cells that are among each other's `k` nearest neighbours across the two sets
//! define correction vectors; these are smoothed over the whole batch with a Gaussian kernel
//! and added to it.

use crate::dim_red::pca::multi_batch_pca;
use crate::dim_red::rand_svd::RandSvd;
use crate::error::{PipelineError, Stage};
use crate::nn::knn_query;
use anyhow::{bail, Error};
use log::{debug, info};
use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;
use scan_types::{Dataset, Factor};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MnnConfig {
    /// neighbours searched in each direction
    pub k: usize,
    /// dimensions of the shared PCA
    pub ndim: usize,
    /// Gaussian kernel width for smoothing correction vectors
    pub sigma: f64,
    /// batch names in merge order; largest first when unset
    pub merge_order: Option<Vec<String>>,
    /// scale each cell's expression vector to unit length first
    pub cos_norm: bool,
    pub seed: u64,
}

impl Default for MnnConfig {
    fn default() -> Self {
        MnnConfig {
            k: 20,
            ndim: 50,
            sigma: 0.1,
            merge_order: None,
            cos_norm: true,
            seed: 0,
        }
    }
}

/// One merge of a batch into the running reference
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MergeStep {
    pub batch: String,
    /// number of mutual nearest-neighbour pairs found
    pub pairs: usize,
    /// fraction of each batch's variance removed by this step, for every batch merged so far
    pub lost_var: Vec<(String, f64)>,
}

/// Scale every row to unit Euclidean norm; all-zero rows stay zero
pub fn cosine_normalize(mut x: Array2<f64>) -> Array2<f64> {
    x.axis_iter_mut(Axis(0)).into_par_iter().for_each(|mut row| {
        let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|v| v / norm);
        }
    });
    x
}

/// Pairs `(reference row, target row)` that are mutually among each other's `k` nearest
pub fn find_mutual_nn(reference: ArrayView2<f64>, target: ArrayView2<f64>, k: usize) -> Result<Vec<(usize, usize)>, Error> {
    let k_ref = k.min(reference.nrows());
    let k_tgt = k.min(target.nrows());
    let from_target = knn_query(reference, target, k_ref)?;
    let from_reference = knn_query(target, reference, k_tgt)?;
    let reverse: HashSet<(usize, usize)> = from_reference
        .indices
        .outer_iter()
        .enumerate()
        .flat_map(|(r, row)| row.iter().map(move |&t| (r, t)).collect::<Vec<_>>())
        .collect();
    let mut pairs = Vec::new();
    for (t, row) in from_target.indices.outer_iter().enumerate() {
        for &r in row.iter() {
            if reverse.contains(&(r, t)) {
                pairs.push((r, t));
            }
        }
    }
    pairs.sort_unstable();
    Ok(pairs)
}

/// Per-cell correction for `target`: each paired target cell gets the mean of `ref - target`
/// over its pairs, and every target cell gets a Gaussian-weighted average of those.
pub fn smoothed_correction(
    reference: ArrayView2<f64>,
    target: ArrayView2<f64>,
    pairs: &[(usize, usize)],
    sigma: f64,
) -> Array2<f64> {
    let d = target.ncols();
    let mut sums = std::collections::BTreeMap::<usize, (Vec<f64>, usize)>::new();
    for &(r, t) in pairs {
        let entry = sums.entry(t).or_insert_with(|| (vec![0.0; d], 0));
        for j in 0..d {
            entry.0[j] += reference[[r, j]] - target[[t, j]];
        }
        entry.1 += 1;
    }
    let anchors: Vec<(usize, Vec<f64>)> = sums
        .into_iter()
        .map(|(t, (v, n))| (t, v.into_iter().map(|x| x / n as f64).collect()))
        .collect();

    let s2 = sigma * sigma;
    let rows: Vec<Vec<f64>> = (0..target.nrows())
        .into_par_iter()
        .map(|c| {
            let logw: Vec<f64> = anchors
                .iter()
                .map(|(a, _)| {
                    let dist2: f64 = (0..d).map(|j| (target[[c, j]] - target[[*a, j]]).powi(2)).sum();
                    -dist2 / s2
                })
                .collect();
            let max = logw.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let w: Vec<f64> = logw.iter().map(|l| (l - max).exp()).collect();
            let total: f64 = w.iter().sum();
            let mut out = vec![0.0; d];
            for (wi, (_, v)) in w.iter().zip(&anchors) {
                for j in 0..d {
                    out[j] += wi * v[j] / total;
                }
            }
            out
        })
        .collect();
    Array2::from_shape_fn((target.nrows(), d), |(i, j)| rows[i][j])
}

/// Total variance (sum over dimensions) of the given rows
fn within_variance(x: ArrayView2<f64>, rows: &[usize]) -> f64 {
    if rows.len() < 2 {
        return 0.0;
    }
    let sub = x.select(Axis(0), rows);
    let n = rows.len() as f64;
    sub.axis_iter(Axis(1))
        .map(|col| {
            let m = col.sum() / n;
            col.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (n - 1.0)
        })
        .sum()
}

fn merge_order(batch: &Factor, cfg: &MnnConfig) -> Result<Vec<usize>, Error> {
    match &cfg.merge_order {
        Some(names) => {
            let mut order = Vec::with_capacity(names.len());
            for name in names {
                match batch.level_index(name) {
                    Some(i) if !order.contains(&i) => order.push(i),
                    Some(_) => bail!("{}: batch '{}' listed twice in merge order", Stage::Integration, name),
                    None => bail!("{}: unknown batch '{}' in merge order", Stage::Integration, name),
                }
            }
            if order.len() != batch.n_levels() {
                bail!(
                    "{}: merge order names {} of {} batches",
                    Stage::Integration,
                    order.len(),
                    batch.n_levels()
                );
            }
            Ok(order)
        }
        None => {
            let counts = batch.counts();
            let mut order: Vec<usize> = (0..batch.n_levels()).collect();
            order.sort_by_key(|&b| (std::cmp::Reverse(counts[b]), b));
            Ok(order)
        }
    }
}

/// Correct `batch` effects among the cells of `ds` using the genes in `hvgs`. Attaches the
/// `corrected` embedding and returns one [`MergeStep`] per merged batch.
pub fn fast_mnn(
    ds: Dataset,
    hvgs: &[usize],
    batch: &Factor,
    cfg: &MnnConfig,
) -> Result<(Dataset, Vec<MergeStep>), Error> {
    let batch = batch.clone().drop_unused_levels();
    if batch.n_levels() < 2 {
        return Err(PipelineError::insufficient(
            Stage::Integration,
            "batch factor",
            format!("{} batch level(s), need at least 2", batch.n_levels()),
        ));
    }
    let groups = batch.groups();
    let ndim = cfg.ndim.min(hvgs.len()).max(1);
    for (name, cells) in batch.levels().iter().zip(&groups) {
        let need = (ndim + 1).max(cfg.k);
        if cells.len() < need {
            return Err(PipelineError::insufficient(
                Stage::Integration,
                format!("batch '{}'", name),
                format!("{} cells, need at least {} (d + 1 = {}, k = {})", cells.len(), need, ndim + 1, cfg.k),
            ));
        }
    }

    let log = ds.require_logcounts()?;
    let all: Vec<usize> = (0..ds.n_cells()).collect();
    let mut x = log.dense_cells_by_genes(&all, hvgs);
    if cfg.cos_norm {
        x = cosine_normalize(x);
    }
    let svd = RandSvd::new().with_seed(cfg.seed);
    let mut coords = multi_batch_pca(x.view(), &groups, ndim, &svd)?;
    debug!("{}: shared PCA with {} dimensions", Stage::Integration, coords.ncols());

    let order = merge_order(&batch, cfg)?;
    let mut merged: Vec<usize> = groups[order[0]].clone();
    let mut merged_batches = vec![order[0]];
    let mut steps = Vec::with_capacity(order.len() - 1);

    for &b in &order[1..] {
        let name = &batch.levels()[b];
        let target_cells = &groups[b];
        let reference = coords.select(Axis(0), &merged);
        let target = coords.select(Axis(0), target_cells);

        let pairs = find_mutual_nn(reference.view(), target.view(), cfg.k)?;
        if pairs.is_empty() {
            return Err(PipelineError::insufficient(
                Stage::Integration,
                format!("batch '{}'", name),
                "no mutual nearest-neighbour pairs with the merged batches",
            ));
        }
        let correction = smoothed_correction(reference.view(), target.view(), &pairs, cfg.sigma);

        let before = within_variance(coords.view(), target_cells);
        for (i, &c) in target_cells.iter().enumerate() {
            let mut row = coords.row_mut(c);
            row += &correction.row(i);
        }
        let after = within_variance(coords.view(), target_cells);
        let lost = if before > 0.0 { (1.0 - after / before).max(0.0) } else { 0.0 };

        merged.extend_from_slice(target_cells);
        merged_batches.push(b);
        let lost_var = merged_batches
            .iter()
            .map(|&m| (batch.levels()[m].clone(), if m == b { lost } else { 0.0 }))
            .collect();
        info!(
            "{}: merged batch '{}' ({} cells) with {} MNN pairs, {:.1}% of its variance lost",
            Stage::Integration,
            name,
            target_cells.len(),
            pairs.len(),
            100.0 * lost
        );
        steps.push(MergeStep {
            batch: name.clone(),
            pairs: pairs.len(),
            lost_var,
        });
    }

    let ds = ds.with_embedding(scan_types::CORRECTED, coords)?;
    Ok((ds, steps))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::normalization::{normalize, NormConfig, Normalization};
    use crate::simulate::{Simulated, TRUTH};
    use ndarray::array;
    use scan_types::BATCH;

    fn prepared(sim: &Simulated) -> Dataset {
        let ds = sim.simulate("mnn").unwrap();
        let cfg = NormConfig {
            method: Normalization::LibrarySize,
            ..NormConfig::default()
        };
        normalize(&ds, &cfg).unwrap().0
    }

    fn centroid(x: &Array2<f64>, rows: &[usize]) -> Vec<f64> {
        x.select(Axis(0), rows).mean_axis(Axis(0)).unwrap().to_vec()
    }

    fn gap(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt()
    }

    #[test]
    fn test_mutual_pairs() {
        let reference = array![[0.0, 0.0], [10.0, 0.0]];
        let target = array![[0.5, 0.0], [9.0, 0.0], [30.0, 0.0]];
        let pairs = find_mutual_nn(reference.view(), target.view(), 1).unwrap();
        assert_eq!(pairs, vec![(0, 0), (1, 1)]);
    }

    #[test]
    fn test_smoothing_follows_nearest_anchor() {
        let reference = array![[0.0, 0.0], [10.0, 0.0]];
        let target = array![[0.0, 1.0], [10.0, 2.0], [0.1, 1.0]];
        let c = smoothed_correction(reference.view(), target.view(), &[(0, 0), (1, 1)], 0.5);
        assert!((c[[2, 1]] + 1.0).abs() < 1e-6);
        assert!((c[[1, 1]] + 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_batches_aligned() {
        let sim = Simulated {
            batch_effect: 0.5,
            ..Simulated::default()
        };
        let ds = prepared(&sim);
        let batch = ds.cells().factor(BATCH).unwrap();
        let truth = ds.cells().factor(TRUTH).unwrap();
        let hvgs: Vec<usize> = (0..sim.n_genes).collect();
        let cfg = MnnConfig {
            ndim: 10,
            ..MnnConfig::default()
        };
        let (out, steps) = fast_mnn(ds, &hvgs, &batch, &cfg).unwrap();
        assert_eq!(steps.len(), 1);
        assert!(steps[0].pairs > 0);
        assert_eq!(steps[0].lost_var.len(), 2);
        assert!(steps[0].lost_var.iter().all(|(_, v)| (0.0..=1.0).contains(v)));

        let corrected = out.embedding(scan_types::CORRECTED).unwrap();
        assert_eq!(corrected.dim(), (sim.n_cells, 10));
        // same type, different batch: closer than different types
        let select = |b: usize, t: usize| -> Vec<usize> {
            (0..sim.n_cells).filter(|&i| batch.code(i) == b && truth.code(i) == t).collect()
        };
        let c = |b, t| centroid(corrected, &select(b, t));
        assert!(gap(&c(0, 0), &c(1, 0)) < 0.5 * gap(&c(0, 0), &c(0, 1)));
        assert!(gap(&c(0, 1), &c(1, 1)) < 0.5 * gap(&c(0, 1), &c(1, 0)));
    }

    #[test]
    fn test_small_batch_named() {
        let sim = Simulated {
            n_cells: 30,
            ..Simulated::default()
        };
        let ds = prepared(&sim);
        let batch = ds.cells().factor(BATCH).unwrap();
        let hvgs: Vec<usize> = (0..10).collect();
        let err = fast_mnn(ds, &hvgs, &batch, &MnnConfig::default()).unwrap_err();
        let PipelineError::InsufficientData { stage, entity, .. } = err.downcast_ref::<PipelineError>().unwrap();
        assert_eq!(*stage, Stage::Integration);
        assert_eq!(entity, "batch 'b1'");
    }

    #[test]
    fn test_merge_order() {
        let batch = Factor::from_labels(&["a", "b", "b", "c", "c", "c"]);
        assert_eq!(merge_order(&batch, &MnnConfig::default()).unwrap(), vec![2, 1, 0]);
        let cfg = MnnConfig {
            merge_order: Some(vec!["b".into(), "a".into(), "c".into()]),
            ..MnnConfig::default()
        };
        assert_eq!(merge_order(&batch, &cfg).unwrap(), vec![1, 0, 2]);
        let cfg = MnnConfig {
            merge_order: Some(vec!["b".into(), "x".into()]),
            ..MnnConfig::default()
        };
        assert!(merge_order(&batch, &cfg).is_err());
    }
}
