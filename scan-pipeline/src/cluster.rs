//! Cell clustering on an embedding: shared-nearest-neighbour graph + Louvain, or k-means.

use crate::error::{PipelineError, Stage};
use crate::nn::{knn, Neighbors};
use anyhow::{bail, Error};
use log::info;
use louvain::{objective::modularity, Clustering, Louvain, Network};
use ndarray::{s, Array2, ArrayView1, ArrayView2};
use rand::distributions::{Distribution, WeightedIndex};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use rayon::prelude::*;
use scan_types::{Column, Dataset, Factor, CLUSTER};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterMethod {
    /// SNN graph with rank weights, communities by Louvain
    Graph,
    KMeans,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub method: ClusterMethod,
    /// neighbours per cell in the SNN graph
    pub k: usize,
    pub resolution: f64,
    pub louvain_iterations: usize,
    /// number of k-means centers
    pub centers: usize,
    pub n_start: usize,
    pub max_iter: usize,
    /// leading embedding dimensions to use, 0 for all
    pub n_components: usize,
    pub exact_knn_max_cells: usize,
    pub seed: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            method: ClusterMethod::Graph,
            k: 10,
            resolution: 1.0,
            louvain_iterations: 10,
            centers: 10,
            n_start: 10,
            max_iter: 100,
            n_components: 0,
            exact_knn_max_cells: 5000,
            seed: 0,
        }
    }
}

/// Cluster labels plus diagnostics. Labels are `0..n_clusters`, ordered by decreasing size.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Clusters {
    pub labels: Vec<usize>,
    pub sizes: Vec<usize>,
    /// mean silhouette width per cluster, measured against cluster centroids
    pub silhouette: Vec<f64>,
    pub modularity: Option<f64>,
    /// total within-cluster sum of squares (k-means only)
    pub wss: Option<f64>,
}

impl Clusters {
    pub fn n_clusters(&self) -> usize {
        self.sizes.len()
    }

    pub fn factor(&self) -> Factor {
        Factor::from_codes(&self.labels)
    }
}

/// Shared-nearest-neighbour graph. Each cell's list holds itself at rank 0 and its neighbours at
/// ranks `1..=k`; two cells are joined with weight `k - r / 2`, `r` the smallest rank sum over
/// the cells in both lists, when that weight is positive.
pub fn snn_graph(neighbors: &Neighbors) -> Network {
    let k = neighbors.k() as f64;
    let (lists, _) = neighbors.with_self();
    let n = lists.nrows();
    let mut holders: Vec<Vec<(usize, usize)>> = vec![Vec::new(); n];
    for (i, row) in lists.outer_iter().enumerate() {
        for (rank, &m) in row.iter().enumerate() {
            holders[m].push((i, rank));
        }
    }
    let edges: Vec<Vec<(usize, usize, f64)>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut best = BTreeMap::<usize, usize>::new();
            for (rank, &m) in lists.row(i).iter().enumerate() {
                for &(j, other) in &holders[m] {
                    if j > i {
                        let e = best.entry(j).or_insert(usize::MAX);
                        *e = (*e).min(rank + other);
                    }
                }
            }
            best.into_iter()
                .map(|(j, r)| (i, j, k - r as f64 / 2.0))
                .filter(|&(_, _, w)| w > 0.0)
                .collect()
        })
        .collect();
    Network::from_edges(n, edges.into_iter().flatten())
}

/// Result of one k-means fit
#[derive(Clone, Debug, PartialEq)]
pub struct KMeansFit {
    pub labels: Vec<usize>,
    pub centers: Array2<f64>,
    pub wss: f64,
    pub iterations: usize,
}

fn sq_dist(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Closest center and its squared distance; ties go to the lower center
fn nearest_center(p: ArrayView1<f64>, centers: &Array2<f64>) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (c, center) in centers.outer_iter().enumerate() {
        let d = sq_dist(p, center);
        if d < best.1 {
            best = (c, d);
        }
    }
    best
}

/// k-means++ seeding
fn kmeans_pp(points: ArrayView2<f64>, k: usize, rng: &mut impl Rng) -> Array2<f64> {
    let n = points.nrows();
    let mut centers = Array2::zeros((k, points.ncols()));
    let first = rng.gen_range(0..n);
    centers.row_mut(0).assign(&points.row(first));
    let mut d2: Vec<f64> = points.outer_iter().map(|p| sq_dist(p, points.row(first))).collect();
    for c in 1..k {
        let next = match WeightedIndex::new(&d2) {
            Ok(w) => w.sample(rng),
            // every remaining point sits on a center
            Err(_) => rng.gen_range(0..n),
        };
        centers.row_mut(c).assign(&points.row(next));
        for (i, p) in points.outer_iter().enumerate() {
            d2[i] = d2[i].min(sq_dist(p, points.row(next)));
        }
    }
    centers
}

/// Lloyd iterations from a k-means++ start
fn lloyd(points: ArrayView2<f64>, k: usize, max_iter: usize, seed: u64) -> KMeansFit {
    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    let mut centers = kmeans_pp(points, k, &mut rng);
    let n = points.nrows();
    let mut labels = vec![usize::MAX; n];
    let mut iterations = 0;
    while iterations < max_iter {
        iterations += 1;
        let mut changed = false;
        let mut dist = vec![0.0; n];
        for (i, p) in points.outer_iter().enumerate() {
            let (c, d) = nearest_center(p, &centers);
            dist[i] = d;
            if labels[i] != c {
                labels[i] = c;
                changed = true;
            }
        }
        if !changed {
            break;
        }
        let mut sums = Array2::<f64>::zeros(centers.dim());
        let mut counts = vec![0usize; k];
        for (i, p) in points.outer_iter().enumerate() {
            let mut row = sums.row_mut(labels[i]);
            row += &p;
            counts[labels[i]] += 1;
        }
        for c in 0..k {
            if counts[c] > 0 {
                centers.row_mut(c).assign(&(&sums.row(c) / counts[c] as f64));
            } else {
                // empty: move to the point worst served by its center
                let far = (0..n).fold(0, |best, i| if dist[i] > dist[best] { i } else { best });
                centers.row_mut(c).assign(&points.row(far));
                dist[far] = 0.0;
            }
        }
    }
    let wss = points
        .outer_iter()
        .zip(&labels)
        .map(|(p, &l)| sq_dist(p, centers.row(l)))
        .sum();
    KMeansFit {
        labels,
        centers,
        wss,
        iterations,
    }
}

/// k-means with `n_start` k-means++ restarts, run in parallel. Restart `i` is seeded with
/// `seed + i` and the fit with the lowest total within-cluster sum of squares wins (the earliest
/// restart on ties), so the result doesn't depend on the number of threads.
pub fn kmeans(points: ArrayView2<f64>, k: usize, n_start: usize, max_iter: usize, seed: u64) -> Result<KMeansFit, Error> {
    let n = points.nrows();
    if k == 0 || n_start == 0 || max_iter == 0 {
        bail!(
            "k-means needs k > 0, at least one start and one iteration (k = {}, n_start = {}, max_iter = {})",
            k,
            n_start,
            max_iter
        );
    }
    if k > n {
        return Err(PipelineError::insufficient(
            Stage::Clustering,
            "k-means",
            format!("{} centers requested for {} points", k, n),
        ));
    }
    let fits: Vec<KMeansFit> = (0..n_start)
        .into_par_iter()
        .map(|start| lloyd(points, k, max_iter, seed.wrapping_add(start as u64)))
        .collect();
    let mut best: Option<KMeansFit> = None;
    for fit in fits {
        if best.as_ref().map_or(true, |b| fit.wss < b.wss) {
            best = Some(fit);
        }
    }
    best.ok_or_else(|| anyhow::format_err!("k-means produced no fit"))
}

/// Relabel so that cluster 0 is the largest; equal sizes keep their original order
pub fn relabel_by_size(labels: &[usize]) -> Vec<usize> {
    let n_labels = labels.iter().max().map_or(0, |&m| m + 1);
    let mut counts = vec![0usize; n_labels];
    for &l in labels {
        counts[l] += 1;
    }
    let mut order: Vec<usize> = (0..n_labels).filter(|&l| counts[l] > 0).collect();
    order.sort_by_key(|&l| (Reverse(counts[l]), l));
    let mut remap = vec![usize::MAX; n_labels];
    for (new, &old) in order.iter().enumerate() {
        remap[old] = new;
    }
    labels.iter().map(|&l| remap[l]).collect()
}

/// Cluster centroids, `clusters x dims`
pub fn centroids(points: ArrayView2<f64>, labels: &[usize], n_clusters: usize) -> Array2<f64> {
    let mut sums = Array2::<f64>::zeros((n_clusters, points.ncols()));
    let mut counts = vec![0usize; n_clusters];
    for (p, &l) in points.outer_iter().zip(labels) {
        let mut row = sums.row_mut(l);
        row += &p;
        counts[l] += 1;
    }
    for (mut row, &n) in sums.outer_iter_mut().zip(&counts) {
        if n > 0 {
            row /= n as f64;
        }
    }
    sums
}

/// Mean silhouette width per cluster, using the distance to each centroid in place of the
/// average distance to the members of that cluster.
pub fn centroid_silhouette(points: ArrayView2<f64>, labels: &[usize], n_clusters: usize) -> Vec<f64> {
    if n_clusters < 2 {
        return vec![0.0; n_clusters];
    }
    let centers = centroids(points, labels, n_clusters);
    let widths: Vec<f64> = (0..points.nrows())
        .into_par_iter()
        .map(|i| {
            let (p, l) = (points.row(i), labels[i]);
            let a = sq_dist(p, centers.row(l)).sqrt();
            let b = (0..n_clusters)
                .filter(|&c| c != l)
                .map(|c| sq_dist(p, centers.row(c)).sqrt())
                .fold(f64::INFINITY, f64::min);
            let m = a.max(b);
            if m > 0.0 {
                (b - a) / m
            } else {
                0.0
            }
        })
        .collect();
    let mut sums = vec![0.0; n_clusters];
    let mut counts = vec![0usize; n_clusters];
    for (w, &l) in widths.iter().zip(labels) {
        sums[l] += w;
        counts[l] += 1;
    }
    sums.iter().zip(&counts).map(|(s, &n)| if n > 0 { s / n as f64 } else { 0.0 }).collect()
}

/// Cluster the cells of `ds` on the `embedding` and attach the `cluster` cell column.
pub fn cluster_cells(ds: Dataset, embedding: &str, cfg: &ClusterConfig) -> Result<(Dataset, Clusters), Error> {
    let emb = ds.require_embedding(embedding)?;
    let n = emb.nrows();
    let dims = match cfg.n_components {
        0 => emb.ncols(),
        d => d.min(emb.ncols()),
    };
    let points = emb.slice(s![.., ..dims]);

    let (raw, modularity_score, wss) = match cfg.method {
        ClusterMethod::Graph => {
            if n < 2 {
                return Err(PipelineError::insufficient(
                    Stage::Clustering,
                    format!("dataset '{}'", ds.name()),
                    format!("{} cells, the SNN graph needs at least 2", n),
                ));
            }
            let k = cfg.k.clamp(1, n - 1);
            let neighbors = knn(points, k, cfg.exact_knn_max_cells, cfg.seed)?;
            let network = snn_graph(&neighbors);
            let clustering = Louvain::new(cfg.resolution, Some(cfg.seed)).run(&network, cfg.louvain_iterations);
            let q = modularity(cfg.resolution, &network, &clustering);
            (clustering.labels().to_vec(), Some(q), None)
        }
        ClusterMethod::KMeans => {
            let fit = kmeans(points, cfg.centers, cfg.n_start, cfg.max_iter, cfg.seed)?;
            (fit.labels, None, Some(fit.wss))
        }
    };
    // drop empty labels before ordering by size
    let labels = relabel_by_size(Clustering::from_labels(&raw).labels());
    let n_clusters = labels.iter().max().map_or(0, |&m| m + 1);
    let mut sizes = vec![0usize; n_clusters];
    for &l in &labels {
        sizes[l] += 1;
    }
    let silhouette = centroid_silhouette(points, &labels, n_clusters);
    info!(
        "{}: {:?} on '{}' found {} clusters, sizes {:?}",
        Stage::Clustering,
        cfg.method,
        embedding,
        n_clusters,
        sizes
    );
    let clusters = Clusters {
        labels,
        sizes,
        silhouette,
        modularity: modularity_score,
        wss,
    };
    let ds = ds.with_cell_column(CLUSTER, Column::Factor(clusters.factor()))?;
    Ok((ds, clusters))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nn::exhaustive_knn;
    use crate::parallel::run_in_pool;
    use rand_distr::Normal;

    fn blobs(centers: &[[f64; 2]], per: usize, seed: u64) -> Array2<f64> {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let noise = Normal::new(0.0, 0.5).unwrap();
        Array2::from_shape_fn((centers.len() * per, 2), |(i, j)| centers[i / per][j] + noise.sample(&mut rng))
    }

    #[test]
    fn test_snn_weights() {
        // a line of 4 points
        let v = ndarray::arr2(&[[0.0], [1.0], [2.5], [4.5]]);
        let nn = exhaustive_knn(v.view(), 1).unwrap();
        // lists with self: 0:[0,1] 1:[1,0] 2:[2,1] 3:[3,2]
        let net = snn_graph(&nn);
        let edges: Vec<(usize, f64)> = net.neighbors(1).collect();
        // 0-1: shared 0 at ranks 0+1 -> 1 - 0.5; 1-2: shared 1 at ranks 0+1 -> 0.5
        assert_eq!(edges, vec![(0, 0.5), (2, 0.5)]);
        assert_eq!(net.neighbors(3).collect::<Vec<_>>(), vec![(2, 0.5)]);
    }

    #[test]
    fn test_kmeans_recovers_blobs() {
        let x = blobs(&[[0.0, 0.0], [10.0, 0.0], [0.0, 10.0]], 30, 1);
        let fit = kmeans(x.view(), 3, 5, 100, 0).unwrap();
        for b in 0..3 {
            let l = fit.labels[b * 30];
            assert!(fit.labels[b * 30..(b + 1) * 30].iter().all(|&x| x == l));
        }
        assert!(fit.wss < 90.0 * 0.5 * 2.0 * 2.0);
    }

    #[test]
    fn test_kmeans_seeded_thread_independent() {
        let x = blobs(&[[0.0, 0.0], [3.0, 0.0], [0.0, 3.0], [3.0, 3.0]], 25, 2);
        let one = run_in_pool(Stage::Clustering, 1, || kmeans(x.view(), 4, 10, 100, 7)).unwrap();
        let four = run_in_pool(Stage::Clustering, 4, || kmeans(x.view(), 4, 10, 100, 7)).unwrap();
        assert_eq!(one, four);
        let again = kmeans(x.view(), 4, 10, 100, 7).unwrap();
        assert_eq!(one, again);
        assert!(kmeans(x.view(), 101, 1, 10, 0).is_err());
    }

    #[test]
    fn test_kmeans_rejects_zero_iterations() {
        let x = blobs(&[[0.0, 0.0], [5.0, 5.0]], 10, 3);
        assert!(kmeans(x.view(), 2, 1, 0, 7).is_err());
        let fit = kmeans(x.view(), 2, 1, 1, 7).unwrap();
        assert!(fit.labels.iter().all(|&l| l < 2));
        assert_eq!(fit.iterations, 1);
    }

    #[test]
    fn test_relabel_by_size() {
        assert_eq!(relabel_by_size(&[2, 2, 0, 1, 1, 1, 3]), vec![1, 1, 2, 0, 0, 0, 3]);
    }

    #[test]
    fn test_graph_clusters_and_silhouette() {
        let x = blobs(&[[0.0, 0.0], [20.0, 0.0]], 40, 3);
        let labels: Vec<String> = (0..80).map(|i| format!("c{i}")).collect();
        let ds = Dataset::new(
            "blobs",
            scan_types::CountMatrix::from_columns(1, vec![vec![(0, 1)]; 80]).unwrap(),
            scan_types::Table::new(vec!["g".to_string()]),
            scan_types::Table::new(labels),
        )
        .unwrap()
        .with_embedding(scan_types::PCA, x)
        .unwrap();
        let cfg = ClusterConfig {
            k: 20,
            resolution: 0.5,
            ..ClusterConfig::default()
        };
        let (ds, clusters) = cluster_cells(ds, scan_types::PCA, &cfg).unwrap();
        assert_eq!(clusters.n_clusters(), 2);
        assert_eq!(clusters.sizes, vec![40, 40]);
        assert!(clusters.silhouette.iter().all(|&s| s > 0.8));
        assert!(clusters.modularity.unwrap() > 0.4);
        assert_eq!(ds.cells().factor(CLUSTER).unwrap().levels(), &["1", "2"]);
    }
}
