//! k-nearest-neighbour search on embeddings (rows are cells).

use anyhow::{bail, Error};
use instant_distance::{Builder, Search};
use log::info;
use ndarray::{Array2, ArrayView1, ArrayView2};
use noisy_float::types::n64;
use rayon::prelude::*;

/// k nearest neighbours of every point, the point itself excluded. Row `i` lists neighbours by
/// increasing distance.
#[derive(Clone, Debug, PartialEq)]
pub struct Neighbors {
    pub indices: Array2<usize>,
    pub distances: Array2<f64>,
}

impl Neighbors {
    pub fn k(&self) -> usize {
        self.indices.ncols()
    }

    pub fn n_points(&self) -> usize {
        self.indices.nrows()
    }

    /// Neighbour lists with the point itself prepended at distance zero
    pub fn with_self(&self) -> (Array2<usize>, Array2<f64>) {
        let (n, k) = self.indices.dim();
        let idx = Array2::from_shape_fn((n, k + 1), |(i, j)| if j == 0 { i } else { self.indices[[i, j - 1]] });
        let dist = Array2::from_shape_fn((n, k + 1), |(i, j)| if j == 0 { 0.0 } else { self.distances[[i, j - 1]] });
        (idx, dist)
    }

    fn from_rows(rows: Vec<Vec<(f64, usize)>>, k: usize) -> Neighbors {
        let n = rows.len();
        let mut indices = Array2::zeros((n, k));
        let mut distances = Array2::zeros((n, k));
        for (i, row) in rows.iter().enumerate() {
            for (j, &(d, idx)) in row.iter().enumerate() {
                indices[[i, j]] = idx;
                distances[[i, j]] = d;
            }
        }
        Neighbors { indices, distances }
    }
}

pub fn euclidean(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f64>().sqrt()
}

/// `k` closest rows of `reference` to `query`, skipping `skip`. Ties go to the lower index.
fn nearest_of(reference: ArrayView2<f64>, query: ArrayView1<f64>, k: usize, skip: Option<usize>) -> Vec<(f64, usize)> {
    let mut d: Vec<(f64, usize)> = reference
        .outer_iter()
        .enumerate()
        .filter(|(j, _)| Some(*j) != skip)
        .map(|(j, r)| (euclidean(query, r), j))
        .collect();
    d.sort_by_key(|&(dist, j)| (n64(dist), j));
    d.truncate(k);
    d
}

fn check_k(n: usize, k: usize) -> Result<(), Error> {
    if k == 0 || k >= n {
        bail!("need 0 < k < number of points, got k = {} with {} points", k, n);
    }
    Ok(())
}

/// Exact search by comparing every pair, parallel over points
pub fn exhaustive_knn(points: ArrayView2<f64>, k: usize) -> Result<Neighbors, Error> {
    check_k(points.nrows(), k)?;
    let rows: Vec<Vec<(f64, usize)>> = (0..points.nrows())
        .into_par_iter()
        .map(|i| nearest_of(points, points.row(i), k, Some(i)))
        .collect();
    Ok(Neighbors::from_rows(rows, k))
}

/// For every row of `queries`, the `k` closest rows of `reference`
pub fn knn_query(reference: ArrayView2<f64>, queries: ArrayView2<f64>, k: usize) -> Result<Neighbors, Error> {
    if k == 0 || k > reference.nrows() {
        bail!("need 0 < k <= {} reference points, got k = {}", reference.nrows(), k);
    }
    if reference.ncols() != queries.ncols() {
        bail!("reference has {} dimensions, queries {}", reference.ncols(), queries.ncols());
    }
    let rows: Vec<Vec<(f64, usize)>> = (0..queries.nrows())
        .into_par_iter()
        .map(|i| nearest_of(reference, queries.row(i), k, None))
        .collect();
    Ok(Neighbors::from_rows(rows, k))
}

#[derive(Clone, Debug)]
struct VecPoint(Vec<f32>);

impl instant_distance::Point for VecPoint {
    fn distance(&self, other: &Self) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt()
    }
}

/// Approximate search with a seeded HNSW index. Distances are recomputed in full precision.
/// Rows where the index returns fewer than `k` other points are completed exactly.
pub fn hnsw_knn(points: ArrayView2<f64>, k: usize, seed: u64) -> Result<Neighbors, Error> {
    let n = points.nrows();
    check_k(n, k)?;
    let vp: Vec<VecPoint> = points
        .outer_iter()
        .map(|r| VecPoint(r.iter().map(|&v| v as f32).collect()))
        .collect();
    let map = Builder::default()
        .seed(seed)
        .ef_search((2 * k + 1).max(100))
        .build(vp.clone(), (0..n).collect::<Vec<usize>>());

    let rows: Vec<Vec<(f64, usize)>> = (0..n)
        .into_par_iter()
        .map_init(Search::default, |search, i| {
            let mut row: Vec<(f64, usize)> = map
                .search(&vp[i], search)
                .map(|item| *item.value)
                .filter(|&j| j != i)
                .map(|j| (euclidean(points.row(i), points.row(j)), j))
                .take(k)
                .collect();
            if row.len() < k {
                row = nearest_of(points, points.row(i), k, Some(i));
            }
            row.sort_by_key(|&(d, j)| (n64(d), j));
            row
        })
        .collect();
    Ok(Neighbors::from_rows(rows, k))
}

/// Exact search up to `exact_max_points` points, HNSW above
pub fn knn(points: ArrayView2<f64>, k: usize, exact_max_points: usize, seed: u64) -> Result<Neighbors, Error> {
    if points.nrows() <= exact_max_points {
        info!("exact search for {} neighbours of {} points", k, points.nrows());
        exhaustive_knn(points, k)
    } else {
        info!("HNSW search for {} neighbours of {} points", k, points.nrows());
        hnsw_knn(points, k, seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, s};
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};
    use rand_pcg::Pcg64Mcg;

    #[test]
    fn test_symmetry() {
        // A bunch of equally distant points, with one outlier
        let mut v = Array2::<f64>::eye(5);
        v[(0, 4)] = 3.0f64;

        let nn = exhaustive_knn(v.view(), 4).unwrap();
        // equal distances are broken by index
        let correct = arr2(&[[4, 1, 2, 3], [2, 3, 4, 0], [1, 3, 4, 0], [1, 2, 4, 0], [1, 2, 3, 0]]);
        assert_eq!(nn.indices, correct);
        assert!(nn.distances[[0, 0]] < nn.distances[[0, 3]]);
    }

    #[test]
    fn test_hnsw_agrees_with_exact() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let dist = Normal::new(0.0f64, 1.0f64).unwrap();
        let v = Array2::from_shape_fn((200, 5), |_| dist.sample(&mut rng));
        let exact = exhaustive_knn(v.view(), 10).unwrap();
        let approx = hnsw_knn(v.view(), 10, 0).unwrap();
        let mut hits = 0;
        for i in 0..200 {
            let truth: Vec<usize> = exact.indices.row(i).to_vec();
            hits += approx.indices.row(i).iter().filter(|j| truth.contains(j)).count();
        }
        assert!(hits as f64 / 2000.0 > 0.95, "recall {}", hits as f64 / 2000.0);
        assert!(approx.indices.iter().zip(0..).all(|(&j, p)| j != p / 10));
    }

    #[test]
    fn test_query_and_self() {
        let v = arr2(&[[0.0], [1.0], [3.0], [7.0]]);
        let nn = exhaustive_knn(v.view(), 2).unwrap();
        let (idx, dist) = nn.with_self();
        assert_eq!(idx.row(2).to_vec(), vec![2, 1, 0]);
        assert_eq!(dist.row(2).to_vec(), vec![0.0, 2.0, 3.0]);

        let q = arr2(&[[2.9], [100.0]]);
        let hits = knn_query(v.view(), q.view(), 1).unwrap();
        assert_eq!(hits.indices.slice(s![.., 0]).to_vec(), vec![2, 3]);
        assert!(exhaustive_knn(v.view(), 4).is_err());
    }
}
