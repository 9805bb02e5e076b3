use crate::curve_fit::find_ab_params;
use crate::embedding::{initialize_embedding, initialize_simplicial_set_embedding, Init};
use crate::fuzzy::fuzzy_simplicial_set;
use crate::optimize::{Schedule, State};
use crate::Q;
use anyhow::{bail, Error};
use log::info;
use ndarray::Array2;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use std::time::Instant;

/// UMAP settings
#[derive(Clone, Debug)]
pub struct Umap {
    pub learning_rate: Q,
    pub local_connectivity: Q,
    pub min_dist: Q,
    pub negative_sample_rate: usize,
    pub repulsion_strength: Q,
    pub set_op_mix_ratio: Q,
    pub spread: Q,
    pub embedded_dim: usize,
    custom_number_of_epochs: Option<usize>,
}

impl Default for Umap {
    fn default() -> Self {
        Umap::new(2, 0.3, 1.0, None)
    }
}

impl Umap {
    pub fn new(dimensions: usize, min_dist: Q, spread: Q, custom_number_of_epochs: Option<usize>) -> Umap {
        Umap {
            learning_rate: 1.0,
            local_connectivity: 1.0,
            min_dist,
            negative_sample_rate: 5,
            repulsion_strength: 1.0,
            set_op_mix_ratio: 1.0,
            spread,
            embedded_dim: dimensions,
            custom_number_of_epochs: custom_number_of_epochs.filter(|&n| n > 0),
        }
    }

    /// Gets the number of epochs for optimizing the projection
    pub fn get_num_epochs(&self, rows: usize) -> usize {
        if let Some(n) = self.custom_number_of_epochs {
            return n;
        }
        if rows <= 10_000 {
            500
        } else {
            200
        }
    }

    /// Lay out points given their k nearest neighbors. `knn_indices[[i, j]]` is the j-th neighbor
    /// of point i and `knn_distances[[i, j]]` its distance; rows may include the point itself.
    pub fn fit(
        &self,
        knn_indices: &Array2<usize>,
        knn_distances: &Array2<Q>,
        init: &Init,
        seed: u64,
    ) -> Result<Array2<Q>, Error> {
        if knn_indices.dim() != knn_distances.dim() {
            bail!(
                "knn indices {:?} and distances {:?} have different shapes",
                knn_indices.dim(),
                knn_distances.dim()
            );
        }
        let n_points = knn_indices.nrows();
        if n_points < 2 {
            bail!("UMAP needs at least 2 points, got {}", n_points);
        }
        let tick = Instant::now();
        let mut random = Pcg64Mcg::seed_from_u64(seed);
        let n_epochs = self.get_num_epochs(n_points);

        let graph = fuzzy_simplicial_set(knn_indices, knn_distances, self.local_connectivity, self.set_op_mix_ratio);
        let (head, tail, epochs_per_sample) = initialize_simplicial_set_embedding(&graph, n_epochs, &mut random);
        let embedding = initialize_embedding(init, n_points, self.embedded_dim, &mut random);

        let (a, b) = find_ab_params(self.spread, self.min_dist);
        let schedule = Schedule {
            a,
            b,
            learning_rate: self.learning_rate,
            repulsion_strength: self.repulsion_strength,
            negative_sample_rate: self.negative_sample_rate,
            n_epochs,
        };
        let mut state = State::new(schedule, embedding, head, tail, epochs_per_sample, random);
        state.optimize();
        info!(
            "UMAP of {} points ({} edges, {} epochs) took {:.3}s",
            n_points,
            state.num_samples(),
            n_epochs,
            tick.elapsed().as_secs_f64()
        );
        Ok(state.into_embedding())
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use rand_distr::{Distribution, Normal};

    /// Exact kNN by brute force, including the point itself
    fn knn(points: &Array2<Q>, k: usize) -> (Array2<usize>, Array2<Q>) {
        let n = points.nrows();
        let mut idx = Array2::zeros((n, k));
        let mut dist = Array2::zeros((n, k));
        for i in 0..n {
            let mut d: Vec<(Q, usize)> = (0..n)
                .map(|j| {
                    let s: Q = points.row(i).iter().zip(points.row(j)).map(|(a, b)| (a - b) * (a - b)).sum();
                    (s.sqrt(), j)
                })
                .collect();
            d.sort_by(|a, b| a.partial_cmp(b).unwrap());
            for (c, &(dd, j)) in d.iter().take(k).enumerate() {
                idx[[i, c]] = j;
                dist[[i, c]] = dd;
            }
        }
        (idx, dist)
    }

    fn two_blobs(seed: u64) -> Array2<Q> {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let noise = Normal::new(0.0, 1.0).unwrap();
        Array2::from_shape_fn((60, 5), |(i, _)| if i < 30 { 0.0 } else { 20.0 } + noise.sample(&mut rng))
    }

    fn centroid_gap(e: &Array2<Q>) -> (Q, Q) {
        let mean = |r: std::ops::Range<usize>| {
            let n = r.len() as Q;
            let (mut x, mut y) = (0.0, 0.0);
            for i in r {
                x += e[[i, 0]];
                y += e[[i, 1]];
            }
            (x / n, y / n)
        };
        let (a, b) = (mean(0..30), mean(30..60));
        let between = ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt();
        let within = (0..30)
            .map(|i| ((e[[i, 0]] - a.0).powi(2) + (e[[i, 1]] - a.1).powi(2)).sqrt())
            .sum::<Q>()
            / 30.0;
        (between, within)
    }

    #[test]
    fn test_blobs_separate() {
        let x = two_blobs(0);
        let (idx, dist) = knn(&x, 10);
        let umap = Umap::new(2, 0.1, 1.0, Some(200));
        let e = umap.fit(&idx, &dist, &Init::Random, 42).unwrap();
        assert_eq!(e.dim(), (60, 2));
        let (between, within) = centroid_gap(&e);
        assert!(between > 2.0 * within, "between {between} within {within}");
    }

    #[test]
    fn test_seeded_layout_reproducible() {
        let x = two_blobs(1);
        let (idx, dist) = knn(&x, 8);
        let umap = Umap::new(2, 0.3, 1.0, Some(50));
        let a = umap.fit(&idx, &dist, &Init::Random, 7).unwrap();
        let b = umap.fit(&idx, &dist, &Init::Random, 7).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_shape_mismatch() {
        let umap = Umap::default();
        let idx = Array2::<usize>::zeros((4, 3));
        let dist = Array2::<Q>::zeros((4, 2));
        assert!(umap.fit(&idx, &dist, &Init::Random, 0).is_err());
    }
}
