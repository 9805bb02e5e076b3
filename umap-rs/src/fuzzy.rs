use crate::Q;
use ndarray::{Array2, ArrayView1};

const BANDWIDTH: Q = 1.0;
const NITER: usize = 64;
const SMOOTH_K_TOLERANCE: Q = 1e-5;
const MIN_K_DIST_SCALE: Q = 1e-3;

/// Marks a missing neighbor in `knn_indices`
pub const NO_NEIGHBOR: usize = usize::MAX;

/// Fuzzy simplicial set of a kNN graph, as a symmetric sparse matrix of membership strengths.
///
/// Each point's distances are normalized by its distance to the nearest neighbor (`rho`) and a
/// bandwidth (`sigma`) chosen so that the memberships sum to `log2(k)`. The directed local sets
/// are then combined with a fuzzy union (`set_op_mix_ratio = 1`) or intersection (`0`).
pub fn fuzzy_simplicial_set(
    knn_indices: &Array2<usize>,
    knn_distances: &Array2<Q>,
    local_connectivity: Q,
    set_op_mix_ratio: Q,
) -> sprs::CsMat<Q> {
    let (n_points, _) = knn_indices.dim();
    let (sigmas, rhos) = smooth_knn_distances(knn_distances, local_connectivity, NITER, BANDWIDTH);
    let (rows, cols, values) = compute_membership_strengths(knn_indices, knn_distances, &sigmas, &rhos);

    let directed: sprs::CsMat<Q> = sprs::TriMat::from_triplets((n_points, n_points), rows, cols, values).to_csr();
    let transpose: sprs::CsMat<Q> = directed.transpose_view().to_csr();

    // w = ratio * (a + b - a*b) + (1 - ratio) * a*b, over the union of both patterns
    let mut rows = Vec::new();
    let mut cols = Vec::new();
    let mut values = Vec::new();
    for (i, (a_row, b_row)) in directed.outer_iterator().zip(transpose.outer_iterator()).enumerate() {
        let a: Vec<(usize, Q)> = a_row.iter().map(|(j, &v)| (j, v)).collect();
        let b: Vec<(usize, Q)> = b_row.iter().map(|(j, &v)| (j, v)).collect();
        let (mut x, mut y) = (0, 0);
        while x < a.len() || y < b.len() {
            let (j, va, vb) = match (a.get(x), b.get(y)) {
                (Some(&(ja, va)), Some(&(jb, vb))) if ja == jb => {
                    x += 1;
                    y += 1;
                    (ja, va, vb)
                }
                (Some(&(ja, va)), Some(&(jb, _))) if ja < jb => {
                    x += 1;
                    (ja, va, 0.0)
                }
                (Some(&(ja, va)), None) => {
                    x += 1;
                    (ja, va, 0.0)
                }
                (_, Some(&(jb, vb))) => {
                    y += 1;
                    (jb, 0.0, vb)
                }
                (None, None) => break,
            };
            let prod = va * vb;
            let w = set_op_mix_ratio * (va + vb - prod) + (1.0 - set_op_mix_ratio) * prod;
            if w > 0.0 {
                rows.push(i);
                cols.push(j);
                values.push(w);
            }
        }
    }
    let graph = sprs::TriMat::from_triplets((n_points, n_points), rows, cols, values).to_csr();
    log::debug!("fuzzy simplicial set: {} points, {} non-zeros", n_points, graph.nnz());
    graph
}

/// Per-point `(sigma, rho)`
fn smooth_knn_distances(
    knn_distances: &Array2<Q>,
    local_connectivity: Q,
    n_iter: usize,
    bandwidth: Q,
) -> (Vec<Q>, Vec<Q>) {
    let (n_cells, k) = knn_distances.dim();
    let mut rho = vec![0.0; n_cells];
    let mut result = vec![0.0; n_cells];
    let mean_distances = knn_distances.iter().filter(|d| d.is_finite()).sum::<Q>() / (n_cells * k).max(1) as Q;

    for i in 0..n_cells {
        let non_zero_dist = knn_distances
            .row(i)
            .iter()
            .copied()
            .filter(|&d| d > 0.0 && d.is_finite())
            .collect::<Vec<Q>>();
        if non_zero_dist.len() >= local_connectivity as usize {
            let index = local_connectivity.floor();
            let interpolation = local_connectivity - index;
            if index > 0.0 {
                let index = index as usize;
                rho[i] = non_zero_dist[index - 1];
                if interpolation > SMOOTH_K_TOLERANCE && index < non_zero_dist.len() {
                    rho[i] += interpolation * (non_zero_dist[index] - non_zero_dist[index - 1]);
                }
            } else if !non_zero_dist.is_empty() {
                rho[i] = interpolation * non_zero_dist[0];
            }
        } else if !non_zero_dist.is_empty() {
            rho[i] = non_zero_dist.iter().fold(Q::MIN, |a, &b| a.max(b));
        }

        result[i] = smooth_knn_dist(knn_distances.row(i), rho[i], k, bandwidth, n_iter);

        let floor = if rho[i] > 0.0 {
            let row = knn_distances.row(i);
            MIN_K_DIST_SCALE * row.iter().filter(|d| d.is_finite()).sum::<Q>() / k as Q
        } else {
            MIN_K_DIST_SCALE * mean_distances
        };
        if result[i] < floor {
            result[i] = floor;
        }
    }
    (result, rho)
}

/// Bisection for the sigma of one point
fn smooth_knn_dist(distances: ArrayView1<Q>, rho: Q, k: usize, bandwidth: Q, n_iter: usize) -> Q {
    let target = (k as Q).log2() * bandwidth;
    let mut lo = 0.0;
    let mut mid = 1.0;
    let mut hi = Q::MAX;

    for _ in 0..n_iter {
        let psum: Q = distances
            .iter()
            .filter(|d| d.is_finite())
            .map(|&v| (-((v - rho).max(0.0) / mid)).exp())
            .sum();

        if (psum - target).abs() < SMOOTH_K_TOLERANCE {
            break;
        }
        if psum > target {
            hi = mid;
            mid = lo + (hi - lo) / 2.0;
        } else {
            lo = mid;
            if hi == Q::MAX {
                mid *= 2.0;
            } else {
                mid = lo + (hi - lo) / 2.0
            }
        }
    }
    mid
}

/// Directed membership strengths as `(rows, cols, values)` triplets, row = point, col = neighbor.
fn compute_membership_strengths(
    knn_indices: &Array2<usize>,
    knn_distances: &Array2<Q>,
    sigmas: &[Q],
    rhos: &[Q],
) -> (Vec<usize>, Vec<usize>, Vec<Q>) {
    let (n_samples, n_neighbors) = knn_indices.dim();
    let mut rows = Vec::with_capacity(n_samples * n_neighbors);
    let mut cols = Vec::with_capacity(n_samples * n_neighbors);
    let mut values = Vec::with_capacity(n_samples * n_neighbors);
    for i in 0..n_samples {
        for j in 0..n_neighbors {
            let nb = knn_indices[[i, j]];
            if nb == NO_NEIGHBOR || nb == i {
                continue;
            }
            let d = knn_distances[[i, j]];
            let val = if d - rhos[i] <= 0.0 || sigmas[i] == 0.0 {
                1.0
            } else {
                (-((d - rhos[i]) / sigmas[i])).exp()
            };
            rows.push(i);
            cols.push(nb);
            values.push(val);
        }
    }
    (rows, cols, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn fuzzy_simplicial_set_is_symmetric() {
        let knns = arr2(&[[1, 2], [0, 2], [1, 0]]);
        let dists = arr2(&[[1.5, 0.5], [0.5, 2.], [1.5, 2.]]);
        let graph = fuzzy_simplicial_set(&knns, &dists, 1.0, 1.0);
        assert_eq!(graph.shape(), (3, 3));
        for (&v, (i, j)) in graph.iter() {
            let t = graph.get(j, i).copied().unwrap_or(0.0);
            assert!((v - t).abs() < 1e-12, "({i},{j})");
            assert!(v > 0.0 && v <= 1.0);
        }
    }

    #[test]
    fn smooth_knn_dist_hits_target() {
        let dists = arr1(&[0., 1., 2., 3., 4., 5.]);
        let rho = 1.0;
        let k = 6;
        let sigma = smooth_knn_dist(dists.view(), rho, k, 1.0, 64);
        let psum: Q = dists.iter().map(|&v| (-((v - rho).max(0.0) / sigma)).exp()).sum();
        assert!((psum - (k as Q).log2()).abs() <= SMOOTH_K_TOLERANCE);
    }

    #[test]
    fn smooth_knn_distances_rho() {
        let knn_distances = arr2(&[
            [0., 0., 0.0],
            [1., 2., 3.],
            [2., 4., 5.],
            [3., 4., 5.],
            [4., 6., 6.],
            [5., 6., 10.],
        ]);
        let (_, rhos) = smooth_knn_distances(&knn_distances, 1.0, 64, 1.0);
        assert_eq!(rhos, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);

        let knn_distances = arr2(&[[0., 0., 0.0], [0., 1., 2.], [0., 2., 3.]]);
        let (_, rhos) = smooth_knn_distances(&knn_distances, 1.5, 64, 1.0);
        assert_eq!(rhos, vec![0., 1.5, 2.5]);
    }

    #[test]
    fn membership_skips_self_and_missing() {
        let knns = arr2(&[[0, 1, NO_NEIGHBOR], [1, 0, 0]]);
        let dists = arr2(&[[0., 1., 0.], [0., 2., 3.]]);
        let (rows, cols, vals) = compute_membership_strengths(&knns, &dists, &[1.0, 1.0], &[1.0, 2.0]);
        assert_eq!(rows, vec![0, 1, 1]);
        assert_eq!(cols, vec![1, 0, 0]);
        assert_eq!(vals[0], 1.0);
        assert_eq!(vals[1], 1.0);
        assert!((vals[2] - (-1.0f64).exp()).abs() < 1e-15);
    }
}
