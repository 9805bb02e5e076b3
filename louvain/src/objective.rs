use crate::{Clustering, Network};
use rayon::prelude::*;

/// Newman-Girvan modularity of a clustering at the given resolution:
/// `Q = 1/(2m) * sum_ij (A_ij - gamma * k_i k_j / (2m)) [c_i == c_j]`.
///
/// Internal edge weight is summed over node chunks in parallel and then reduced serially in chunk
/// order, so the result does not depend on the number of threads.
pub fn modularity(resolution: f64, network: &Network, clustering: &Clustering) -> f64 {
    let nodes = network.nodes();
    let total_edge_weight = network.total_edge_weight();
    if nodes == 0 || total_edge_weight <= 0.0 {
        return 0.0;
    }

    let chunk_size = std::cmp::max(1, nodes / 64);
    let order: Vec<usize> = (0..nodes).collect();
    let partial: Vec<f64> = order
        .par_chunks(chunk_size)
        .map(|chunk| {
            let mut internal = 0.0;
            for &i in chunk {
                let ci = clustering.get(i);
                for (j, w) in network.neighbors(i) {
                    if clustering.get(j) == ci {
                        internal += w;
                    }
                }
            }
            internal
        })
        .collect();
    let internal: f64 = partial.iter().sum();

    let mut cluster_weights = vec![0.0; clustering.num_clusters()];
    for i in 0..nodes {
        cluster_weights[clustering.get(i)] += network.weight(i);
    }
    let two_m = 2.0 * total_edge_weight;
    let expected: f64 = cluster_weights.iter().map(|w| w * w).sum::<f64>() * resolution / two_m;
    (internal - expected) / two_m
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_two_triangles() {
        let edges = vec![(0, 1, 1.0), (1, 2, 1.0), (0, 2, 1.0), (3, 4, 1.0), (4, 5, 1.0), (3, 5, 1.0), (2, 3, 1.0)];
        let n = Network::from_edges(6, edges);
        let split = Clustering::from_labels(&[0, 0, 0, 1, 1, 1]);
        let whole = Clustering::from_labels(&[0; 6]);
        // m = 7, internal = 12, cluster strengths 7 and 7
        let expected = (12.0 - 98.0 / 14.0) / 14.0;
        assert!((modularity(1.0, &n, &split) - expected).abs() < 1e-12);
        assert!(modularity(1.0, &n, &whole).abs() < 1e-12);
    }
}
