use crate::local_moving::LocalMoving;
use crate::objective::modularity;
use crate::{Clustering, Network};
use log::debug;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// Default resolution for Louvain
pub const DEFAULT_RESOLUTION: f64 = 1.0;

/// Stop when an iteration improves modularity by less than this
pub const DEFAULT_EPSILON: f64 = 1e-7;

/// Perform the Louvain clustering algorithm
pub struct Louvain {
    resolution: f64,
    rng: ChaCha20Rng,
    local_moving: LocalMoving,
}

impl Louvain {
    /// Initialize the Louvain algorithm with the given resolution.
    /// An optional random seed can be supplied, otherwise a seed of 0 will be used.
    pub fn new(resolution: f64, seed: Option<u64>) -> Louvain {
        Louvain {
            resolution,
            rng: ChaCha20Rng::seed_from_u64(seed.unwrap_or_default()),
            local_moving: LocalMoving::new(resolution),
        }
    }

    /// Iterate the Louvain algorithm one step: local moving on `n`, then recursively on the
    /// network aggregated by the result. Returns true if cluster labels were updated.
    pub fn iterate(&mut self, n: &Network, c: &mut Clustering) -> bool {
        let mut update = self.local_moving.iterate(n, c, &mut self.rng);

        if c.num_clusters() == n.nodes() {
            return update;
        }

        let reduced = n.create_reduced_network(c);
        let mut reduced_clusters = Clustering::singletons(reduced.nodes());
        update |= self.iterate(&reduced, &mut reduced_clusters);
        c.merge_clusters(&reduced_clusters);

        update
    }

    /// Cluster `n` starting from singletons, iterating until modularity stops improving or
    /// `max_iterations` is reached.
    pub fn run(&mut self, n: &Network, max_iterations: usize) -> Clustering {
        let mut clustering = Clustering::singletons(n.nodes());
        let mut score = modularity(self.resolution, n, &clustering);
        for iter in 1..=max_iterations {
            let updated = self.iterate(n, &mut clustering);
            let new_score = modularity(self.resolution, n, &clustering);
            debug!(
                "louvain iteration {}: {} clusters, modularity {:.6}",
                iter,
                clustering.num_clusters(),
                new_score
            );
            if !updated || new_score - score <= DEFAULT_EPSILON {
                break;
            }
            score = new_score;
        }
        clustering
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::Rng;
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    /// Planted-partition graph: `k` groups of `size` nodes, within-group edges with probability
    /// `p_in`, between-group edges with probability `p_out`.
    fn planted(k: usize, size: usize, p_in: f64, p_out: f64, seed: u64) -> (Network, Vec<usize>) {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let n = k * size;
        let truth: Vec<usize> = (0..n).map(|i| i / size).collect();
        let mut edges = Vec::new();
        for i in 0..n {
            for j in (i + 1)..n {
                let p = if truth[i] == truth[j] { p_in } else { p_out };
                if rng.gen_bool(p) {
                    edges.push((i, j, 1.0));
                }
            }
        }
        (Network::from_edges(n, edges), truth)
    }

    fn same_partition(a: &[usize], b: &[usize]) -> bool {
        (0..a.len()).all(|i| (0..a.len()).all(|j| (a[i] == a[j]) == (b[i] == b[j])))
    }

    #[test]
    fn test_recovers_planted_partition() {
        let (n, truth) = planted(4, 25, 0.5, 0.01, 0);
        let c = Louvain::new(DEFAULT_RESOLUTION, Some(0xBADC0FFEE0DDF00D)).run(&n, 20);
        assert_eq!(c.num_clusters(), 4);
        assert!(same_partition(c.labels(), &truth));
        let q = modularity(DEFAULT_RESOLUTION, &n, &c);
        let q_truth = modularity(DEFAULT_RESOLUTION, &n, &Clustering::from_labels(&truth));
        assert!(q >= q_truth - 1e-12);
    }

    #[test]
    fn test_seeded_runs_identical() {
        let (n, _) = planted(3, 30, 0.3, 0.05, 1);
        let a = Louvain::new(DEFAULT_RESOLUTION, Some(7)).run(&n, 20);
        let b = Louvain::new(DEFAULT_RESOLUTION, Some(7)).run(&n, 20);
        assert_eq!(a, b);
    }

    #[test]
    fn test_disconnected_nodes() {
        let n = Network::from_edges(5, vec![(0, 1, 1.0)]);
        let c = Louvain::new(DEFAULT_RESOLUTION, None).run(&n, 10);
        assert_eq!(c.get(0), c.get(1));
        assert_eq!(c.num_clusters(), 4);
        let empty = Network::from_edges(0, Vec::new());
        assert_eq!(Louvain::new(DEFAULT_RESOLUTION, None).run(&empty, 10).nodes(), 0);
    }
}
