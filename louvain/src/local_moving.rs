use crate::{Clustering, Network, ZeroVec};
use rand::{seq::SliceRandom, Rng};

/// Moves single nodes between neighboring clusters while the modularity improves.
#[derive(Default)]
pub(crate) struct LocalMoving {
    resolution: f64,
    cluster_weights: Vec<f64>,
    nodes_per_cluster: Vec<usize>,
    unused_clusters: Vec<usize>,
    node_order: Vec<usize>,
    edge_weight_per_cluster: Vec<f64>,
    neighboring_clusters: Vec<usize>,
}

impl LocalMoving {
    pub fn new(resolution: f64) -> Self {
        LocalMoving {
            resolution,
            ..LocalMoving::default()
        }
    }

    /// One sweep over all nodes in random order. Returns true if any node changed cluster.
    pub fn iterate(&mut self, n: &Network, c: &mut Clustering, rng: &mut impl Rng) -> bool {
        let nodes = n.nodes();
        if nodes == 0 {
            return false;
        }
        let total_edge_weight = n.total_edge_weight();
        if total_edge_weight <= 0.0 {
            return false;
        }
        let scale = self.resolution / (2.0 * total_edge_weight);

        self.cluster_weights.zero_len(nodes);
        self.nodes_per_cluster.zero_len(nodes);
        for i in 0..nodes {
            self.cluster_weights[c.get(i)] += n.weight(i);
            self.nodes_per_cluster[c.get(i)] += 1;
        }

        // stack of empty cluster ids, lowest on top
        self.unused_clusters.clear();
        for i in (0..nodes).rev() {
            if self.nodes_per_cluster[i] == 0 {
                self.unused_clusters.push(i);
            }
        }

        self.node_order.clear();
        self.node_order.extend(0..nodes);
        self.node_order.shuffle(rng);

        self.edge_weight_per_cluster.zero_len(nodes);
        let mut update = false;

        for idx in 0..nodes {
            let j = self.node_order[idx];
            let current = c.get(j);
            let wj = n.weight(j);

            self.cluster_weights[current] -= wj;
            self.nodes_per_cluster[current] -= 1;
            if self.nodes_per_cluster[current] == 0 {
                self.unused_clusters.push(current);
            }

            // an empty cluster is always a candidate so the node can be isolated
            self.neighboring_clusters.clear();
            if let Some(&empty) = self.unused_clusters.last() {
                self.neighboring_clusters.push(empty);
            }
            for (target, w) in n.neighbors(j) {
                let l = c.get(target);
                if self.edge_weight_per_cluster[l] == 0.0 {
                    self.neighboring_clusters.push(l);
                }
                self.edge_weight_per_cluster[l] += w;
            }

            // ties resolve to the lowest label, and staying put wins among equals
            let mut best = current;
            let mut best_gain = self.edge_weight_per_cluster[current] - wj * self.cluster_weights[current] * scale;
            for &l in &self.neighboring_clusters {
                let gain = self.edge_weight_per_cluster[l] - wj * self.cluster_weights[l] * scale;
                if gain > best_gain || (gain == best_gain && l < best && best != current) {
                    best = l;
                    best_gain = gain;
                }
            }
            for &l in &self.neighboring_clusters {
                self.edge_weight_per_cluster[l] = 0.0;
            }
            self.edge_weight_per_cluster[current] = 0.0;

            self.cluster_weights[best] += wj;
            self.nodes_per_cluster[best] += 1;
            if self.unused_clusters.last() == Some(&best) {
                self.unused_clusters.pop();
            }

            if best != current {
                c.set(j, best);
                update = true;
            }
        }

        if update {
            c.remove_empty_clusters();
        }
        update
    }
}
