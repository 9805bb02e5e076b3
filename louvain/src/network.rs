use crate::Clustering;
use std::collections::BTreeMap;

/// Weighted undirected graph stored as sorted adjacency lists. Each edge appears in the lists of
/// both endpoints. Node weights are the node strengths (sum of incident edge weights, including
/// collapsed internal edges after aggregation), which is what the modularity objective needs.
#[derive(Clone, Debug, Default)]
pub struct Network {
    node_weights: Vec<f64>,
    adjacency: Vec<Vec<(usize, f64)>>,
    // weight of edges that were collapsed inside aggregated nodes
    self_loop_weight: f64,
}

impl Network {
    /// Build a network on `n_nodes` nodes from `(i, j, weight)` edges. Duplicate edges (in either
    /// orientation) have their weights summed; self-edges and non-positive weights are dropped.
    pub fn from_edges<I: IntoIterator<Item = (usize, usize, f64)>>(n_nodes: usize, edges: I) -> Network {
        let mut merged = BTreeMap::new();
        for (i, j, w) in edges {
            if i == j || w <= 0.0 {
                continue;
            }
            assert!(i < n_nodes && j < n_nodes, "edge ({i}, {j}) out of range");
            let key = if i < j { (i, j) } else { (j, i) };
            *merged.entry(key).or_insert(0.0) += w;
        }
        let mut adjacency = vec![Vec::new(); n_nodes];
        let mut node_weights = vec![0.0; n_nodes];
        for ((i, j), w) in merged {
            adjacency[i].push((j, w));
            adjacency[j].push((i, w));
            node_weights[i] += w;
            node_weights[j] += w;
        }
        for adj in adjacency.iter_mut() {
            adj.sort_by_key(|&(t, _)| t);
        }
        Network {
            node_weights,
            adjacency,
            self_loop_weight: 0.0,
        }
    }

    /// Number of nodes in the graph
    pub fn nodes(&self) -> usize {
        self.node_weights.len()
    }

    /// Get the node weight of `node`.
    pub fn weight(&self, node: usize) -> f64 {
        self.node_weights[node]
    }

    /// Pairs of (adjacent node id, edge weight) for all neighbors of `node`.
    pub fn neighbors(&self, node: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.adjacency[node].iter().copied()
    }

    /// Number of undirected edges between distinct nodes
    pub fn edges(&self) -> usize {
        self.adjacency.iter().map(Vec::len).sum::<usize>() / 2
    }

    /// Total weight of all undirected edges, counting each once and including internal edges
    /// collapsed by aggregation.
    pub fn total_edge_weight(&self) -> f64 {
        let mut w = self.self_loop_weight;
        for (i, adj) in self.adjacency.iter().enumerate() {
            for &(j, ew) in adj {
                if j > i {
                    w += ew;
                }
            }
        }
        w
    }

    /// Creates an aggregate network based on a clustering. Each node in the reduced network
    /// corresponds to a cluster of the original network, its weight is the summed weight of its
    /// members, and edges between clusters carry the summed weight of the edges between them.
    pub fn create_reduced_network(&self, clustering: &Clustering) -> Network {
        let k = clustering.num_clusters();
        let mut node_weights = vec![0.0; k];
        let mut internal = self.self_loop_weight;
        let mut merged = BTreeMap::new();
        for i in 0..self.nodes() {
            let ci = clustering.get(i);
            node_weights[ci] += self.node_weights[i];
            for &(j, w) in &self.adjacency[i] {
                if j <= i {
                    continue;
                }
                let cj = clustering.get(j);
                if ci == cj {
                    internal += w;
                } else {
                    let key = if ci < cj { (ci, cj) } else { (cj, ci) };
                    *merged.entry(key).or_insert(0.0) += w;
                }
            }
        }
        let mut adjacency = vec![Vec::new(); k];
        for ((a, b), w) in merged {
            adjacency[a].push((b, w));
            adjacency[b].push((a, w));
        }
        for adj in adjacency.iter_mut() {
            adj.sort_by_key(|&(t, _)| t);
        }
        Network {
            node_weights,
            adjacency,
            self_loop_weight: internal,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_merge_duplicate_edges() {
        let n = Network::from_edges(3, vec![(0, 1, 1.0), (1, 0, 2.0), (1, 2, 1.0), (2, 2, 5.0)]);
        assert_eq!(n.edges(), 2);
        assert_eq!(n.neighbors(0).collect::<Vec<_>>(), vec![(1, 3.0)]);
        assert_eq!(n.weight(1), 4.0);
        assert_eq!(n.total_edge_weight(), 4.0);
    }

    #[test]
    fn test_reduced_network_keeps_total_weight() {
        let n = Network::from_edges(4, vec![(0, 1, 1.0), (1, 2, 0.5), (2, 3, 1.0), (0, 3, 0.25)]);
        let c = Clustering::from_labels(&[0, 0, 1, 1]);
        let r = n.create_reduced_network(&c);
        assert_eq!(r.nodes(), 2);
        assert_eq!(r.neighbors(0).collect::<Vec<_>>(), vec![(1, 0.75)]);
        assert_eq!(r.total_edge_weight(), n.total_edge_weight());
        assert_eq!(r.weight(0) + r.weight(1), 2.0 * n.total_edge_weight());
    }
}
