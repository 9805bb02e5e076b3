/// Vec-backed assignment of nodes to clusters. Labels are kept dense: `0..num_clusters` are all
/// in use after [`Clustering::remove_empty_clusters`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Clustering {
    labels: Vec<usize>,
    num_clusters: usize,
}

impl Clustering {
    /// Each node in its own cluster
    pub fn singletons(num_nodes: usize) -> Self {
        Clustering {
            labels: (0..num_nodes).collect(),
            num_clusters: num_nodes,
        }
    }

    /// Initialize the clustering with a known set of labels. Unused labels are removed.
    pub fn from_labels(labels: &[usize]) -> Self {
        let mut c = Clustering {
            labels: labels.to_vec(),
            num_clusters: labels.iter().max().map_or(0, |&m| m + 1),
        };
        c.remove_empty_clusters();
        c
    }

    /// Label of node `i`
    pub fn get(&self, i: usize) -> usize {
        self.labels[i]
    }

    /// Set the label of node `i`
    pub fn set(&mut self, i: usize, cluster: usize) {
        self.labels[i] = cluster;
        if cluster >= self.num_clusters {
            self.num_clusters = cluster + 1;
        }
    }

    /// Total number of nodes
    pub fn nodes(&self) -> usize {
        self.labels.len()
    }

    /// Number of cluster labels in use
    pub fn num_clusters(&self) -> usize {
        self.num_clusters
    }

    /// Per-node labels
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Nodes in each cluster
    pub fn nodes_per_cluster(&self) -> Vec<Vec<usize>> {
        let mut lists = vec![Vec::new(); self.num_clusters];
        for (node, &label) in self.labels.iter().enumerate() {
            lists[label].push(node)
        }
        lists
    }

    /// Relabel so that labels are dense, keeping their relative order.
    pub fn remove_empty_clusters(&mut self) {
        let mut counts = vec![0usize; self.num_clusters];
        for &l in &self.labels {
            counts[l] += 1;
        }
        let mut remap = vec![usize::MAX; self.num_clusters];
        let mut next = 0;
        for (old, &count) in counts.iter().enumerate() {
            if count > 0 {
                remap[old] = next;
                next += 1;
            }
        }
        for l in self.labels.iter_mut() {
            *l = remap[*l];
        }
        self.num_clusters = next;
    }

    /// Take a clustering of the clusters and relabel every node with its cluster's cluster.
    pub fn merge_clusters(&mut self, cluster_clustering: &Clustering) {
        for l in self.labels.iter_mut() {
            *l = cluster_clustering.get(*l);
        }
        self.num_clusters = cluster_clustering.num_clusters();
        self.remove_empty_clusters();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_from_labels() {
        let c = Clustering::from_labels(&[1, 2, 3, 4, 5]);
        assert_eq!(c.num_clusters(), 5);
        assert_eq!(c.labels(), &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_operations() {
        let mut c = Clustering::singletons(10);
        assert_eq!(c.num_clusters(), 10);
        c.set(8, 0);
        c.set(7, 0);
        c.remove_empty_clusters();
        assert_eq!(c.num_clusters(), 8);
        assert_eq!(c.get(9), 7);
    }

    #[test]
    fn test_merge() {
        let mut c = Clustering::from_labels(&[0, 0, 1, 2, 2]);
        c.merge_clusters(&Clustering::from_labels(&[0, 1, 1]));
        assert_eq!(c.labels(), &[0, 0, 1, 1, 1]);
        assert_eq!(c.nodes_per_cluster(), vec![vec![0, 1], vec![2, 3, 4]]);
    }
}
