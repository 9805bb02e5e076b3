use crate::cluster::centroids;
use anyhow::{bail, Error};
use itertools::Itertools;
use kodama::{linkage, Method};
use ndarray::{ArrayView1, ArrayView2};
use serde::Serialize;
use std::collections::HashMap;

/// One merge of the dendrogram. Nodes `0..n` are the clusters; the node created by merge `i`
/// is `n + i`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Merge {
    pub left: usize,
    pub right: usize,
    pub height: f64,
    /// clusters below the new node
    pub size: usize,
}

/// Ward hierarchy over cluster centroids. A diagnostic of how clusters relate; nothing is
/// merged automatically.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CentroidDendrogram {
    pub n_leaves: usize,
    pub merges: Vec<Merge>,
}

fn euclidean(x: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
    x.iter().zip(y).map(|(a, b)| (a - b) * (a - b)).sum::<f64>().sqrt()
}

impl CentroidDendrogram {
    /// Build from an embedding and per-cell cluster labels in `0..n_clusters`
    pub fn new(points: ArrayView2<f64>, labels: &[usize], n_clusters: usize) -> Result<CentroidDendrogram, Error> {
        if n_clusters < 2 {
            bail!("need at least two clusters for a dendrogram, got {}", n_clusters);
        }
        let centers = centroids(points, labels, n_clusters);
        let mut condensed = Vec::with_capacity(n_clusters * (n_clusters - 1) / 2);
        for i in 0..n_clusters {
            for j in i + 1..n_clusters {
                condensed.push(euclidean(centers.row(i), centers.row(j)));
            }
        }
        let dendrogram = linkage(&mut condensed, n_clusters, Method::Ward);
        let merges = dendrogram
            .steps()
            .iter()
            .map(|s| Merge {
                left: s.cluster1.min(s.cluster2),
                right: s.cluster1.max(s.cluster2),
                height: s.dissimilarity,
                size: s.size,
            })
            .collect();
        Ok(CentroidDendrogram {
            n_leaves: n_clusters,
            merges,
        })
    }

    /// Group the clusters into `k` groups by applying all but the last `k - 1` merges. Returns
    /// a 1-based group per cluster, numbered in order of first appearance.
    pub fn cut_tree(&self, k: usize) -> Vec<usize> {
        let n = self.n_leaves;
        let applied = n.saturating_sub(k.max(1));
        let mut members: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
        for m in self.merges.iter().take(applied) {
            let mut merged = std::mem::take(&mut members[m.left]);
            merged.append(&mut members[m.right]);
            members.push(merged);
        }
        let mut node_of = vec![0; n];
        for (node, leaves) in members.iter().enumerate() {
            for &leaf in leaves {
                node_of[leaf] = node;
            }
        }
        let numbering: HashMap<usize, usize> = node_of.iter().unique().enumerate().map(|(i, &v)| (v, i + 1)).collect();
        node_of.iter().map(|v| numbering[v]).collect()
    }
}
