//! Louvain community detection on weighted, undirected graphs
#![deny(missing_docs)]

/// Node-to-community assignment
pub mod clustering;

/// Weighted, undirected graph (aka network)
pub mod network;

/// Louvain clustering algorithm
pub mod louvain;

/// Clustering objective functions
pub mod objective;

mod local_moving;

pub use clustering::Clustering;
pub use louvain::Louvain;
pub use network::Network;

trait ZeroVec {
    fn zero_len(&mut self, len: usize);
}

impl<T: Default + Clone> ZeroVec for Vec<T> {
    fn zero_len(&mut self, len: usize) {
        self.clear();
        self.resize(len, T::default())
    }
}
