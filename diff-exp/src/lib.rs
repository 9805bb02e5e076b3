//! Pairwise differential expression between clusters for marker gene detection
#![deny(missing_docs)]

/// p-value adjustment and combination
pub mod dist;
/// marker tables from pairwise comparisons
pub mod markers;
/// Welch t-tests on per-group summaries
pub mod ttest;

pub use crate::markers::{
    find_markers, Direction, MarkerConfig, MarkerRow, MarkerTable, PvalType, UntestableCluster,
};
