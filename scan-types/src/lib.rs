//! Data model shared by the pipeline stages: a genes x cells count matrix together with the
//! gene / cell metadata and derived matrices that must stay aligned with it.

pub mod dataset;
pub mod factor;
pub mod matrix;
pub mod table;

pub use dataset::Dataset;
pub use factor::Factor;
pub use matrix::{CountMatrix, ExprMatrix, SparseColumns};
pub use table::{Column, Table};

/// Embedding name for principal components
pub const PCA: &str = "PCA";
/// Embedding name for batch-corrected coordinates
pub const CORRECTED: &str = "corrected";
/// Embedding name for the 2-D layout
pub const UMAP: &str = "UMAP";

/// Cell-table column holding cluster assignments
pub const CLUSTER: &str = "cluster";
/// Cell-table column holding batch labels
pub const BATCH: &str = "batch";
