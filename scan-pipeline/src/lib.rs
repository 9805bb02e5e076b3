//! # scan-pipeline: single-cell RNA-seq analysis stages
//!
//! Each stage takes a [`Dataset`](scan_types::Dataset) and returns a new, enriched or narrowed
//! one. [`pipeline::run`] chains them in dependency order: load, annotate, quality control,
//! normalization, variance modelling, optional batch integration, dimensionality reduction,
//! clustering, marker detection and optional cell-type annotation.

/// Stage identifiers and the typed error taxonomy
pub mod error;

/// Serializable settings for a whole run
pub mod config;

/// Per-stage rayon thread pools
pub mod parallel;

/// Statistics helpers
pub mod stats;

/// MTX / TSV reading and writing
pub mod mtx;

/// Dataset and annotation sources
pub mod source;

/// Synthetic datasets
pub mod simulate;

/// Per-cell quality control
pub mod qc;

/// Size factors and log-normalization
pub mod normalization;

/// Mean-variance trend and highly variable genes
pub mod variance;

/// Dimensionality reduction methods
pub mod dim_red;

/// Nearest-neighbor search
pub mod nn;

/// Mutual nearest-neighbour batch correction
pub mod integration;

/// Graph-based and k-means clustering
pub mod cluster;

/// Hierarchical clustering of cluster centroids
pub mod dendrogram;

/// Reference-based cell-type annotation
pub mod classify;

/// Stage orchestration
pub mod pipeline;

/// Diagnostic tables written after a run
pub mod report;

#[cfg(test)]
mod test_pipeline;

pub use config::{PipelineConfig, Threads};
pub use error::{PipelineError, Stage};
pub use pipeline::{run, Analysis, Summary};
