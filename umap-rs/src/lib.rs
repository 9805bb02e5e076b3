//! UMAP layout of a k-nearest-neighbor graph

pub mod curve_fit;
pub mod embedding;
pub mod fuzzy;
pub mod optimize;
pub mod umap;

pub use crate::umap::Umap;

/// Floating point type used throughout the layout
pub type Q = f64;
