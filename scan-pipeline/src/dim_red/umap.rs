use crate::error::{PipelineError, Stage};
use crate::nn::knn;
use anyhow::Error;
use log::info;
use ndarray::s;
use scan_types::Dataset;
use serde::{Deserialize, Serialize};
use umap_rs::embedding::Init;
use umap_rs::Umap;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UmapConfig {
    pub n_neighbors: usize,
    pub min_dist: f64,
    pub spread: f64,
    /// 0 picks by dataset size
    pub n_epochs: usize,
    /// leading components of the input embedding to use, 0 for all
    pub n_components: usize,
    /// exact neighbour search up to this many cells, HNSW above
    pub exact_knn_max_cells: usize,
    /// start from the leading input components instead of random positions
    pub init_from_input: bool,
    pub seed: u64,
}

impl Default for UmapConfig {
    fn default() -> Self {
        UmapConfig {
            n_neighbors: 15,
            min_dist: 0.3,
            spread: 1.0,
            n_epochs: 0,
            n_components: 0,
            exact_knn_max_cells: 5000,
            init_from_input: true,
            seed: 0,
        }
    }
}

/// 2-D UMAP layout of the `input` embedding, attached as `UMAP`
pub fn run_umap(ds: Dataset, input: &str, cfg: &UmapConfig) -> Result<Dataset, Error> {
    let emb = ds.require_embedding(input)?;
    let n = emb.nrows();
    if n < 3 {
        return Err(PipelineError::insufficient(
            Stage::DimensionReduction,
            format!("embedding '{}'", input),
            format!("{} cells, UMAP needs at least 3", n),
        ));
    }
    let dims = match cfg.n_components {
        0 => emb.ncols(),
        d => d.min(emb.ncols()),
    };
    let points = emb.slice(s![.., ..dims]);
    let k = cfg.n_neighbors.clamp(1, n - 1);
    let neighbors = knn(points, k, cfg.exact_knn_max_cells, cfg.seed)?;
    let (idx, dist) = neighbors.with_self();

    let init = if cfg.init_from_input && dims >= 2 {
        Init::Given(points.to_owned())
    } else {
        Init::Random
    };
    let epochs = (cfg.n_epochs > 0).then_some(cfg.n_epochs);
    let layout = Umap::new(2, cfg.min_dist, cfg.spread, epochs).fit(&idx, &dist, &init, cfg.seed)?;
    info!(
        "{}: UMAP of '{}' ({} cells, {} dims, {} neighbours)",
        Stage::DimensionReduction,
        input,
        n,
        dims,
        k
    );
    ds.with_embedding(scan_types::UMAP, layout)
}
