use crate::classify::ClassifyConfig;
use crate::cluster::ClusterConfig;
use crate::dim_red::pca::PcaConfig;
use crate::dim_red::umap::UmapConfig;
use crate::integration::MnnConfig;
use crate::normalization::NormConfig;
use crate::qc::QcConfig;
use crate::variance::VarianceConfig;
use anyhow::{Context, Error};
use diff_exp::MarkerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Worker threads per stage group. 0 lets rayon use every core.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Threads {
    /// QC metrics, normalization, variance fits, marker tests, pseudo-bulk
    pub pipeline: usize,
    pub integration: usize,
    /// neighbour search and clustering
    pub neighbors: usize,
    /// PCA and UMAP
    pub embedding: usize,
}

impl Threads {
    /// The same count for every stage
    pub fn uniform(n: usize) -> Threads {
        Threads {
            pipeline: n,
            integration: n,
            neighbors: n,
            embedding: n,
        }
    }
}

/// Settings for a whole run. Every field has a default, so a JSON file only needs to name the
/// values it changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// cell column with batch labels; QC, variance and markers are blocked on it when present
    pub batch_column: Option<String>,
    pub qc: QcConfig,
    pub normalization: NormConfig,
    pub variance: VarianceConfig,
    /// batch correction, skipped when `None` or when fewer than two batches are present
    pub integration: Option<MnnConfig>,
    pub pca: PcaConfig,
    /// `None` skips the layout
    pub umap: Option<UmapConfig>,
    pub clustering: ClusterConfig,
    pub markers: MarkerConfig,
    pub classify: ClassifyConfig,
    pub threads: Threads,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            batch_column: Some(scan_types::BATCH.to_string()),
            qc: QcConfig::default(),
            normalization: NormConfig::default(),
            variance: VarianceConfig::default(),
            integration: Some(MnnConfig::default()),
            pca: PcaConfig::default(),
            umap: Some(UmapConfig::default()),
            clustering: ClusterConfig::default(),
            markers: MarkerConfig::default(),
            classify: ClassifyConfig::default(),
            threads: Threads::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_path(path: impl AsRef<Path>) -> Result<PipelineConfig, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| path.display().to_string())?;
        Self::from_json(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<PipelineConfig, Error> {
        Ok(serde_json::from_str(text)?)
    }

    /// Use one seed for every randomized stage
    pub fn with_seed(mut self, seed: u64) -> PipelineConfig {
        self.normalization.seed = seed;
        self.pca.seed = seed;
        self.clustering.seed = seed;
        if let Some(mnn) = self.integration.as_mut() {
            mnn.seed = seed;
        }
        if let Some(umap) = self.umap.as_mut() {
            umap.seed = seed;
        }
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::ClusterMethod;

    #[test]
    fn test_partial_json() {
        let cfg = PipelineConfig::from_json(
            r#"{"clustering": {"method": "k_means", "centers": 3}, "integration": null, "threads": {"pipeline": 2}}"#,
        )
        .unwrap();
        assert_eq!(cfg.clustering.method, ClusterMethod::KMeans);
        assert_eq!(cfg.clustering.centers, 3);
        assert_eq!(cfg.clustering.n_start, 10);
        assert!(cfg.integration.is_none());
        assert_eq!(cfg.threads.pipeline, 2);
        assert_eq!(cfg.threads.embedding, 0);
        assert_eq!(cfg.batch_column.as_deref(), Some("batch"));
        assert_eq!(cfg.classify.quantile, 0.8);
    }

    #[test]
    fn test_round_trip_and_unknown_values() {
        let cfg = PipelineConfig::default().with_seed(9);
        let back = PipelineConfig::from_json(&serde_json::to_string(&cfg).unwrap()).unwrap();
        assert_eq!(back, cfg);
        assert_eq!(back.umap.unwrap().seed, 9);
        assert!(PipelineConfig::from_json(r#"{"normalization": {"method": "median"}}"#).is_err());
    }
}
