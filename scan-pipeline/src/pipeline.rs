//! Runs every stage in dependency order, each inside its own thread pool.

use crate::classify::{classify_clusters, CellTypes, Reference};
use crate::cluster::{cluster_cells, Clusters};
use crate::config::PipelineConfig;
use crate::dendrogram::CentroidDendrogram;
use crate::dim_red::pca::{run_pca, PcaSummary};
use crate::dim_red::umap::run_umap;
use crate::error::{PipelineError, Stage};
use crate::integration::{fast_mnn, MergeStep};
use crate::normalization::{normalize, SizeFactorSummary};
use crate::parallel::run_in_pool;
use crate::qc::{quality_control, QcResult};
use crate::source::{annotate, AnnotationSource};
use crate::variance::{model_and_select, GeneVarTable};
use anyhow::Error;
use diff_exp::{find_markers, MarkerConfig, MarkerTable, UntestableCluster};
use log::{info, warn};
use scan_types::{Dataset, Factor, CORRECTED, PCA};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;

/// Everything a run produced. `dataset` is the QC-filtered dataset with size factors,
/// log-expression, gene variance columns, embeddings and `cluster` / `cell_type` cell columns.
#[derive(Clone, Debug)]
pub struct Analysis {
    pub dataset: Dataset,
    pub qc: QcResult,
    pub size_factors: SizeFactorSummary,
    pub gene_var: GeneVarTable,
    /// highly variable genes in rank order
    pub hvgs: Vec<usize>,
    pub pca: PcaSummary,
    /// empty when no integration ran
    pub merges: Vec<MergeStep>,
    /// embedding clustering and UMAP ran on
    pub embedding: String,
    pub clusters: Clusters,
    pub markers: Vec<MarkerTable>,
    pub dendrogram: Option<CentroidDendrogram>,
    pub cell_types: Option<CellTypes>,
    pub summary: Summary,
}

/// Serializable digest of a run
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Summary {
    pub dataset: String,
    pub cells_loaded: usize,
    pub cells_retained: usize,
    pub genes: usize,
    /// outliers per metric plus the total under `discard`
    pub discarded: BTreeMap<String, usize>,
    pub implausible_batches: Vec<String>,
    pub size_factors: SizeFactorSummary,
    pub n_hvgs: usize,
    pub pca: PcaSummary,
    pub merges: Vec<MergeStep>,
    pub embedding: String,
    pub cluster_sizes: Vec<usize>,
    pub silhouette: Vec<f64>,
    pub modularity: Option<f64>,
    pub cell_types: Option<Vec<String>>,
}

fn batch_factor(ds: &Dataset, cfg: &PipelineConfig) -> Result<Option<Factor>, Error> {
    match cfg.batch_column.as_deref() {
        Some(col) if ds.cells().contains(col) => Ok(Some(ds.cells().factor(col)?.drop_unused_levels())),
        Some(col) => {
            info!("no '{}' cell column, running without batches", col);
            Ok(None)
        }
        None => Ok(None),
    }
}

/// Marker tables for every cluster. A cluster too small to test is reported as insufficient
/// data of the marker stage.
pub fn cluster_markers(
    ds: &Dataset,
    clusters: &Factor,
    batch: Option<&Factor>,
    cfg: &MarkerConfig,
) -> Result<Vec<MarkerTable>, Error> {
    find_markers(ds.require_logcounts()?, ds.gene_ids(), clusters, batch, cfg).map_err(|err| {
        match err.downcast::<UntestableCluster>() {
            Ok(u) => PipelineError::insufficient(Stage::Markers, format!("cluster '{}'", u.cluster), u.detail),
            Err(err) => err,
        }
    })
}

/// Run the analysis on a loaded dataset. Gene annotation runs when `annotation` is given and
/// cell-type annotation when `reference` is.
pub fn run(
    ds: Dataset,
    cfg: &PipelineConfig,
    annotation: Option<&dyn AnnotationSource>,
    reference: Option<&Reference>,
) -> Result<Analysis, Error> {
    let tick = Instant::now();
    let threads = &cfg.threads;
    let cells_loaded = ds.n_cells();
    info!(
        "{}: dataset '{}' with {} genes x {} cells",
        Stage::Loader,
        ds.name(),
        ds.n_genes(),
        cells_loaded
    );

    let ds = match annotation {
        Some(source) => annotate(ds, source)?,
        None => ds,
    };

    let batch = batch_factor(&ds, cfg)?;
    let qc = run_in_pool(Stage::QualityControl, threads.pipeline, || {
        quality_control(&ds, &cfg.qc, batch.as_ref())
    })?;
    let ds = qc.apply(ds)?;
    let batch = batch_factor(&ds, cfg)?;

    let (ds, size_factors) = run_in_pool(Stage::Normalization, threads.pipeline, || {
        normalize(&ds, &cfg.normalization)
    })?;

    let (ds, gene_var, hvgs) = run_in_pool(Stage::VarianceModel, threads.pipeline, || {
        model_and_select(ds, &cfg.variance, batch.as_ref())
    })?;

    let (ds, pca) = run_in_pool(Stage::DimensionReduction, threads.embedding, || {
        run_pca(ds, &hvgs, &gene_var.tech, &cfg.pca)
    })?;

    let (ds, merges, embedding) = match (&cfg.integration, &batch) {
        (Some(mnn), Some(b)) if b.n_levels() >= 2 => {
            let (ds, merges) = run_in_pool(Stage::Integration, threads.integration, || fast_mnn(ds, &hvgs, b, mnn))?;
            (ds, merges, CORRECTED)
        }
        _ => (ds, Vec::new(), PCA),
    };

    let (ds, clusters) = run_in_pool(Stage::Clustering, threads.neighbors, || {
        cluster_cells(ds, embedding, &cfg.clustering)
    })?;

    let ds = match &cfg.umap {
        Some(umap) => run_in_pool(Stage::DimensionReduction, threads.embedding, || run_umap(ds, embedding, umap))?,
        None => ds,
    };

    let dendrogram = if clusters.n_clusters() >= 2 {
        let points = ds.require_embedding(embedding)?;
        Some(CentroidDendrogram::new(points.view(), &clusters.labels, clusters.n_clusters())?)
    } else {
        None
    };

    let cluster_factor = clusters.factor();
    let markers = if clusters.n_clusters() >= 2 {
        run_in_pool(Stage::Markers, threads.pipeline, || {
            cluster_markers(&ds, &cluster_factor, batch.as_ref(), &cfg.markers)
        })?
    } else {
        warn!("{}: a single cluster, no markers to find", Stage::Markers);
        Vec::new()
    };

    let (ds, cell_types) = match reference {
        Some(reference) => {
            let (ds, types) = run_in_pool(Stage::CellTypes, threads.pipeline, || {
                classify_clusters(ds, &cluster_factor, reference, &cfg.classify)
            })?;
            (ds, Some(types))
        }
        None => (ds, None),
    };

    let summary = Summary {
        dataset: ds.name().to_string(),
        cells_loaded,
        cells_retained: ds.n_cells(),
        genes: ds.n_genes(),
        discarded: qc.reasons(),
        implausible_batches: qc.implausible_batches(),
        size_factors: size_factors.clone(),
        n_hvgs: hvgs.len(),
        pca: pca.clone(),
        merges: merges.clone(),
        embedding: embedding.to_string(),
        cluster_sizes: clusters.sizes.clone(),
        silhouette: clusters.silhouette.clone(),
        modularity: clusters.modularity,
        cell_types: cell_types.as_ref().map(|t| t.assigned.clone()),
    };
    info!(
        "analysis of '{}' finished in {:.2}s: {} of {} cells kept, {} clusters",
        ds.name(),
        tick.elapsed().as_secs_f64(),
        ds.n_cells(),
        cells_loaded,
        clusters.n_clusters()
    );

    Ok(Analysis {
        dataset: ds,
        qc,
        size_factors,
        gene_var,
        hvgs,
        pca,
        merges,
        embedding: embedding.to_string(),
        clusters,
        markers,
        dendrogram,
        cell_types,
        summary,
    })
}

/// Whether `err` is an insufficient-data failure raised by `stage`
pub fn is_insufficient(err: &Error, stage: Stage) -> bool {
    matches!(err.downcast_ref::<PipelineError>(), Some(e) if e.stage() == stage)
}
