use crate::classify::CELL_TYPE;
use crate::cluster::{ClusterConfig, ClusterMethod};
use crate::config::{PipelineConfig, Threads};
use crate::error::Stage;
use crate::normalization::{normalize, NormConfig};
use crate::pipeline::{cluster_markers, is_insufficient, run, Analysis};
use crate::report::write_reports;
use crate::simulate::{Simulated, TRUTH};
use crate::source::{write_mtx_dir, DatasetSource, MtxSource};
use diff_exp::MarkerConfig;
use scan_types::{Dataset, Factor, CLUSTER, CORRECTED, UMAP};

fn graph_config() -> PipelineConfig {
    PipelineConfig {
        clustering: ClusterConfig {
            k: 20,
            resolution: 0.5,
            ..ClusterConfig::default()
        },
        ..PipelineConfig::default()
    }
}

/// Fraction of cells whose cluster agrees with the true type under the best one-to-one matching
/// of two clusters to two types
fn agreement(ds: &Dataset) -> f64 {
    let truth = ds.cells().factor(TRUTH).unwrap();
    let clusters = ds.cells().factor(CLUSTER).unwrap();
    let same = (0..ds.n_cells()).filter(|&i| truth.code(i) == clusters.code(i)).count();
    same.max(ds.n_cells() - same) as f64 / ds.n_cells() as f64
}

fn simulated() -> Dataset {
    Simulated::default().simulate("sim").unwrap()
}

fn check_two_types(analysis: &Analysis) {
    assert_eq!(analysis.qc.n_discarded(), 0);
    assert_eq!(analysis.dataset.n_cells(), 100);
    assert_eq!(analysis.clusters.n_clusters(), 2);
    let acc = agreement(&analysis.dataset);
    assert!(acc >= 0.9, "agreement {acc}");
}

#[test]
fn test_two_batches_two_types() {
    let analysis = run(simulated(), &graph_config(), None, None).unwrap();
    check_two_types(&analysis);

    assert_eq!(analysis.embedding, CORRECTED);
    assert_eq!(analysis.merges.len(), 1);
    assert!(analysis.merges[0].pairs > 0);
    assert_eq!(analysis.hvgs.len(), 5);
    assert!(analysis.hvgs.iter().all(|&g| g < 10));
    assert!(analysis.pca.n_components >= 1);
    assert_eq!(analysis.dataset.require_embedding(UMAP).unwrap().dim(), (100, 2));

    // each cluster's best marker is one of its type's marker genes
    assert_eq!(analysis.markers.len(), 2);
    for table in &analysis.markers {
        let best = &table.rows()[0];
        assert!(best.gene < 10, "cluster {} top gene {}", table.cluster(), best.gene_id);
        assert!(best.summary_logfc > 0.0);
    }
    let dendrogram = analysis.dendrogram.as_ref().unwrap();
    assert_eq!(dendrogram.merges.len(), 1);
    assert_eq!(analysis.summary.cluster_sizes.iter().sum::<usize>(), 100);
    assert_eq!(analysis.summary.discarded["discard"], 0);
}

#[test]
fn test_kmeans_without_integration() {
    let cfg = PipelineConfig {
        integration: None,
        umap: None,
        clustering: ClusterConfig {
            method: ClusterMethod::KMeans,
            centers: 2,
            ..ClusterConfig::default()
        },
        ..PipelineConfig::default()
    };
    let analysis = run(simulated(), &cfg, None, None).unwrap();
    check_two_types(&analysis);
    assert_eq!(analysis.embedding, scan_types::PCA);
    assert!(analysis.merges.is_empty());
    assert!(analysis.clusters.wss.is_some());
    assert!(analysis.dataset.embedding(UMAP).is_none());
}

#[test]
fn test_cell_types_from_reference() {
    let sim = Simulated::default();
    let reference = sim.reference(2).unwrap();
    let analysis = run(sim.simulate("sim").unwrap(), &graph_config(), None, Some(&reference)).unwrap();
    let types = analysis.cell_types.as_ref().unwrap();
    assert_eq!(types.assigned.len(), 2);
    let ds = &analysis.dataset;
    let truth = ds.cells().factor(TRUTH).unwrap();
    let assigned = ds.cells().text(CELL_TYPE).unwrap();
    let correct = (0..ds.n_cells())
        .filter(|&i| assigned[i].as_deref() == Some(truth.label(i)))
        .count();
    assert!(correct >= 90, "{correct} cells typed correctly");
}

#[test]
fn test_thread_count_does_not_change_results() {
    let mut one = graph_config();
    one.threads = Threads::uniform(1);
    let mut four = graph_config();
    four.threads = Threads::uniform(4);
    let a = run(simulated(), &one, None, None).unwrap();
    let b = run(simulated(), &four, None, None).unwrap();
    assert_eq!(a.clusters.labels, b.clusters.labels);
    assert_eq!(a.summary, b.summary);
    assert_eq!(a.dataset.embedding(UMAP), b.dataset.embedding(UMAP));
}

#[test]
fn test_small_batch_is_reported() {
    // 10 cells per batch is below the neighbour count of the batch merge
    let sim = Simulated {
        n_cells: 20,
        ..Simulated::default()
    };
    let err = run(sim.simulate("tiny").unwrap(), &graph_config(), None, None).unwrap_err();
    assert!(is_insufficient(&err, Stage::Integration), "{err:#}");
    assert!(err.to_string().contains("batch 'b1'"));
}

#[test]
fn test_single_cell_cluster_is_insufficient_for_markers() {
    let (ds, _) = normalize(&simulated(), &NormConfig::default()).unwrap();
    let labels: Vec<&str> = (0..ds.n_cells()).map(|c| if c == 7 { "2" } else { "1" }).collect();
    let batch = ds.cells().factor(scan_types::BATCH).unwrap();
    let err = cluster_markers(&ds, &Factor::from_labels(&labels), Some(&batch), &MarkerConfig::default()).unwrap_err();
    assert!(is_insufficient(&err, Stage::Markers), "{err:#}");
    assert!(err.to_string().contains("cluster '2'"), "{err:#}");
}

#[test]
fn test_reports_from_mtx_directory() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    let sim = Simulated::default();
    write_mtx_dir(&input, &sim.simulate("sim").unwrap()).unwrap();
    let ds = MtxSource::new(&input).load("").unwrap();
    assert_eq!((ds.n_genes(), ds.n_cells()), (50, 100));

    let analysis = run(ds, &graph_config(), None, Some(&sim.reference(1).unwrap())).unwrap();
    let out = dir.path().join("out");
    let files = write_reports(&out, &analysis).unwrap();
    for name in [
        "qc_metrics.csv",
        "qc_thresholds.csv",
        "size_factors.csv",
        "gene_var.csv",
        "pca.csv",
        "corrected.csv",
        "umap.csv",
        "markers_1.csv",
        "markers_2.csv",
        "cluster_centroid_dendrogram.csv",
        "celltypes.csv",
        "summary.json",
    ] {
        assert!(files.contains(&out.join(name)), "{name} missing");
    }
    let umap = std::fs::read_to_string(out.join("umap.csv")).unwrap();
    assert!(umap.starts_with("barcode,UMAP1,UMAP2,cluster,batch,cell_type\n"));
    assert_eq!(umap.lines().count(), 101);
    let markers = std::fs::read_to_string(out.join("markers_1.csv")).unwrap();
    assert!(markers.starts_with("gene_id,gene,top,p_value,fdr,summary_logfc,logfc_2\n"));
    let summary: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("summary.json")).unwrap()).unwrap();
    assert_eq!(summary["cells_retained"], 100);
    assert_eq!(summary["cluster_sizes"].as_array().unwrap().len(), 2);
}
