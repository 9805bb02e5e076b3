//! Tables behind the diagnostic plots of a run, plus a JSON summary.

use crate::classify::{CellTypes, CELL_TYPE};
use crate::dendrogram::CentroidDendrogram;
use crate::mtx::create_text;
use crate::pipeline::Analysis;
use crate::qc::QcResult;
use crate::source::gene_labels;
use crate::variance::GeneVarTable;
use anyhow::{Context, Error};
use diff_exp::MarkerTable;
use log::info;
use ndarray::Array2;
use scan_types::{Dataset, BATCH, CLUSTER, CORRECTED, PCA, UMAP};
use std::fs::create_dir_all;
use std::io::Write;
use std::path::{Path, PathBuf};

type CsvWriter = csv::Writer<Box<dyn Write>>;

fn csv_writer(path: &Path) -> Result<CsvWriter, Error> {
    Ok(csv::Writer::from_writer(create_text(path)?))
}

fn fmt(v: f64) -> String {
    if v.is_nan() {
        "NA".to_string()
    } else {
        v.to_string()
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map_or_else(|| "NA".to_string(), fmt)
}

/// Per-cell QC metrics, outlier flags and discard decision for every loaded cell
pub fn write_qc_metrics(path: &Path, qc: &QcResult) -> Result<(), Error> {
    let mut w = csv_writer(path)?;
    let metrics: Vec<_> = qc.metrics().values.iter().collect();
    let outliers: Vec<_> = qc.outliers().iter().collect();
    let mut header = vec!["barcode".to_string(), "batch".to_string()];
    header.extend(metrics.iter().map(|(m, _)| m.column().to_string()));
    header.extend(outliers.iter().map(|(m, _)| format!("low_or_high_{}", m.column())));
    header.push("discard".to_string());
    w.write_record(&header)?;
    for (i, barcode) in qc.barcodes().iter().enumerate() {
        let mut row = vec![barcode.clone(), qc.batch().label(i).to_string()];
        row.extend(metrics.iter().map(|(_, v)| fmt(v[i])));
        row.extend(outliers.iter().map(|(_, f)| f[i].to_string()));
        row.push(qc.discard()[i].to_string());
        w.write_record(&row)?;
    }
    w.flush()?;
    Ok(())
}

pub fn write_qc_thresholds(path: &Path, qc: &QcResult) -> Result<(), Error> {
    let mut w = csv_writer(path)?;
    w.write_record(["batch", "metric", "lower", "upper", "implausible", "shared"])?;
    for t in qc.thresholds() {
        w.write_record([
            t.batch.clone(),
            t.metric.column().to_string(),
            fmt(t.lower),
            fmt(t.upper),
            t.implausible.to_string(),
            t.shared.to_string(),
        ])?;
    }
    w.flush()?;
    Ok(())
}

pub fn write_size_factors(path: &Path, ds: &Dataset) -> Result<(), Error> {
    let sf = ds.size_factors().context("dataset has no size factors")?;
    let lib = ds.counts().column_sums();
    let mut w = csv_writer(path)?;
    w.write_record(["barcode", "size_factor", "library_size"])?;
    for ((barcode, s), l) in ds.barcodes().iter().zip(sf).zip(lib) {
        w.write_record([barcode.clone(), fmt(*s), fmt(l)])?;
    }
    w.flush()?;
    Ok(())
}

/// Mean-variance decomposition per gene, the data of the trend plot
pub fn write_gene_var(path: &Path, ds: &Dataset, table: &GeneVarTable, hvgs: &[usize]) -> Result<(), Error> {
    let mut selected = vec![false; table.len()];
    for &g in hvgs {
        selected[g] = true;
    }
    let labels = gene_labels(ds);
    let mut w = csv_writer(path)?;
    w.write_record(["gene_id", "gene", "mean", "total", "tech", "bio", "hvg"])?;
    for (g, id) in ds.gene_ids().iter().enumerate().take(table.len()) {
        w.write_record([
            id.clone(),
            labels[g].clone(),
            fmt(table.mean[g]),
            fmt(table.total[g]),
            fmt(table.tech[g]),
            fmt(table.bio[g]),
            selected[g].to_string(),
        ])?;
    }
    w.flush()?;
    Ok(())
}

/// Embedding coordinates per cell, followed by the given text columns
pub fn write_embedding(
    path: &Path,
    ds: &Dataset,
    coords: &Array2<f64>,
    prefix: &str,
    extra: &[(&str, Vec<String>)],
) -> Result<(), Error> {
    let mut w = csv_writer(path)?;
    let mut header = vec!["barcode".to_string()];
    header.extend((1..=coords.ncols()).map(|j| format!("{prefix}{j}")));
    header.extend(extra.iter().map(|(name, _)| name.to_string()));
    w.write_record(&header)?;
    for (i, barcode) in ds.barcodes().iter().enumerate() {
        let mut row = vec![barcode.clone()];
        row.extend(coords.row(i).iter().map(|&v| fmt(v)));
        row.extend(extra.iter().map(|(_, values)| values[i].clone()));
        w.write_record(&row)?;
    }
    w.flush()?;
    Ok(())
}

/// Rendered values of a cell column, if present
fn cell_labels(ds: &Dataset, name: &str) -> Option<Vec<String>> {
    let column = ds.cells().get(name)?;
    Some((0..ds.n_cells()).map(|i| column.render(i)).collect())
}

/// One cluster's marker table; `labels` gives the display name of every gene index
pub fn write_markers(path: &Path, table: &MarkerTable, labels: &[String]) -> Result<(), Error> {
    let mut w = csv_writer(path)?;
    let mut header: Vec<String> = ["gene_id", "gene", "top", "p_value", "fdr", "summary_logfc"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    header.extend(table.others().iter().map(|o| format!("logfc_{o}")));
    w.write_record(&header)?;
    for r in table.rows() {
        let mut row = vec![
            r.gene_id.clone(),
            labels[r.gene].clone(),
            r.top.to_string(),
            fmt(r.p_value),
            fmt(r.fdr),
            fmt(r.summary_logfc),
        ];
        row.extend(r.logfc.iter().map(|&v| fmt(v)));
        w.write_record(&row)?;
    }
    w.flush()?;
    Ok(())
}

pub fn write_dendrogram(path: &Path, dendrogram: &CentroidDendrogram) -> Result<(), Error> {
    let mut w = csv_writer(path)?;
    w.write_record(["step", "left", "right", "height", "size"])?;
    for (i, m) in dendrogram.merges.iter().enumerate() {
        w.write_record([
            (i + 1).to_string(),
            m.left.to_string(),
            m.right.to_string(),
            fmt(m.height),
            m.size.to_string(),
        ])?;
    }
    w.flush()?;
    Ok(())
}

pub fn write_cell_types(path: &Path, types: &CellTypes) -> Result<(), Error> {
    let mut w = csv_writer(path)?;
    let mut header = vec!["cluster".to_string(), "label".to_string(), "delta".to_string()];
    header.extend(types.labels.iter().map(|l| format!("score_{l}")));
    w.write_record(&header)?;
    for (k, cluster) in types.clusters.iter().enumerate() {
        let mut row = vec![cluster.clone(), types.assigned[k].clone(), fmt_opt(types.delta[k])];
        row.extend(types.scores[k].iter().map(|&v| fmt(v)));
        w.write_record(&row)?;
    }
    w.flush()?;
    Ok(())
}

/// Write every table of `analysis` into `out_dir`, creating it if needed. Returns the files
/// written.
pub fn write_reports(out_dir: impl AsRef<Path>, analysis: &Analysis) -> Result<Vec<PathBuf>, Error> {
    let out_dir = out_dir.as_ref();
    create_dir_all(out_dir).with_context(|| out_dir.display().to_string())?;
    let ds = &analysis.dataset;
    let mut written = Vec::new();
    let mut path = |name: &str| {
        let p = out_dir.join(name);
        written.push(p.clone());
        p
    };

    write_qc_metrics(&path("qc_metrics.csv"), &analysis.qc)?;
    write_qc_thresholds(&path("qc_thresholds.csv"), &analysis.qc)?;
    write_size_factors(&path("size_factors.csv"), ds)?;
    write_gene_var(&path("gene_var.csv"), ds, &analysis.gene_var, &analysis.hvgs)?;
    write_embedding(&path("pca.csv"), ds, ds.require_embedding(PCA)?, "PC", &[])?;
    if let Some(corrected) = ds.embedding(CORRECTED) {
        write_embedding(&path("corrected.csv"), ds, corrected, "MNN", &[])?;
    }
    if let Some(umap) = ds.embedding(UMAP) {
        let extra: Vec<(&str, Vec<String>)> = [CLUSTER, BATCH, CELL_TYPE]
            .iter()
            .filter_map(|&name| cell_labels(ds, name).map(|v| (name, v)))
            .collect();
        write_embedding(&path("umap.csv"), ds, umap, "UMAP", &extra)?;
    }
    let labels = gene_labels(ds);
    for table in &analysis.markers {
        write_markers(&path(&format!("markers_{}.csv", table.cluster())), table, &labels)?;
    }
    if let Some(dendrogram) = &analysis.dendrogram {
        write_dendrogram(&path("cluster_centroid_dendrogram.csv"), dendrogram)?;
    }
    if let Some(types) = &analysis.cell_types {
        write_cell_types(&path("celltypes.csv"), types)?;
    }

    let summary_path = path("summary.json");
    let mut w = create_text(&summary_path)?;
    serde_json::to_writer_pretty(&mut w, &analysis.summary)?;
    writeln!(w)?;
    w.flush()?;

    info!("wrote {} report files to {}", written.len(), out_dir.display());
    Ok(written)
}
