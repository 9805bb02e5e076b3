//! Cluster-level cell-type annotation against a labelled reference of expression profiles.
//!
//! Each cluster's raw counts are summed into a pseudo-bulk profile and log-CPM transformed.
//! Against every reference profile the Spearman correlation over the shared (and optionally
//! label-discriminating) genes is computed; a label's score is a high quantile of the
//! correlations with its profiles, and the best-scoring label is assigned.

use crate::error::{PipelineError, Stage};
use crate::mtx::{create_text, open_text};
use crate::source::tsv_reader;
use crate::stats::{median, quantile, spearman};
use anyhow::{bail, Context, Error};
use log::{info, warn};
use ndarray::{Array2, Axis};
use noisy_float::types::n64;
use rayon::prelude::*;
use scan_types::{Column, Dataset, Factor};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Write};
use std::path::Path;

/// Cell column holding the assigned type
pub const CELL_TYPE: &str = "cell_type";

/// Labelled reference profiles, genes x profiles. A label may own several profiles.
#[derive(Clone, Debug, PartialEq)]
pub struct Reference {
    genes: Vec<String>,
    labels: Vec<String>,
    profiles: Array2<f64>,
}

impl Reference {
    pub fn new(genes: Vec<String>, labels: Vec<String>, profiles: Array2<f64>) -> Result<Reference, Error> {
        if profiles.dim() != (genes.len(), labels.len()) {
            bail!(
                "reference profiles are {:?} but there are {} genes and {} labels",
                profiles.dim(),
                genes.len(),
                labels.len()
            );
        }
        if labels.is_empty() {
            bail!("reference has no profiles");
        }
        if let Some(((g, c), v)) = profiles.indexed_iter().find(|(_, v)| !v.is_finite()) {
            bail!("reference value for gene {} in profile '{}' is not finite: {}", genes[g], labels[c], v);
        }
        Ok(Reference {
            genes,
            labels,
            profiles,
        })
    }

    /// Read a TSV whose header is `gene` followed by one label per profile column
    pub fn from_path(path: impl AsRef<Path>) -> Result<Reference, Error> {
        let path = path.as_ref();
        Self::from_reader(open_text(path)?).with_context(|| path.display().to_string())
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Reference, Error> {
        let mut reader = tsv_reader(reader, true);
        let headers = reader.headers()?.clone();
        let labels: Vec<String> = headers.iter().skip(1).map(str::to_string).collect();
        let mut genes = Vec::new();
        let mut values = Vec::new();
        for (line, rec) in reader.records().enumerate() {
            let rec = rec?;
            if rec.len() != labels.len() + 1 {
                bail!("reference line {}: {} fields, expected {}", line + 2, rec.len(), labels.len() + 1);
            }
            genes.push(rec[0].to_string());
            for (col, field) in rec.iter().enumerate().skip(1) {
                let v: f64 = field
                    .parse()
                    .with_context(|| format!("reference line {} column {}: bad value '{}'", line + 2, col + 1, field))?;
                if !v.is_finite() {
                    bail!("reference line {} column {}: value '{}' is not finite", line + 2, col + 1, field);
                }
                values.push(v);
            }
        }
        let profiles = Array2::from_shape_vec((genes.len(), labels.len()), values)?;
        Reference::new(genes, labels, profiles)
    }

    /// Write in the layout [`Reference::from_path`] reads
    pub fn write_path(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let mut w = create_text(path)?;
        write!(w, "gene")?;
        for label in &self.labels {
            write!(w, "\t{label}")?;
        }
        writeln!(w)?;
        for (g, gene) in self.genes.iter().enumerate() {
            write!(w, "{gene}")?;
            for v in self.profiles.row(g) {
                write!(w, "\t{v}")?;
            }
            writeln!(w)?;
        }
        w.flush()?;
        Ok(())
    }

    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    /// Distinct labels in order of first appearance
    pub fn label_names(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.labels.iter().filter(|l| seen.insert(l.as_str())).cloned().collect()
    }

    pub fn n_profiles(&self) -> usize {
        self.labels.len()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifyConfig {
    /// quantile of per-profile correlations used as a label's score
    pub quantile: f64,
    /// restrict to the top genes distinguishing each pair of labels; all shared genes if unset
    pub de_genes: Option<usize>,
    /// fail when fewer genes are shared with the reference
    pub min_common_genes: usize,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        ClassifyConfig {
            quantile: 0.8,
            de_genes: Some(500),
            min_common_genes: 5,
        }
    }
}

/// Scores and assignments per cluster
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CellTypes {
    pub clusters: Vec<String>,
    pub labels: Vec<String>,
    /// clusters x labels
    pub scores: Vec<Vec<f64>>,
    pub assigned: Vec<String>,
    /// best minus second-best score; absent with a single label
    pub delta: Vec<Option<f64>>,
    pub n_genes: usize,
}

/// Summed counts per group, log2(CPM + 1), genes x groups
pub fn pseudo_bulk_log_cpm(ds: &Dataset, groups: &[Vec<usize>]) -> Array2<f64> {
    let mut bulk = ds.counts().sum_by_group(groups);
    bulk.axis_iter_mut(Axis(1)).into_par_iter().for_each(|mut col| {
        let total = col.sum();
        if total > 0.0 {
            col.mapv_inplace(|v| (v / total * 1e6 + 1.0).log2());
        }
    });
    bulk
}

/// `(dataset gene, reference gene)` pairs, matched by id and then by symbol
fn match_genes(ds: &Dataset, reference: &Reference) -> Vec<(usize, usize)> {
    let by_id: HashMap<&str, usize> = ds.gene_ids().iter().enumerate().map(|(i, g)| (g.as_str(), i)).collect();
    let by_symbol: HashMap<&str, usize> = match ds.genes().text("symbol") {
        Ok(symbols) => symbols
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_deref().map(|s| (s, i)))
            .collect(),
        Err(_) => HashMap::new(),
    };
    let mut used = BTreeSet::new();
    let mut pairs = Vec::new();
    for (r, gene) in reference.genes.iter().enumerate() {
        let hit = by_id.get(gene.as_str()).or_else(|| by_symbol.get(gene.as_str()));
        if let Some(&d) = hit {
            if used.insert(d) {
                pairs.push((d, r));
            }
        }
    }
    pairs
}

/// Genes (positions in `rows`) with the largest median difference for each ordered pair of
/// labels, `n` per pair, union over pairs.
fn de_genes(reference: &Reference, rows: &[usize], n: usize) -> Vec<usize> {
    let names = reference.label_names();
    let medians: Vec<Vec<f64>> = names
        .iter()
        .map(|name| {
            let cols: Vec<usize> = (0..reference.labels.len()).filter(|&c| &reference.labels[c] == name).collect();
            rows.iter()
                .map(|&r| {
                    let v: Vec<f64> = cols.iter().map(|&c| reference.profiles[[r, c]]).collect();
                    median(&v).unwrap_or(0.0)
                })
                .collect()
        })
        .collect();
    let mut keep = BTreeSet::new();
    for a in 0..names.len() {
        for b in 0..names.len() {
            if a == b {
                continue;
            }
            let mut diff: Vec<(usize, f64)> = (0..rows.len()).map(|i| (i, medians[a][i] - medians[b][i])).collect();
            diff.sort_by_key(|&(i, d)| (Reverse(n64(d)), i));
            keep.extend(diff.iter().take(n).filter(|&&(_, d)| d > 0.0).map(|&(i, _)| i));
        }
    }
    keep.into_iter().collect()
}

/// Annotate every level of `clusters` with a reference label and attach the `cell_type` column.
pub fn classify_clusters(
    ds: Dataset,
    clusters: &Factor,
    reference: &Reference,
    cfg: &ClassifyConfig,
) -> Result<(Dataset, CellTypes), Error> {
    let pairs = match_genes(&ds, reference);
    if pairs.len() < cfg.min_common_genes.max(2) {
        return Err(PipelineError::insufficient(
            Stage::CellTypes,
            "reference",
            format!("{} genes shared with the dataset", pairs.len()),
        ));
    }
    let ref_rows: Vec<usize> = pairs.iter().map(|&(_, r)| r).collect();
    let chosen: Vec<usize> = match cfg.de_genes {
        Some(n) if reference.label_names().len() > 1 => de_genes(reference, &ref_rows, n),
        _ => (0..pairs.len()).collect(),
    };
    if chosen.len() < 2 {
        return Err(PipelineError::insufficient(
            Stage::CellTypes,
            "reference",
            format!("{} informative genes", chosen.len()),
        ));
    }

    let groups = clusters.groups();
    let bulk = pseudo_bulk_log_cpm(&ds, &groups);
    let names = reference.label_names();
    let profiles: Vec<Vec<f64>> = (0..reference.n_profiles())
        .map(|c| chosen.iter().map(|&i| reference.profiles[[pairs[i].1, c]]).collect())
        .collect();

    let scores: Vec<Vec<f64>> = (0..groups.len())
        .into_par_iter()
        .map(|k| {
            let query: Vec<f64> = chosen.iter().map(|&i| bulk[[pairs[i].0, k]]).collect();
            names
                .iter()
                .map(|name| {
                    let rho: Vec<f64> = profiles
                        .iter()
                        .zip(&reference.labels)
                        .filter(|(_, l)| *l == name)
                        .map(|(p, _)| spearman(&query, p))
                        .collect();
                    quantile(&rho, cfg.quantile).unwrap_or(f64::NAN)
                })
                .collect()
        })
        .collect();

    let mut assigned = Vec::with_capacity(groups.len());
    let mut delta = Vec::with_capacity(groups.len());
    for (k, row) in scores.iter().enumerate() {
        let mut order: Vec<usize> = (0..row.len()).collect();
        order.sort_by_key(|&l| (Reverse(n64(row[l])), l));
        assigned.push(names[order[0]].clone());
        delta.push(order.get(1).map(|&second| row[order[0]] - row[second]));
        if groups[k].is_empty() {
            warn!("{}: cluster '{}' has no cells", Stage::CellTypes, clusters.levels()[k]);
        }
    }
    info!(
        "{}: {} clusters annotated over {} genes: {:?}",
        Stage::CellTypes,
        groups.len(),
        chosen.len(),
        assigned
    );

    let column = (0..ds.n_cells())
        .map(|c| Some(assigned[clusters.code(c)].clone()))
        .collect();
    let ds = ds.with_cell_column(CELL_TYPE, Column::Str(column))?;
    Ok((
        ds,
        CellTypes {
            clusters: clusters.levels().to_vec(),
            labels: names,
            scores,
            assigned,
            delta,
            n_genes: chosen.len(),
        },
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::simulate::{Simulated, TRUTH};

    #[test]
    fn test_reference_tsv() {
        let text = "gene\tB\tB\tT\ng1\t1.0\t1.5\t0\ng2\t0\t0.2\t3\n";
        let r = Reference::from_reader(text.as_bytes()).unwrap();
        assert_eq!(r.genes(), &["g1", "g2"]);
        assert_eq!(r.label_names(), vec!["B", "T"]);
        assert_eq!(r.n_profiles(), 3);
        assert!(Reference::from_reader("gene\tB\ng1\tx\n".as_bytes()).is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.tsv.gz");
        r.write_path(&path).unwrap();
        assert_eq!(Reference::from_path(&path).unwrap(), r);
        assert!(Reference::from_reader("gene\tB\ng1\t1\t2\n".as_bytes()).is_err());
    }

    #[test]
    fn test_reference_rejects_non_finite_values() {
        for bad in ["NaN", "inf", "-inf"] {
            let text = format!("gene\tB\tT\ng1\t1\t2\ng2\t3\t{bad}\n");
            let err = Reference::from_reader(text.as_bytes()).unwrap_err();
            assert!(err.to_string().contains("line 3 column 3"), "{err:#}");
        }
        let profiles = Array2::from_shape_vec((1, 2), vec![1.0, f64::NAN]).unwrap();
        assert!(Reference::new(vec!["g1".into()], vec!["B".into(), "T".into()], profiles).is_err());
    }

    #[test]
    fn test_simulated_types_recovered() {
        let sim = Simulated::default();
        let ds = sim.simulate("ct").unwrap();
        let truth = ds.cells().factor(TRUTH).unwrap();
        let reference = sim.reference(3).unwrap();
        for de in [Some(500), None] {
            let cfg = ClassifyConfig {
                de_genes: de,
                ..ClassifyConfig::default()
            };
            let (out, types) = classify_clusters(ds.clone(), &truth, &reference, &cfg).unwrap();
            assert_eq!(types.assigned, truth.levels().to_vec());
            assert!(types.delta.iter().all(|d| d.unwrap() > 0.0));
            assert_eq!(out.cells().text(CELL_TYPE).unwrap()[0].as_deref(), Some(truth.label(0)));
        }
    }

    #[test]
    fn test_matching_by_symbol() {
        let sim = Simulated::default();
        let ds = sim.simulate("ct").unwrap();
        let truth = ds.cells().factor(TRUTH).unwrap();
        let by_id = sim.reference(1).unwrap();
        let symbols = sim.gene_symbols();
        let reference = Reference::new(symbols, by_id.labels.clone(), by_id.profiles.clone()).unwrap();
        let (_, types) = classify_clusters(ds, &truth, &reference, &ClassifyConfig::default()).unwrap();
        assert_eq!(types.assigned, vec!["type1", "type2"]);
    }

    #[test]
    fn test_no_shared_genes() {
        let sim = Simulated::default();
        let ds = sim.simulate("ct").unwrap();
        let truth = ds.cells().factor(TRUTH).unwrap();
        let reference = Reference::new(vec!["x".into(), "y".into()], vec!["a".into()], Array2::zeros((2, 1))).unwrap();
        let err = classify_clusters(ds, &truth, &reference, &ClassifyConfig::default()).unwrap_err();
        assert!(err.downcast_ref::<PipelineError>().is_some());
    }
}
