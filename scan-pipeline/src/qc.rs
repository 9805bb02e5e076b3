//! Per-cell quality control by outlier detection.
//!
//! For each metric a cell is an outlier when it lies more than `nmads` scaled MADs from the
//! median of its batch: below it for total counts and detected genes (on log scale), above it
//! for the mitochondrial percentage. A cell is discarded iff it is an outlier for any metric.

use crate::error::{PipelineError, Stage};
use crate::stats::{mad, median};
use anyhow::{bail, Error};
use log::{info, warn};
use rayon::prelude::*;
use scan_types::{Column, Dataset, Factor};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Chromosome names treated as mitochondrial
pub const MITO_CHROMOSOMES: [&str; 4] = ["MT", "chrM", "M", "chrMT"];

/// Per-cell QC metric
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Metric {
    Sum,
    Detected,
    MitoPercent,
}

impl Metric {
    /// Cell-table column the metric is stored in
    pub fn column(&self) -> &'static str {
        match self {
            Metric::Sum => "sum",
            Metric::Detected => "detected",
            Metric::MitoPercent => "subsets_Mito_percent",
        }
    }

    fn log_scale(&self) -> bool {
        !matches!(self, Metric::MitoPercent)
    }

    fn lower_tail(&self) -> bool {
        !matches!(self, Metric::MitoPercent)
    }

    fn transform(&self, x: f64) -> f64 {
        if self.log_scale() {
            x.ln()
        } else {
            x
        }
    }

    fn untransform(&self, x: f64) -> f64 {
        if self.log_scale() {
            x.exp()
        } else {
            x
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// Lowest believable lower threshold per metric. A batch whose own threshold falls below these
/// is considered too damaged to define its own cutoffs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinPlausible {
    pub sum: f64,
    pub detected: f64,
}

impl Default for MinPlausible {
    fn default() -> Self {
        MinPlausible {
            sum: 100.0,
            detected: 50.0,
        }
    }
}

impl MinPlausible {
    fn get(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Sum => Some(self.sum),
            Metric::Detected => Some(self.detected),
            Metric::MitoPercent => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QcConfig {
    /// distance from the median, in scaled MADs, beyond which a cell is an outlier
    pub nmads: f64,
    /// test the mitochondrial percentage when mitochondrial genes can be identified
    pub use_mito: bool,
    /// explicit mitochondrial genes (ids or symbols); otherwise taken from the `chromosome`
    /// gene column
    pub mito_genes: Option<Vec<String>>,
    pub min_plausible: MinPlausible,
}

impl Default for QcConfig {
    fn default() -> Self {
        QcConfig {
            nmads: 3.0,
            use_mito: true,
            mito_genes: None,
            min_plausible: MinPlausible::default(),
        }
    }
}

/// Outlier bounds for one metric in one batch, on the metric's natural scale. Cells strictly
/// outside `[lower, upper]` are outliers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Threshold {
    pub batch: String,
    pub metric: Metric,
    pub lower: f64,
    pub upper: f64,
    /// the batch's own lower bound was implausible
    pub implausible: bool,
    /// bounds were computed from the plausible batches rather than this batch
    pub shared: bool,
}

impl Threshold {
    fn is_outlier(&self, value: f64) -> bool {
        let t = self.metric.transform(value);
        t < self.metric.transform(self.lower) || t > self.metric.transform(self.upper)
    }
}

/// Per-cell QC metrics
#[derive(Clone, Debug, PartialEq)]
pub struct QcMetrics {
    pub values: BTreeMap<Metric, Vec<f64>>,
}

impl QcMetrics {
    pub fn get(&self, metric: Metric) -> Option<&[f64]> {
        self.values.get(&metric).map(Vec::as_slice)
    }
}

/// Flags genes as mitochondrial from an explicit list or the `chromosome` gene column. Returns
/// `None` when no gene qualifies.
pub fn mito_genes(ds: &Dataset, explicit: Option<&[String]>) -> Option<Vec<bool>> {
    let flags: Vec<bool> = match explicit {
        Some(list) => {
            let symbols = ds.genes().text("symbol").ok();
            (0..ds.n_genes())
                .map(|g| {
                    let id = &ds.gene_ids()[g];
                    let sym = symbols.and_then(|s| s[g].as_deref());
                    list.iter().any(|m| m == id || Some(m.as_str()) == sym)
                })
                .collect()
        }
        None => {
            let chrom = ds.genes().text("chromosome").ok()?;
            chrom
                .iter()
                .map(|c| c.as_deref().is_some_and(|c| MITO_CHROMOSOMES.contains(&c)))
                .collect()
        }
    };
    flags.iter().any(|&f| f).then_some(flags)
}

/// Total count, detected genes and (if `mito` is given) mitochondrial percentage per cell
pub fn per_cell_metrics(ds: &Dataset, mito: Option<&[bool]>) -> QcMetrics {
    let counts = ds.counts();
    let per_cell: Vec<(f64, f64, f64)> = (0..ds.n_cells())
        .into_par_iter()
        .map(|c| {
            let col = counts.column(c);
            let sum: f64 = col.iter().map(|&(_, v)| v as f64).sum();
            let mt: f64 = match mito {
                Some(m) => col.iter().filter(|(g, _)| m[*g]).map(|&(_, v)| v as f64).sum(),
                None => 0.0,
            };
            let pct = if sum > 0.0 { 100.0 * mt / sum } else { 0.0 };
            (sum, col.len() as f64, pct)
        })
        .collect();

    let mut values = BTreeMap::new();
    values.insert(Metric::Sum, per_cell.iter().map(|v| v.0).collect());
    values.insert(Metric::Detected, per_cell.iter().map(|v| v.1).collect());
    if mito.is_some() {
        values.insert(Metric::MitoPercent, per_cell.iter().map(|v| v.2).collect());
    }
    QcMetrics { values }
}

/// Median +/- nmads * MAD on the metric's scale, converted back to its natural scale
fn bounds(metric: Metric, values: &[f64], nmads: f64) -> Option<(f64, f64)> {
    let t: Vec<f64> = values.iter().map(|&v| metric.transform(v)).collect();
    let med = median(&t)?;
    let spread = nmads * mad(&t, med)?;
    Some(if metric.lower_tail() {
        (metric.untransform(med - spread), f64::INFINITY)
    } else {
        (f64::NEG_INFINITY, metric.untransform(med + spread))
    })
}

/// Result of quality control: metrics, thresholds and per-cell discard decisions
#[derive(Clone, Debug)]
pub struct QcResult {
    barcodes: Vec<String>,
    metrics: QcMetrics,
    mito_ids: Option<Vec<String>>,
    batch: Factor,
    thresholds: Vec<Threshold>,
    outliers: BTreeMap<Metric, Vec<bool>>,
    discard: Vec<bool>,
}

impl QcResult {
    /// Barcodes of every cell tested, discarded ones included
    pub fn barcodes(&self) -> &[String] {
        &self.barcodes
    }

    /// Batch label of every cell tested
    pub fn batch(&self) -> &Factor {
        &self.batch
    }

    pub fn metrics(&self) -> &QcMetrics {
        &self.metrics
    }

    pub fn thresholds(&self) -> &[Threshold] {
        &self.thresholds
    }

    /// Outlier flags per metric
    pub fn outliers(&self) -> &BTreeMap<Metric, Vec<bool>> {
        &self.outliers
    }

    pub fn discard(&self) -> &[bool] {
        &self.discard
    }

    pub fn n_discarded(&self) -> usize {
        self.discard.iter().filter(|&&d| d).count()
    }

    /// Number of outliers per metric column name, plus the total under `discard`
    pub fn reasons(&self) -> BTreeMap<String, usize> {
        let mut r: BTreeMap<String, usize> = self
            .outliers
            .iter()
            .map(|(m, f)| (format!("low_or_high_{}", m.column()), f.iter().filter(|&&x| x).count()))
            .collect();
        r.insert("discard".to_string(), self.n_discarded());
        r
    }

    /// Batches whose own thresholds were implausible
    pub fn implausible_batches(&self) -> Vec<String> {
        self.thresholds
            .iter()
            .filter(|t| t.implausible)
            .map(|t| t.batch.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Attach the metric columns and a `discard` flag, then drop the discarded cells.
    pub fn apply(&self, ds: Dataset) -> Result<Dataset, Error> {
        if ds.n_cells() != self.discard.len() {
            bail!(
                "{}: QC result covers {} cells, dataset has {}",
                Stage::QualityControl,
                self.discard.len(),
                ds.n_cells()
            );
        }
        let mut ds = ds;
        for (metric, values) in &self.metrics.values {
            ds = ds.with_cell_column(metric.column(), Column::Num(values.clone()))?;
        }
        let ds = ds.with_cell_column("discard", Column::Bool(self.discard.clone()))?;
        let keep: Vec<bool> = self.discard.iter().map(|&d| !d).collect();
        let out = ds.retain_cells(&keep)?;
        if out.n_cells() == 0 {
            return Err(PipelineError::insufficient(
                Stage::QualityControl,
                format!("dataset '{}'", out.name()),
                "every cell was discarded",
            ));
        }
        Ok(out)
    }

    /// Discard flags for `ds` under the stored thresholds. Cells are matched to thresholds by
    /// the label of `batch`, which must use the same level names as the original run. Without
    /// `batch`, each cell takes the batch its barcode had when the thresholds were computed.
    pub fn recheck(&self, ds: &Dataset, batch: Option<&Factor>) -> Result<Vec<bool>, Error> {
        let mito = self.mito_ids.as_ref().map(|ids| {
            ds.gene_ids()
                .iter()
                .map(|g| ids.contains(g))
                .collect::<Vec<bool>>()
        });
        let metrics = per_cell_metrics(ds, mito.as_deref());
        let labels: Vec<String> = match batch {
            Some(b) if b.len() != ds.n_cells() => bail!("{} batch labels for {} cells", b.len(), ds.n_cells()),
            Some(b) => (0..b.len()).map(|i| b.label(i).to_string()).collect(),
            None => {
                let index: HashMap<&str, usize> =
                    self.barcodes.iter().enumerate().map(|(i, b)| (b.as_str(), i)).collect();
                ds.barcodes()
                    .iter()
                    .map(|barcode| match index.get(barcode.as_str()) {
                        Some(&i) => Ok(self.batch.label(i).to_string()),
                        None => bail!("{}: barcode {} was not part of the QC run", Stage::QualityControl, barcode),
                    })
                    .collect::<Result<_, Error>>()?
            }
        };
        let mut discard = vec![false; ds.n_cells()];
        for t in &self.thresholds {
            let Some(values) = metrics.get(t.metric) else { continue };
            for (i, d) in discard.iter_mut().enumerate() {
                if labels[i] == t.batch && t.is_outlier(values[i]) {
                    *d = true;
                }
            }
        }
        Ok(discard)
    }
}

/// Compute QC metrics and outlier thresholds, per batch when `batch` is given.
///
/// Two-pass policy: a batch whose lower threshold for total counts or detected genes falls below
/// the configured plausibility floor is marked implausible; thresholds for that metric are then
/// recomputed from the cells of the plausible batches only and applied to every batch.
pub fn quality_control(ds: &Dataset, cfg: &QcConfig, batch: Option<&Factor>) -> Result<QcResult, Error> {
    if ds.n_cells() == 0 {
        return Err(PipelineError::insufficient(
            Stage::QualityControl,
            format!("dataset '{}'", ds.name()),
            "no cells",
        ));
    }
    let batch = match batch {
        Some(b) if b.len() != ds.n_cells() => bail!("{} batch labels for {} cells", b.len(), ds.n_cells()),
        Some(b) => b.clone().drop_unused_levels(),
        None => Factor::from_labels(&vec!["all"; ds.n_cells()]),
    };
    let mito = if cfg.use_mito {
        let m = mito_genes(ds, cfg.mito_genes.as_deref());
        if m.is_none() {
            info!("{}: no mitochondrial genes identified, skipping that metric", Stage::QualityControl);
        }
        m
    } else {
        None
    };
    let metrics = per_cell_metrics(ds, mito.as_deref());
    let mito_ids = mito.as_ref().map(|m| {
        ds.gene_ids()
            .iter()
            .zip(m)
            .filter(|&(_, &f)| f)
            .map(|(g, _)| g.clone())
            .collect()
    });
    let groups = batch.groups();

    let mut thresholds = Vec::new();
    let mut outliers = BTreeMap::new();
    for (&metric, values) in &metrics.values {
        let mut per_batch = Vec::with_capacity(groups.len());
        for (b, cells) in groups.iter().enumerate() {
            let v: Vec<f64> = cells.iter().map(|&c| values[c]).collect();
            let Some((lower, upper)) = bounds(metric, &v, cfg.nmads) else {
                continue;
            };
            let implausible = cfg.min_plausible.get(metric).is_some_and(|floor| lower < floor);
            per_batch.push(Threshold {
                batch: batch.levels()[b].clone(),
                metric,
                lower,
                upper,
                implausible,
                shared: false,
            });
        }

        let n_bad = per_batch.iter().filter(|t| t.implausible).count();
        if n_bad > 0 && n_bad < per_batch.len() {
            let good: Vec<f64> = per_batch
                .iter()
                .filter(|t| !t.implausible)
                .filter_map(|t| batch.level_index(&t.batch))
                .flat_map(|b| groups[b].iter().map(|&c| values[c]))
                .collect();
            if let Some((lower, upper)) = bounds(metric, &good, cfg.nmads) {
                warn!(
                    "{}: {} of {} batches have implausible {} thresholds; using {:.3} from the others",
                    Stage::QualityControl,
                    n_bad,
                    per_batch.len(),
                    metric,
                    lower
                );
                for t in per_batch.iter_mut() {
                    t.lower = lower;
                    t.upper = upper;
                    t.shared = true;
                }
            }
        } else if n_bad > 0 {
            warn!(
                "{}: every batch has an implausible {} threshold; keeping per-batch thresholds",
                Stage::QualityControl,
                metric
            );
        }

        let mut flags = vec![false; ds.n_cells()];
        for t in &per_batch {
            if let Some(b) = batch.level_index(&t.batch) {
                for &c in &groups[b] {
                    flags[c] = t.is_outlier(values[c]);
                }
            }
        }
        outliers.insert(metric, flags);
        thresholds.extend(per_batch);
    }

    let discard: Vec<bool> = (0..ds.n_cells())
        .map(|c| outliers.values().any(|f: &Vec<bool>| f[c]))
        .collect();

    let result = QcResult {
        barcodes: ds.barcodes().to_vec(),
        metrics,
        mito_ids,
        batch,
        thresholds,
        outliers,
        discard,
    };
    info!(
        "{}: discarding {} of {} cells {:?}",
        Stage::QualityControl,
        result.n_discarded(),
        ds.n_cells(),
        result.reasons()
    );
    Ok(result)
}

#[cfg(test)]
mod test {
    use super::*;
    use scan_types::{CountMatrix, Table, BATCH};

    /// `n` cells with totals around 1000 spread over 20 genes, plus a few damaged cells.
    /// Gene 0 is mitochondrial.
    fn dataset(totals: &[u32], mito: &[u32], batches: &[&str]) -> Dataset {
        let columns = totals
            .iter()
            .zip(mito)
            .map(|(&t, &m)| {
                let mut col: Vec<(usize, u32)> = (1..20).map(|g| (g, t / 19)).filter(|&(_, v)| v > 0).collect();
                if m > 0 {
                    col.push((0, m));
                }
                col
            })
            .collect();
        let counts = CountMatrix::from_columns(20, columns).unwrap();
        let genes = Table::new((0..20).map(|g| format!("G{g}")).collect())
            .with_column(
                "chromosome",
                Column::Str((0..20).map(|g| Some(if g == 0 { "MT" } else { "1" }.to_string())).collect()),
            )
            .unwrap();
        let cells = Table::new((0..totals.len()).map(|c| format!("C{c}")).collect())
            .with_column(BATCH, Column::Factor(Factor::from_labels(batches)))
            .unwrap();
        Dataset::new("qc", counts, genes, cells).unwrap()
    }

    fn spread(n: usize, base: u32, step: u32) -> Vec<u32> {
        (0..n).map(|i| base + step * (i as u32 % 7)).collect()
    }

    #[test]
    fn test_discard_iff_any_outlier() {
        let mut totals = spread(30, 1900, 38);
        totals[3] = 190; // low library
        let mut mito = vec![20; 30];
        mito[3] = 2;
        mito[7] = 900; // high mito
        let ds = dataset(&totals, &mito, &vec!["a"; 30]);
        let cfg = QcConfig::default();
        let qc = quality_control(&ds, &cfg, None).unwrap();
        for c in 0..30 {
            let any = qc.outliers().values().any(|f| f[c]);
            assert_eq!(qc.discard()[c], any, "cell {c}");
        }
        assert!(qc.discard()[3]);
        assert!(qc.discard()[7]);
        assert_eq!(qc.n_discarded(), 2);
        assert_eq!(qc.reasons()["discard"], 2);
        assert_eq!(qc.reasons()["low_or_high_subsets_Mito_percent"], 1);

        let filtered = qc.apply(ds.clone()).unwrap();
        assert_eq!(filtered.n_cells(), 28);
        assert_eq!(filtered.cells().num("sum").unwrap().len(), 28);

        // idempotent under fixed thresholds
        assert!(qc.recheck(&filtered, None).unwrap().iter().all(|&d| !d));
    }

    #[test]
    fn test_batches_get_own_thresholds() {
        // batch b is sequenced 4x shallower; per-batch thresholds keep all its cells
        let mut totals = spread(20, 1900, 38);
        totals.extend(spread(20, 475, 10));
        let batches: Vec<&str> = (0..40).map(|i| if i < 20 { "a" } else { "b" }).collect();
        let ds = dataset(&totals, &vec![10; 40], &batches);
        let batch = ds.cells().factor(BATCH).unwrap();
        let qc = quality_control(&ds, &QcConfig::default(), Some(&batch)).unwrap();
        assert_eq!(qc.n_discarded(), 0);
        // batch b's cells would fail batch a's thresholds; recheck looks each cell's batch up
        assert!(qc.recheck(&ds, None).unwrap().iter().all(|&d| !d));
        assert!(qc.recheck(&ds, Some(&batch)).unwrap().iter().all(|&d| !d));
        let pooled = quality_control(&ds, &QcConfig { use_mito: false, ..QcConfig::default() }, None).unwrap();
        assert_eq!(pooled.thresholds().len(), 2);
    }

    #[test]
    fn test_implausible_batch_uses_shared_threshold() {
        // batch "bad" is mostly damaged: its own lower bound for the total falls below 100
        let mut totals = spread(20, 1900, 38);
        totals.extend([40, 60, 80, 1900, 2000, 50, 70, 1950, 45, 65]);
        let batches: Vec<&str> = (0..30).map(|i| if i < 20 { "good" } else { "bad" }).collect();
        let ds = dataset(&totals, &vec![10; 30], &batches);
        let batch = ds.cells().factor(BATCH).unwrap();
        let cfg = QcConfig {
            use_mito: false,
            min_plausible: MinPlausible {
                sum: 100.0,
                detected: 10.0,
            },
            ..QcConfig::default()
        };
        let qc = quality_control(&ds, &cfg, Some(&batch)).unwrap();
        assert_eq!(qc.implausible_batches(), vec!["bad".to_string()]);
        let sum_t: Vec<&Threshold> = qc.thresholds().iter().filter(|t| t.metric == Metric::Sum).collect();
        assert!(sum_t.iter().all(|t| t.shared));
        assert_eq!(sum_t[0].lower, sum_t[1].lower);
        // the damaged cells of the bad batch go, its healthy cells stay
        for c in 20..30 {
            assert_eq!(qc.discard()[c], totals[c] < 1000, "cell {c}");
        }

        // a lower floor keeps per-batch thresholds
        let lenient = QcConfig {
            use_mito: false,
            min_plausible: MinPlausible { sum: 1.0, detected: 1.0 },
            ..QcConfig::default()
        };
        let qc = quality_control(&ds, &lenient, Some(&batch)).unwrap();
        assert!(qc.implausible_batches().is_empty());
        assert!(qc.thresholds().iter().all(|t| !t.shared));
    }

    #[test]
    fn test_everything_discarded_is_an_error() {
        let ds = dataset(&[1000, 1000], &[0, 0], &["a", "a"]);
        let qc = QcResult {
            barcodes: ds.barcodes().to_vec(),
            metrics: per_cell_metrics(&ds, None),
            mito_ids: None,
            batch: Factor::from_labels(&["all", "all"]),
            thresholds: Vec::new(),
            outliers: BTreeMap::new(),
            discard: vec![true, true],
        };
        let err = qc.apply(ds).unwrap_err();
        assert!(err.downcast_ref::<PipelineError>().is_some());
    }
}
