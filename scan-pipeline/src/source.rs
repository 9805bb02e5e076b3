//! Where datasets and gene annotations come from.

use crate::error::Stage;
use crate::mtx::{create_text, load_mtx, open_text, write_mtx};
use anyhow::{bail, Context, Error};
use log::info;
use scan_types::{Column, Dataset, Factor, Table, BATCH};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Provides datasets by identifier
pub trait DatasetSource {
    /// Load the dataset called `id`
    fn load(&self, id: &str) -> Result<Dataset, Error>;
}

/// Datasets stored as 10x-style MTX directories under a common root. `load("")` reads the root
/// itself, `load("x")` reads `root/x`.
///
/// A directory holds `matrix.mtx`, `genes.tsv` (or `features.tsv`: gene id, optional symbol)
/// and either `cells.tsv` (header line, barcode then metadata columns) or `barcodes.tsv`
/// (barcodes only). Any of these may be gzipped.
#[derive(Clone, Debug)]
pub struct MtxSource {
    root: PathBuf,
}

impl MtxSource {
    pub fn new(root: impl Into<PathBuf>) -> MtxSource {
        MtxSource { root: root.into() }
    }
}

fn find_file(dir: &Path, stems: &[&str]) -> Option<PathBuf> {
    stems
        .iter()
        .flat_map(|s| [dir.join(s), dir.join(format!("{s}.gz"))])
        .find(|p| p.exists())
}

pub(crate) fn tsv_reader<R: Read>(reader: R, has_headers: bool) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(has_headers)
        .flexible(true)
        .from_reader(reader)
}

fn read_genes(path: &Path) -> Result<Table, Error> {
    let mut ids = Vec::new();
    let mut symbols = Vec::new();
    for (i, rec) in tsv_reader(open_text(path)?, false).records().enumerate() {
        let rec = rec.with_context(|| format!("{}: row {}", path.display(), i + 1))?;
        let Some(id) = rec.get(0).filter(|s| !s.is_empty()) else {
            bail!("{}: row {} has no gene id", path.display(), i + 1);
        };
        ids.push(id.to_string());
        symbols.push(rec.get(1).filter(|s| !s.is_empty()).map(str::to_string));
    }
    let table = Table::new(ids);
    if symbols.iter().any(Option::is_some) {
        table.with_column("symbol", Column::Str(symbols))
    } else {
        Ok(table)
    }
}

/// Metadata values become numbers when every entry parses, otherwise text. The batch column
/// is always categorical.
fn metadata_column(name: &str, values: Vec<String>) -> Column {
    if name == BATCH {
        return Column::Factor(Factor::from_labels(&values));
    }
    let nums: Option<Vec<f64>> = values.iter().map(|v| v.parse::<f64>().ok()).collect();
    match nums {
        Some(n) if !n.is_empty() => Column::Num(n),
        _ => Column::Str(
            values
                .into_iter()
                .map(|v| if v.is_empty() || v == "NA" { None } else { Some(v) })
                .collect(),
        ),
    }
}

fn read_cells(path: &Path, has_header: bool) -> Result<Table, Error> {
    let mut reader = tsv_reader(open_text(path)?, has_header);
    let names: Vec<String> = if has_header {
        reader.headers()?.iter().skip(1).map(str::to_string).collect()
    } else {
        Vec::new()
    };
    let mut ids = Vec::new();
    let mut values = vec![Vec::new(); names.len()];
    for (i, rec) in reader.records().enumerate() {
        let rec = rec.with_context(|| format!("{}: row {}", path.display(), i + 1))?;
        let Some(barcode) = rec.get(0).filter(|s| !s.is_empty()) else {
            bail!("{}: row {} has no barcode", path.display(), i + 1);
        };
        ids.push(barcode.to_string());
        for (j, col) in values.iter_mut().enumerate() {
            col.push(rec.get(j + 1).unwrap_or("").to_string());
        }
    }
    let mut table = Table::new(ids);
    for (name, vals) in names.into_iter().zip(values) {
        let column = metadata_column(&name, vals);
        table = table.with_column(name, column)?;
    }
    Ok(table)
}

impl DatasetSource for MtxSource {
    fn load(&self, id: &str) -> Result<Dataset, Error> {
        let dir = if id.is_empty() { self.root.clone() } else { self.root.join(id) };
        let context = || format!("{}: loading {}", Stage::Loader, dir.display());

        let Some(matrix) = find_file(&dir, &["matrix.mtx"]) else {
            bail!("{}: no matrix.mtx in {}", Stage::Loader, dir.display());
        };
        let Some(genes) = find_file(&dir, &["genes.tsv", "features.tsv"]) else {
            bail!("{}: no genes.tsv or features.tsv in {}", Stage::Loader, dir.display());
        };
        let cells = match find_file(&dir, &["cells.tsv"]) {
            Some(p) => read_cells(&p, true).with_context(context)?,
            None => match find_file(&dir, &["barcodes.tsv"]) {
                Some(p) => read_cells(&p, false).with_context(context)?,
                None => bail!("{}: no cells.tsv or barcodes.tsv in {}", Stage::Loader, dir.display()),
            },
        };
        let counts = load_mtx(&matrix).with_context(context)?;
        let genes = read_genes(&genes).with_context(context)?;
        let name = if id.is_empty() {
            dir.file_name().map_or_else(|| "dataset".to_string(), |n| n.to_string_lossy().into_owned())
        } else {
            id.to_string()
        };
        let ds = Dataset::new(name, counts, genes, cells).with_context(context)?;
        info!(
            "{}: loaded '{}' with {} genes x {} cells ({} non-zeros)",
            Stage::Loader,
            ds.name(),
            ds.n_genes(),
            ds.n_cells(),
            ds.counts().nnz()
        );
        Ok(ds)
    }
}

/// Write `ds` as a gzipped MTX directory that [`MtxSource`] reads back: `matrix.mtx.gz`,
/// `genes.tsv.gz` (id and symbol when known) and `cells.tsv.gz` with a header and every cell
/// column.
pub fn write_mtx_dir(dir: impl AsRef<Path>, ds: &Dataset) -> Result<(), Error> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir).with_context(|| dir.display().to_string())?;
    write_mtx(dir.join("matrix.mtx.gz"), ds.counts())?;

    let symbols = ds.genes().text("symbol").ok();
    let mut w = create_text(dir.join("genes.tsv.gz"))?;
    for (g, id) in ds.gene_ids().iter().enumerate() {
        match symbols.and_then(|s| s[g].as_deref()) {
            Some(sym) => writeln!(w, "{id}\t{sym}")?,
            None => writeln!(w, "{id}")?,
        }
    }
    w.flush()?;

    let columns: Vec<(&str, &Column)> = ds.cells().columns().collect();
    let mut w = create_text(dir.join("cells.tsv.gz"))?;
    write!(w, "barcode")?;
    for (name, _) in &columns {
        write!(w, "\t{name}")?;
    }
    writeln!(w)?;
    for (i, barcode) in ds.barcodes().iter().enumerate() {
        write!(w, "{barcode}")?;
        for (_, column) in &columns {
            write!(w, "\t{}", column.render(i))?;
        }
        writeln!(w)?;
    }
    w.flush()?;
    info!(
        "wrote '{}' ({} genes x {} cells) to {}",
        ds.name(),
        ds.n_genes(),
        ds.n_cells(),
        dir.display()
    );
    Ok(())
}

/// What an annotation source knows about one gene
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GeneAnnotation {
    pub symbol: Option<String>,
    pub chromosome: Option<String>,
}

/// Gene annotation lookup keyed by gene id
pub trait AnnotationSource {
    /// Annotation for `key`, `None` if the source doesn't know it
    fn lookup(&self, key: &str) -> Option<GeneAnnotation>;
}

impl AnnotationSource for HashMap<String, GeneAnnotation> {
    fn lookup(&self, key: &str) -> Option<GeneAnnotation> {
        self.get(key).cloned()
    }
}

/// Annotation table read from a TSV with a header naming `gene_id`, `symbol` and `chromosome`
/// columns (the latter two optional).
#[derive(Clone, Debug, Default)]
pub struct TsvAnnotation {
    by_id: HashMap<String, GeneAnnotation>,
}

impl TsvAnnotation {
    pub fn from_path(path: impl AsRef<Path>) -> Result<TsvAnnotation, Error> {
        let path = path.as_ref();
        Self::from_reader(open_text(path)?).with_context(|| path.display().to_string())
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<TsvAnnotation, Error> {
        let mut reader = tsv_reader(reader, true);
        let headers = reader.headers()?.clone();
        let position = |name: &str| headers.iter().position(|h| h == name);
        let Some(id_col) = position("gene_id") else {
            bail!("annotation table has no 'gene_id' column (have {:?})", headers);
        };
        let symbol_col = position("symbol");
        let chrom_col = position("chromosome");
        let field = |rec: &csv::StringRecord, col: Option<usize>| {
            col.and_then(|c| rec.get(c))
                .filter(|s| !s.is_empty() && *s != "NA")
                .map(str::to_string)
        };

        let mut by_id = HashMap::new();
        for rec in reader.records() {
            let rec = rec?;
            let Some(id) = rec.get(id_col) else { continue };
            by_id.insert(
                id.to_string(),
                GeneAnnotation {
                    symbol: field(&rec, symbol_col),
                    chromosome: field(&rec, chrom_col),
                },
            );
        }
        Ok(TsvAnnotation { by_id })
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl AnnotationSource for TsvAnnotation {
    fn lookup(&self, key: &str) -> Option<GeneAnnotation> {
        self.by_id.get(key).cloned()
    }
}

/// Attach `symbol` and `chromosome` gene columns. Genes the source doesn't know keep any symbol
/// they were loaded with and get a missing chromosome; misses are counted, never fatal.
pub fn annotate(ds: Dataset, source: &dyn AnnotationSource) -> Result<Dataset, Error> {
    let existing: Vec<Option<String>> = match ds.genes().text("symbol") {
        Ok(s) => s.to_vec(),
        Err(_) => vec![None; ds.n_genes()],
    };
    let mut symbols = Vec::with_capacity(ds.n_genes());
    let mut chromosomes = Vec::with_capacity(ds.n_genes());
    let mut misses = 0;
    for (id, old) in ds.gene_ids().iter().zip(existing) {
        match source.lookup(id) {
            Some(a) => {
                symbols.push(a.symbol.or(old));
                chromosomes.push(a.chromosome);
            }
            None => {
                misses += 1;
                symbols.push(old);
                chromosomes.push(None);
            }
        }
    }
    info!(
        "{}: annotated {} of {} genes ({} not found)",
        Stage::Annotator,
        ds.n_genes() - misses,
        ds.n_genes(),
        misses
    );
    ds.with_gene_column("symbol", Column::Str(symbols))?
        .with_gene_column("chromosome", Column::Str(chromosomes))
}

/// Human-readable unique row names: the symbol when it is present and unique, `symbol_id` when
/// the symbol is shared by several genes, and the id when the symbol is missing.
pub fn uniquify_symbols(ids: &[String], symbols: &[Option<String>]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut dup = HashSet::new();
    for s in symbols.iter().flatten() {
        if !seen.insert(s.as_str()) {
            dup.insert(s.as_str());
        }
    }
    ids.iter()
        .zip(symbols)
        .map(|(id, sym)| match sym {
            Some(s) if dup.contains(s.as_str()) => format!("{s}_{id}"),
            Some(s) => s.clone(),
            None => id.clone(),
        })
        .collect()
}

/// Unique display names of the dataset's genes, from the `symbol` column when there is one
pub fn gene_labels(ds: &Dataset) -> Vec<String> {
    match ds.genes().text("symbol") {
        Ok(symbols) => uniquify_symbols(ds.gene_ids(), symbols),
        Err(_) => ds.gene_ids().to_vec(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mtx::write_mtx;
    use ndarray::{array, Array2};
    use scan_types::CountMatrix;
    use std::io::Write;

    fn write_dir(dir: &Path, cells_header: bool) {
        let dense: Array2<u32> = array![[1, 0, 2], [0, 5, 1]];
        write_mtx(dir.join("matrix.mtx.gz"), &CountMatrix::from_dense(dense.view())).unwrap();
        std::fs::write(dir.join("genes.tsv"), "ENSG1\tMT-CO1\nENSG2\t\n").unwrap();
        if cells_header {
            let mut f = std::fs::File::create(dir.join("cells.tsv")).unwrap();
            writeln!(f, "barcode\tbatch\tdepth\tnote").unwrap();
            writeln!(f, "AAAC-1\tb1\t1.5\tx").unwrap();
            writeln!(f, "AAAG-1\tb2\t2\tNA").unwrap();
            writeln!(f, "AAAT-1\tb1\t3\ty").unwrap();
        } else {
            std::fs::write(dir.join("barcodes.tsv"), "AAAC-1\nAAAG-1\nAAAT-1\n").unwrap();
        }
    }

    #[test]
    fn test_load_mtx_dir_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        write_dir(dir.path(), true);
        let ds = MtxSource::new(dir.path()).load("").unwrap();
        assert_eq!((ds.n_genes(), ds.n_cells()), (2, 3));
        assert_eq!(ds.barcodes()[1], "AAAG-1");
        assert_eq!(ds.genes().text("symbol").unwrap()[1], None);
        let batch = ds.cells().factor(BATCH).unwrap();
        assert_eq!(batch.levels(), ["b1", "b2"]);
        assert_eq!(ds.cells().num("depth").unwrap(), [1.5, 2.0, 3.0]);
        assert_eq!(ds.cells().text("note").unwrap()[1], None);
    }

    #[test]
    fn test_mtx_dir_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sim = crate::simulate::Simulated::default();
        let ds = sim.simulate("sim").unwrap();
        write_mtx_dir(dir.path().join("sim"), &ds).unwrap();
        let back = MtxSource::new(dir.path()).load("sim").unwrap();
        assert_eq!(back.barcodes(), ds.barcodes());
        assert_eq!(back.gene_ids(), ds.gene_ids());
        assert_eq!(back.counts().to_dense(), ds.counts().to_dense());
        assert_eq!(back.genes().text("symbol").unwrap(), ds.genes().text("symbol").unwrap());
        assert_eq!(back.cells().factor(BATCH).unwrap(), ds.cells().factor(BATCH).unwrap());
        assert_eq!(
            back.cells().factor(crate::simulate::TRUTH).unwrap().levels(),
            ["type1", "type2"]
        );
    }

    #[test]
    fn test_load_barcodes_only_subdir() {
        let root = tempfile::tempdir().unwrap();
        let sub = root.path().join("sample1");
        std::fs::create_dir(&sub).unwrap();
        write_dir(&sub, false);
        let ds = MtxSource::new(root.path()).load("sample1").unwrap();
        assert_eq!(ds.name(), "sample1");
        assert_eq!(ds.cells().column_names().count(), 0);
        assert!(MtxSource::new(root.path()).load("missing").is_err());
    }

    #[test]
    fn test_annotate_counts_misses() {
        let dir = tempfile::tempdir().unwrap();
        write_dir(dir.path(), false);
        let ds = MtxSource::new(dir.path()).load("").unwrap();
        let tsv = "gene_id\tsymbol\tchromosome\nENSG2\tACTB\t7\nENSG9\tGAPDH\t12\n";
        let ann = TsvAnnotation::from_reader(tsv.as_bytes()).unwrap();
        assert_eq!(ann.len(), 2);
        let ds = annotate(ds, &ann).unwrap();
        assert_eq!(
            ds.genes().text("symbol").unwrap(),
            [Some("MT-CO1".to_string()), Some("ACTB".to_string())]
        );
        assert_eq!(ds.genes().text("chromosome").unwrap(), [None, Some("7".to_string())]);
        assert_eq!(gene_labels(&ds), ["MT-CO1", "ACTB"]);
    }

    #[test]
    fn test_uniquify_symbols() {
        let ids: Vec<String> = ["E1", "E2", "E3", "E4"].iter().map(|s| s.to_string()).collect();
        let symbols = vec![Some("A".to_string()), Some("B".to_string()), None, Some("A".to_string())];
        assert_eq!(uniquify_symbols(&ids, &symbols), ["A_E1", "B", "E3", "A_E4"]);
    }
}
