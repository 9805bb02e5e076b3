use anyhow::{bail, format_err, Context, Error};
use flate2::bufread::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use scan_types::CountMatrix;
use sprs::TriMat;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

fn is_gz(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "gz")
}

/// Open a text file for buffered reading, decompressing `.gz` files on the fly
pub fn open_text(path: impl AsRef<Path>) -> Result<Box<dyn BufRead>, Error> {
    let path = path.as_ref();
    let file = BufReader::new(File::open(path).with_context(|| path.display().to_string())?);
    if is_gz(path) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(file))
    }
}

/// Create a text file for buffered writing, gzip-compressed if the name ends in `.gz`
pub fn create_text(path: impl AsRef<Path>) -> Result<Box<dyn Write>, Error> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| path.display().to_string())?;
    if is_gz(path) {
        Ok(Box::new(BufWriter::new(GzEncoder::new(file, Compression::default()))))
    } else {
        Ok(Box::new(BufWriter::new(file)))
    }
}

fn parse_count(s: &str) -> Result<u32, Error> {
    if let Ok(v) = s.parse::<u32>() {
        return Ok(v);
    }
    let v = s.parse::<f64>().with_context(|| format!("bad VAL '{s}'"))?;
    if v < 0.0 || v.fract() != 0.0 || v > u32::MAX as f64 {
        bail!("VAL '{}' is not a count", s);
    }
    Ok(v as u32)
}

/// Load a genes x cells count matrix from (optionally gzipped) MTX coordinate format
pub fn load_mtx(path: impl AsRef<Path>) -> Result<CountMatrix, Error> {
    let path = path.as_ref();
    let mut reader = open_text(path)?;
    let mut line = String::new();
    let mut mat: Option<TriMat<u32>> = None;
    let mut line_no = 0;

    loop {
        line.clear();
        let sz = reader
            .read_line(&mut line)
            .with_context(|| format!("{}: line {}", path.display(), line_no + 1))?;
        if sz == 0 {
            break;
        }
        line_no += 1;
        if line.starts_with('%') || line.trim().is_empty() {
            continue;
        }
        let mut data = line.split_whitespace();
        match mat.as_mut() {
            None => {
                let nrow = data.next().ok_or_else(|| format_err!("no NROW"))?.parse::<usize>()?;
                let ncol = data.next().ok_or_else(|| format_err!("no NCOL"))?.parse::<usize>()?;
                let nnz = data.next().ok_or_else(|| format_err!("no NNZ"))?.parse::<usize>()?;
                mat = Some(TriMat::with_capacity((nrow, ncol), nnz));
            }
            Some(m) => {
                let row = data.next().ok_or_else(|| format_err!("missing ROW"))?.parse::<usize>()?;
                let col = data.next().ok_or_else(|| format_err!("missing COL"))?.parse::<usize>()?;
                let val = parse_count(data.next().ok_or_else(|| format_err!("missing VAL"))?)?;
                if row == 0 || col == 0 || row > m.rows() || col > m.cols() {
                    bail!(
                        "{}: line {}: entry ({}, {}) outside a {} x {} matrix",
                        path.display(),
                        line_no,
                        row,
                        col,
                        m.rows(),
                        m.cols()
                    );
                }
                m.add_triplet(row - 1, col - 1, val);
            }
        }
    }

    let Some(matrix) = mat else { bail!("no matrix found in {}", path.display()) };
    Ok(CountMatrix::from_csmat(matrix.to_csc()))
}

/// Write a count matrix in MTX coordinate format
pub fn write_mtx(path: impl AsRef<Path>, matrix: &CountMatrix) -> Result<(), Error> {
    let mut w = create_text(path)?;
    writeln!(w, "%%MatrixMarket matrix coordinate integer general")?;
    writeln!(w, "{} {} {}", matrix.genes(), matrix.cells(), matrix.nnz())?;
    for cell in 0..matrix.cells() {
        for (gene, v) in matrix.column(cell) {
            writeln!(w, "{} {} {}", gene + 1, cell + 1, v)?;
        }
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn test_mtx_roundtrip_gz() {
        let dir = tempfile::tempdir().unwrap();
        let dense: Array2<u32> = array![[0, 3, 0], [1, 0, 7], [0, 0, 2]];
        let m = CountMatrix::from_dense(dense.view());
        let path = dir.path().join("matrix.mtx.gz");
        write_mtx(&path, &m).unwrap();
        let back = load_mtx(&path).unwrap();
        assert_eq!(back.to_dense(), dense.mapv(|v| v as f64));
    }

    #[test]
    fn test_mtx_plain_with_real_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.mtx");
        std::fs::write(
            &path,
            "%%MatrixMarket matrix coordinate real general\n% comment\n2 2 2\n1 1 4.0\n2 2 1\n",
        )
        .unwrap();
        let m = load_mtx(&path).unwrap();
        assert_eq!(m.shape(), (2, 2));
        assert_eq!(m.column(0), vec![(0, 4)]);

        std::fs::write(&path, "2 2 1\n3 1 1\n").unwrap();
        assert!(load_mtx(&path).is_err());
        std::fs::write(&path, "2 2 1\n1 1 0.5\n").unwrap();
        assert!(load_mtx(&path).is_err());
    }
}
