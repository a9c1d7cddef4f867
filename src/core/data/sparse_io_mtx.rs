use std::io::BufRead;
use std::path::Path;
use std::time::Instant;

use crate::core::data::file_io::open_buf_reader;
use crate::core::data::sparse_structures::CountMatrix;
use crate::error::{QcError, QcResult};

/// Upper bound of the entries reserved up front
const MAX_PREALLOC: usize = 1 << 24;

/////////
// MTX //
/////////

/// MTX file metadata
///
/// ### Fields
///
/// * `nrows` - Number of rows declared in the .mtx header.
/// * `ncols` - Number of columns declared in the .mtx header.
/// * `total_entries` - Number of entries declared in the .mtx header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtxHeader {
    pub nrows: usize,
    pub ncols: usize,
    pub total_entries: usize,
}

/// Reader for MatrixMarket coordinate files with count data
///
/// ### Fields
///
/// * `reader` - Buffered reader of the (possibly gzipped) mtx file,
///   positioned after the header.
/// * `header` - The parsed size line.
/// * `file_name` - Name of the file for error messages.
/// * `line_no` - Current line number.
pub struct MtxReader {
    reader: Box<dyn BufRead>,
    header: MtxHeader,
    file_name: String,
    line_no: usize,
}

impl MtxReader {
    /// Generate a new instance of the reader
    ///
    /// ### Params
    ///
    /// * `path` - Path to the mtx file; `.gz` files are decompressed.
    ///
    /// ### Returns
    ///
    /// The reader with the header parsed.
    pub fn new<P: AsRef<Path>>(path: P) -> QcResult<Self> {
        let file_name = path.as_ref().display().to_string();
        let mut reader = open_buf_reader(path)?;
        let mut line_no = 0;

        let header = Self::parse_header(reader.as_mut(), &file_name, &mut line_no)?;

        Ok(Self {
            reader,
            header,
            file_name,
            line_no,
        })
    }

    /// Parse the header of the mtx file
    fn parse_header(
        reader: &mut dyn BufRead,
        file_name: &str,
        line_no: &mut usize,
    ) -> QcResult<MtxHeader> {
        let mut line = String::new();

        loop {
            line.clear();
            *line_no += 1;
            if reader.read_line(&mut line)? == 0 {
                return Err(QcError::Parse {
                    file: file_name.to_string(),
                    line: *line_no,
                    message: "missing MatrixMarket size line".to_string(),
                });
            }
            if *line_no == 1 && line.starts_with("%%MatrixMarket") {
                let banner = line.to_lowercase();
                if !banner.contains("coordinate") {
                    return Err(QcError::Parse {
                        file: file_name.to_string(),
                        line: *line_no,
                        message: "only coordinate MatrixMarket files are supported".to_string(),
                    });
                }
            }
            if !line.starts_with('%') && !line.trim().is_empty() {
                break;
            }
        }

        let parts: Vec<usize> = line
            .split_whitespace()
            .map(|p| p.parse::<usize>())
            .collect::<Result<_, _>>()
            .map_err(|_| QcError::Parse {
                file: file_name.to_string(),
                line: *line_no,
                message: format!("invalid size line '{}'", line.trim()),
            })?;

        if parts.len() != 3 {
            return Err(QcError::Parse {
                file: file_name.to_string(),
                line: *line_no,
                message: "size line needs three entries".to_string(),
            });
        }

        let (nrows, ncols, total_entries) = (parts[0], parts[1], parts[2]);
        let fits = nrows
            .checked_mul(ncols)
            .is_some_and(|cells| total_entries <= cells);
        if !fits {
            return Err(QcError::Parse {
                file: file_name.to_string(),
                line: *line_no,
                message: format!(
                    "{} entries declared for a {} x {} matrix",
                    total_entries, nrows, ncols
                ),
            });
        }

        Ok(MtxHeader {
            nrows,
            ncols,
            total_entries,
        })
    }

    /// Read the counts into a cells x genes CSR matrix
    ///
    /// ### Params
    ///
    /// * `cells_as_rows` - If `false` (10x layout), the file stores genes in
    ///   rows and cells in columns. If `true`, cells are in rows.
    ///
    /// ### Returns
    ///
    /// The `CountMatrix`
    pub fn read_counts(mut self, cells_as_rows: bool) -> QcResult<CountMatrix> {
        let start = Instant::now();

        let reserve = self.header.total_entries.min(MAX_PREALLOC);
        let mut cell_idx = Vec::with_capacity(reserve);
        let mut gene_idx = Vec::with_capacity(reserve);
        let mut values = Vec::with_capacity(reserve);
        let mut line_buffer = Vec::with_capacity(128);

        while {
            line_buffer.clear();
            self.reader.read_until(b'\n', &mut line_buffer)? > 0
        } {
            self.line_no += 1;
            while matches!(line_buffer.last(), Some(b'\n') | Some(b'\r')) {
                line_buffer.pop();
            }
            if line_buffer.is_empty() || line_buffer[0] == b'%' {
                continue;
            }

            let (row, col, val) = parse_mtx_line(&line_buffer).ok_or_else(|| QcError::Parse {
                file: self.file_name.clone(),
                line: self.line_no,
                message: format!(
                    "malformed entry '{}'",
                    String::from_utf8_lossy(&line_buffer)
                ),
            })?;

            if row == 0 || col == 0 || row > self.header.nrows || col > self.header.ncols {
                return Err(QcError::Parse {
                    file: self.file_name.clone(),
                    line: self.line_no,
                    message: format!(
                        "entry ({}, {}) outside of the declared {} x {} matrix",
                        row, col, self.header.nrows, self.header.ncols
                    ),
                });
            }

            let (cell, gene) = if cells_as_rows {
                (row - 1, col - 1)
            } else {
                (col - 1, row - 1)
            };
            cell_idx.push(cell);
            gene_idx.push(gene);
            values.push(val);
        }

        if values.len() != self.header.total_entries {
            return Err(QcError::Parse {
                file: self.file_name.clone(),
                line: self.line_no,
                message: format!(
                    "header declares {} entries, found {}",
                    self.header.total_entries,
                    values.len()
                ),
            });
        }

        let shape = if cells_as_rows {
            (self.header.nrows, self.header.ncols)
        } else {
            (self.header.ncols, self.header.nrows)
        };

        let counts = CountMatrix::from_triplets_csr(&cell_idx, &gene_idx, &values, shape)?;

        log::debug!(
            "Read {} entries ({} cells x {} genes) from {} in {:.2?}",
            values.len(),
            shape.0,
            shape.1,
            self.file_name,
            start.elapsed()
        );

        Ok(counts)
    }
}

/// Parse one entry line of the mtx file
///
/// Values written as integral reals (e.g. `3.0`) are accepted.
///
/// ### Params
///
/// * `line` - The line without line break
///
/// ### Returns
///
/// `(row, col, value)` with 1-based indices, `None` if malformed.
fn parse_mtx_line(line: &[u8]) -> Option<(usize, usize, u32)> {
    let mut i = 0;
    let len = line.len();

    let mut fields = [0_usize; 2];
    for field in fields.iter_mut() {
        while i < len && (line[i] == b' ' || line[i] == b'\t') {
            i += 1;
        }
        let start = i;
        while i < len && line[i].is_ascii_digit() {
            *field = field.checked_mul(10)?.checked_add((line[i] - b'0') as usize)?;
            i += 1;
        }
        if i == start {
            return None;
        }
    }

    while i < len && (line[i] == b' ' || line[i] == b'\t') {
        i += 1;
    }
    if i >= len {
        return None;
    }

    let rest = std::str::from_utf8(&line[i..]).ok()?.trim();
    let val = match rest.parse::<u32>() {
        Ok(v) => v,
        Err(_) => {
            let v: f64 = rest.parse().ok()?;
            if v < 0.0 || v.fract() != 0.0 || v > u32::MAX as f64 {
                return None;
            }
            v as u32
        }
    };

    Some((fields[0], fields[1], val))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_mtx(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_parse_mtx_line() {
        assert_eq!(parse_mtx_line(b"3 4 12"), Some((3, 4, 12)));
        assert_eq!(parse_mtx_line(b"3\t4\t2.0"), Some((3, 4, 2)));
        assert_eq!(parse_mtx_line(b"3 4"), None);
        assert_eq!(parse_mtx_line(b"3 4 1.5"), None);
    }

    #[test]
    fn test_read_genes_by_cells() {
        // 3 genes x 2 cells
        let file = write_mtx(
            "%%MatrixMarket matrix coordinate integer general\n%comment\n3 2 3\n1 1 5\n3 1 1\n2 2 7\n",
        );
        let counts = MtxReader::new(file.path())
            .unwrap()
            .read_counts(false)
            .unwrap();
        assert_eq!(counts.shape(), (2, 3));
        assert_eq!(counts.row(0), (&[0_usize, 2][..], &[5_u32, 1][..]));
        assert_eq!(counts.row(1), (&[1_usize][..], &[7_u32][..]));
    }

    #[test]
    fn test_read_cells_by_genes() {
        let file = write_mtx("%%MatrixMarket matrix coordinate integer general\n2 3 2\n1 3 4\n2 1 1\n");
        let counts = MtxReader::new(file.path()).unwrap().read_counts(true).unwrap();
        assert_eq!(counts.shape(), (2, 3));
        assert_eq!(counts.library_sizes(), vec![4, 1]);
    }

    #[test]
    fn test_entry_count_mismatch() {
        let file = write_mtx("%%MatrixMarket matrix coordinate integer general\n2 3 3\n1 3 4\n");
        let res = MtxReader::new(file.path()).unwrap().read_counts(true);
        assert!(matches!(res, Err(QcError::Parse { .. })));
    }

    #[test]
    fn test_oversized_entry_count_is_rejected() {
        let file = write_mtx(
            "%%MatrixMarket matrix coordinate integer general\n2 3 18446744073709551615\n1 1 1\n",
        );
        let res = MtxReader::new(file.path());
        assert!(matches!(res, Err(QcError::Parse { line: 2, .. })));

        let file = write_mtx("%%MatrixMarket matrix coordinate integer general\n2 3 7\n1 1 1\n");
        assert!(MtxReader::new(file.path()).is_err());
    }

    #[test]
    fn test_read_gzipped_matrix() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.mtx.gz");
        let mut enc = GzEncoder::new(std::fs::File::create(&path).unwrap(), Compression::default());
        enc.write_all(b"%%MatrixMarket matrix coordinate integer general\n3 2 2\n1 1 5\n2 2 7\n")
            .unwrap();
        enc.finish().unwrap();

        let counts = MtxReader::new(&path).unwrap().read_counts(false).unwrap();
        assert_eq!(counts.shape(), (2, 3));
        assert_eq!(counts.library_sizes(), vec![5, 7]);
    }

    #[test]
    fn test_out_of_range_entry() {
        let file = write_mtx("%%MatrixMarket matrix coordinate integer general\n2 3 1\n3 1 4\n");
        let res = MtxReader::new(file.path()).unwrap().read_counts(true);
        assert!(matches!(res, Err(QcError::Parse { line: 3, .. })));
    }
}
