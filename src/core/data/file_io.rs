use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::QcError;

/// Open a file for buffered reading
///
/// Files ending in `.gz` (as shipped by Cell Ranger) are decompressed on the
/// fly.
///
/// ### Params
///
/// * `path` - Path to the file, gzipped or not.
///
/// ### Returns
///
/// The buffered reader
pub fn open_buf_reader<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead>, QcError> {
    let path = path.as_ref();
    let file = File::open(path)?;
    match path.extension().and_then(|x| x.to_str()) {
        Some("gz") => Ok(Box::new(BufReader::new(GzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

/// Tab-separated reader over a (possibly gzipped) file
///
/// Fields are trimmed and quotes are taken literally.
///
/// ### Params
///
/// * `path` - Path to the file.
/// * `has_headers` - Treat the first record as header.
///
/// ### Returns
///
/// The `csv::Reader`
pub fn tsv_reader<P: AsRef<Path>>(
    path: P,
    has_headers: bool,
) -> Result<csv::Reader<Box<dyn BufRead>>, QcError> {
    let reader = open_buf_reader(path)?;
    Ok(csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(has_headers)
        .flexible(!has_headers)
        .quoting(false)
        .trim(csv::Trim::All)
        .from_reader(reader))
}

/// Turn a `csv::Error` into a `QcError`
///
/// I/O failures stay I/O errors; everything else becomes a parse error at
/// the position the reader reports, or at `line` if it reports none.
pub fn csv_error(file: &str, line: Option<usize>, err: csv::Error) -> QcError {
    if err.is_io_error() {
        if let csv::ErrorKind::Io(e) = err.into_kind() {
            return QcError::Io(e);
        }
        return QcError::Parse {
            file: file.to_string(),
            line: line.unwrap_or(0),
            message: "I/O error".to_string(),
        };
    }
    let line = err
        .position()
        .map(|p| p.line() as usize)
        .or(line)
        .unwrap_or(0);
    let message = match err.kind() {
        csv::ErrorKind::UnequalLengths {
            expected_len, len, ..
        } => format!("expected {} fields, found {}", expected_len, len),
        csv::ErrorKind::Deserialize { err, .. } => err.to_string(),
        _ => err.to_string(),
    };
    QcError::Parse {
        file: file.to_string(),
        line,
        message,
    }
}
