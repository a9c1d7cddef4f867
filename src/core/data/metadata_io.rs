use serde::Deserialize;
use std::path::Path;

use crate::core::data::dataset::{CellMetadata, GeneAnnotation, GeneInfo};
use crate::core::data::file_io::{csv_error, tsv_reader};
use crate::error::{QcError, QcResult};

/// One row of the cell table
#[derive(Debug, Deserialize)]
struct CellRecord {
    barcode: String,
    sample: String,
    stage: String,
    #[serde(default)]
    size_factor: Option<f64>,
}

/// Line of a record (1-based), if the reader tracked it
fn record_line(record: &csv::StringRecord) -> Option<usize> {
    record.position().map(|p| p.line() as usize)
}

//////////////////
// Cell records //
//////////////////

/// Read the per-cell metadata
///
/// The file needs a header with the columns `barcode`, `sample` and `stage`;
/// an optional `size_factor` column supplies the size factors. Column order
/// is free, other columns are ignored.
///
/// ### Params
///
/// * `path` - Path to the TSV file (may be gzipped)
///
/// ### Returns
///
/// Tuple of `(cell metadata, optional size factors)`
pub fn read_cells_tsv<P: AsRef<Path>>(
    path: P,
) -> QcResult<(Vec<CellMetadata>, Option<Vec<f64>>)> {
    let file_name = path.as_ref().display().to_string();
    let mut reader = tsv_reader(path, true)?;

    let headers = reader
        .headers()
        .map_err(|e| csv_error(&file_name, Some(1), e))?
        .clone();
    let has_column = |name: &str| headers.iter().any(|h| h == name);
    if !["barcode", "sample", "stage"].iter().all(|c| has_column(c)) {
        return Err(QcError::Parse {
            file: file_name,
            line: 1,
            message: "header needs the columns barcode, sample and stage".to_string(),
        });
    }
    let with_sf = has_column("size_factor");

    let mut cells = Vec::new();
    let mut size_factors = Vec::new();

    for result in reader.records() {
        let record = result.map_err(|e| csv_error(&file_name, None, e))?;
        let line = record_line(&record);
        let row: CellRecord = record
            .deserialize(Some(&headers))
            .map_err(|e| csv_error(&file_name, line, e))?;

        if with_sf {
            let sf = row.size_factor.ok_or_else(|| QcError::Parse {
                file: file_name.clone(),
                line: line.unwrap_or(0),
                message: format!("missing size factor for cell '{}'", row.barcode),
            })?;
            size_factors.push(sf);
        }
        cells.push(CellMetadata {
            barcode: row.barcode,
            sample: row.sample,
            stage: row.stage,
        });
    }

    Ok((cells, with_sf.then_some(size_factors)))
}

//////////////////
// Gene records //
//////////////////

/// Read the gene table
///
/// First column is the gene id, the optional second column the symbol
/// (10x `features.tsv(.gz)` layout, further columns are ignored). A header
/// line starting with `gene_id` is skipped.
///
/// ### Params
///
/// * `path` - Path to the TSV file (may be gzipped)
///
/// ### Returns
///
/// The genes in file order
pub fn read_genes_tsv<P: AsRef<Path>>(path: P) -> QcResult<Vec<GeneInfo>> {
    let file_name = path.as_ref().display().to_string();
    let mut reader = tsv_reader(path, false)?;

    let mut genes = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let record = result.map_err(|e| csv_error(&file_name, None, e))?;
        let id = record.get(0).unwrap_or_default();
        if i == 0 && id == "gene_id" {
            continue;
        }
        if id.is_empty() {
            return Err(QcError::Parse {
                file: file_name,
                line: record_line(&record).unwrap_or(0),
                message: "empty gene id".to_string(),
            });
        }
        genes.push(GeneInfo {
            id: id.to_string(),
            symbol: record
                .get(1)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string()),
        });
    }
    Ok(genes)
}

/// Read the gene to chromosome annotation
///
/// Two columns, gene id and chromosome name. A header line starting with
/// `gene_id` is skipped.
///
/// ### Params
///
/// * `path` - Path to the TSV file (may be gzipped)
///
/// ### Returns
///
/// The `GeneAnnotation`
pub fn read_annotation_tsv<P: AsRef<Path>>(path: P) -> QcResult<GeneAnnotation> {
    let file_name = path.as_ref().display().to_string();
    let mut reader = tsv_reader(path, false)?;

    let mut pairs = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let record = result.map_err(|e| csv_error(&file_name, None, e))?;
        if i == 0 && record.get(0) == Some("gene_id") {
            continue;
        }
        match (record.get(0), record.get(1)) {
            (Some(gene), Some(chrom)) if !gene.is_empty() => {
                pairs.push((gene.to_string(), chrom.to_string()))
            }
            _ => {
                return Err(QcError::Parse {
                    file: file_name,
                    line: record_line(&record).unwrap_or(0),
                    message: "expected gene id and chromosome".to_string(),
                })
            }
        }
    }
    Ok(GeneAnnotation::new(pairs))
}
