use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

use crate::core::data::sparse_structures::{CompressedSparseFormat, CountMatrix};
use crate::error::{QcError, QcResult};

////////////////
// Structures //
////////////////

/// Metadata of a single cell (barcode)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellMetadata {
    pub barcode: String,
    pub sample: String,
    pub stage: String,
}

/// Gene identity
///
/// ### Fields
///
/// * `id` - Stable gene identifier (e.g. Ensembl id).
/// * `symbol` - Optional gene symbol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneInfo {
    pub id: String,
    pub symbol: Option<String>,
}

impl GeneInfo {
    /// Does this gene match the name on either the id or the symbol
    pub fn matches(&self, name: &str) -> bool {
        self.id == name || self.symbol.as_deref() == Some(name)
    }
}

/// A sample, i.e., the set of cells that was sequenced together
///
/// ### Fields
///
/// * `id` - Sample identifier.
/// * `stage` - Developmental stage of the sample.
/// * `cells` - Row indices of the cells of this sample in the dataset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    pub id: String,
    pub stage: String,
    pub cells: Vec<usize>,
}

impl Sample {
    /// Number of cells in the sample
    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }
}

/// The expression data under analysis
///
/// ### Fields
///
/// * `counts` - Raw counts in CSR format (cells x genes).
/// * `size_factors` - Positive size factor per cell.
/// * `cells` - Metadata per cell.
/// * `genes` - Gene identity per column.
#[derive(Clone, Debug)]
pub struct ExpressionDataset {
    counts: CountMatrix,
    size_factors: Vec<f64>,
    cells: Vec<CellMetadata>,
    genes: Vec<GeneInfo>,
}

impl ExpressionDataset {
    /// Generate a new dataset
    ///
    /// ### Params
    ///
    /// * `counts` - Raw counts, cells x genes. CSC input is converted.
    /// * `cells` - Metadata per cell (row).
    /// * `genes` - Gene per column.
    /// * `size_factors` - Optional size factors. Library-size factors
    ///   (library size divided by the mean library size) are computed when
    ///   not supplied.
    ///
    /// ### Returns
    ///
    /// The dataset, or an error on mismatched dimensions, non-positive size
    /// factors or an empty matrix.
    pub fn new(
        counts: CountMatrix,
        cells: Vec<CellMetadata>,
        genes: Vec<GeneInfo>,
        size_factors: Option<Vec<f64>>,
    ) -> QcResult<Self> {
        let counts = match counts.cs_type {
            CompressedSparseFormat::Csr => counts,
            CompressedSparseFormat::Csc => counts.transform(),
        };
        let (n_cells, n_genes) = counts.shape();

        if n_cells == 0 || n_genes == 0 {
            return Err(QcError::EmptyInput(format!(
                "count matrix of shape {} x {}",
                n_cells, n_genes
            )));
        }
        if cells.len() != n_cells {
            return Err(QcError::DimensionMismatch(format!(
                "{} cell metadata rows for {} cells in the count matrix",
                cells.len(),
                n_cells
            )));
        }
        if genes.len() != n_genes {
            return Err(QcError::DimensionMismatch(format!(
                "{} genes for {} columns in the count matrix",
                genes.len(),
                n_genes
            )));
        }

        let size_factors = match size_factors {
            Some(sf) => {
                if sf.len() != n_cells {
                    return Err(QcError::DimensionMismatch(format!(
                        "{} size factors for {} cells",
                        sf.len(),
                        n_cells
                    )));
                }
                if let Some(pos) = sf.iter().position(|&s| !(s.is_finite() && s > 0.0)) {
                    return Err(QcError::InvalidInput(format!(
                        "size factor of cell '{}' is not positive: {}",
                        cells[pos].barcode, sf[pos]
                    )));
                }
                sf
            }
            None => library_size_factors(&counts.library_sizes(), &cells)?,
        };

        Ok(Self {
            counts,
            size_factors,
            cells,
            genes,
        })
    }

    /// Number of cells
    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    /// Number of genes
    pub fn n_genes(&self) -> usize {
        self.genes.len()
    }

    /// Raw counts (cells x genes)
    pub fn counts(&self) -> &CountMatrix {
        &self.counts
    }

    /// Size factors
    pub fn size_factors(&self) -> &[f64] {
        &self.size_factors
    }

    /// Cell metadata
    pub fn cells(&self) -> &[CellMetadata] {
        &self.cells
    }

    /// Genes
    pub fn genes(&self) -> &[GeneInfo] {
        &self.genes
    }

    /// Group the cells by sample
    ///
    /// ### Returns
    ///
    /// The samples, sorted by their identifier. Errors if a sample carries
    /// more than one stage label.
    pub fn samples(&self) -> QcResult<Vec<Sample>> {
        let mut grouped: BTreeMap<&str, Sample> = BTreeMap::new();
        for (idx, cell) in self.cells.iter().enumerate() {
            let entry = grouped.entry(cell.sample.as_str()).or_insert_with(|| Sample {
                id: cell.sample.clone(),
                stage: cell.stage.clone(),
                cells: Vec::new(),
            });
            if entry.stage != cell.stage {
                return Err(QcError::InvalidInput(format!(
                    "sample '{}' has cells of stage '{}' and '{}'",
                    cell.sample, entry.stage, cell.stage
                )));
            }
            entry.cells.push(idx);
        }
        Ok(grouped.into_values().collect())
    }
}

/// Library-size factors
///
/// ### Params
///
/// * `lib_sizes` - Library size per cell.
/// * `cells` - Cell metadata, only used for error messages.
///
/// ### Returns
///
/// Library size divided by the mean library size; errors if a cell has no
/// counts at all.
fn library_size_factors(lib_sizes: &[u64], cells: &[CellMetadata]) -> QcResult<Vec<f64>> {
    if let Some(pos) = lib_sizes.iter().position(|&l| l == 0) {
        return Err(QcError::InvalidInput(format!(
            "cell '{}' has no counts; cannot derive a size factor",
            cells[pos].barcode
        )));
    }
    let mean = lib_sizes.iter().map(|&l| l as f64).sum::<f64>() / lib_sizes.len() as f64;
    Ok(lib_sizes.iter().map(|&l| l as f64 / mean).collect())
}

/// Gene to chromosome annotation
#[derive(Clone, Debug, Default)]
pub struct GeneAnnotation {
    chromosomes: FxHashMap<String, String>,
}

impl GeneAnnotation {
    /// Generate the annotation from `(gene_id, chromosome)` pairs
    pub fn new<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            chromosomes: pairs.into_iter().collect(),
        }
    }

    /// Chromosome of a gene, if annotated
    pub fn chromosome(&self, gene_id: &str) -> Option<&str> {
        self.chromosomes.get(gene_id).map(|s| s.as_str())
    }

    /// Number of annotated genes
    pub fn len(&self) -> usize {
        self.chromosomes.len()
    }

    /// Is the annotation empty
    pub fn is_empty(&self) -> bool {
        self.chromosomes.is_empty()
    }

    /// Chromosome of every gene of a dataset
    ///
    /// ### Params
    ///
    /// * `genes` - The genes of the dataset.
    ///
    /// ### Returns
    ///
    /// One entry per gene; `None` for genes without annotation.
    pub fn chromosomes_of(&self, genes: &[GeneInfo]) -> Vec<Option<&str>> {
        genes.iter().map(|g| self.chromosome(&g.id)).collect()
    }
}
