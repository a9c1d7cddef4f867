use faer::Mat;
use rayon::prelude::*;

use crate::core::data::dataset::{ExpressionDataset, GeneAnnotation};
use crate::core::data::sparse_structures::CountMatrix;

////////////////
// Structures //
////////////////

/// Structure to store QC information on cells
///
/// ### Fields
///
/// * `lib_size` - Library size of the cells
/// * `mito_fraction` - Fraction of the annotated counts that stem from
///   mitochondrial genes. `None` for cells without annotated counts.
#[derive(Clone, Debug)]
pub struct CellQuality {
    pub lib_size: Vec<u64>,
    pub mito_fraction: Vec<Option<f64>>,
}

impl CellQuality {
    /// Calculate the cell quality metrics
    ///
    /// Genes without annotation do not contribute to the mitochondrial
    /// fraction, neither to the numerator nor the denominator.
    ///
    /// ### Params
    ///
    /// * `dataset` - The expression data.
    /// * `annotation` - Gene to chromosome annotation.
    /// * `mito_chromosome` - Name of the mitochondrial chromosome.
    ///
    /// ### Returns
    ///
    /// The `CellQuality`
    pub fn calculate(
        dataset: &ExpressionDataset,
        annotation: &GeneAnnotation,
        mito_chromosome: &str,
    ) -> Self {
        let chromosomes = annotation.chromosomes_of(dataset.genes());
        let annotated: Vec<bool> = chromosomes.iter().map(|c| c.is_some()).collect();
        let mito: Vec<bool> = chromosomes
            .iter()
            .map(|c| *c == Some(mito_chromosome))
            .collect();

        let counts = dataset.counts();
        let lib_size = counts.library_sizes();
        let mito_fraction = (0..dataset.n_cells())
            .into_par_iter()
            .map(|i| {
                let (idx, vals) = counts.row(i);
                let mut total = 0_u64;
                let mut mt = 0_u64;
                for (&g, &v) in idx.iter().zip(vals.iter()) {
                    if annotated[g] {
                        total += v as u64;
                        if mito[g] {
                            mt += v as u64;
                        }
                    }
                }
                if total > 0 {
                    Some(mt as f64 / total as f64)
                } else {
                    None
                }
            })
            .collect();

        Self {
            lib_size,
            mito_fraction,
        }
    }
}

///////////////
// Functions //
///////////////

/// Log-normalised value of a count
#[inline]
pub fn log_norm(count: f64, size_factor: f64) -> f64 {
    (count / size_factor + 1.0).log2()
}

/// Genes with at least one count in a set of cells
///
/// ### Params
///
/// * `counts` - Raw counts (cells x genes).
/// * `cells` - The cells to consider.
///
/// ### Returns
///
/// Sorted gene indices
pub fn expressed_genes(counts: &CountMatrix, cells: &[usize]) -> Vec<usize> {
    let mut expressed = vec![false; counts.shape().1];
    for &c in cells {
        let (idx, vals) = counts.row(c);
        for (&g, &v) in idx.iter().zip(vals.iter()) {
            if v > 0 {
                expressed[g] = true;
            }
        }
    }
    expressed
        .iter()
        .enumerate()
        .filter(|(_, &e)| e)
        .map(|(g, _)| g)
        .collect()
}

/// Per gene mean and variance of the log-normalised expression
///
/// Works on the sparse data directly: zeros stay zero after the
/// log-normalisation.
///
/// ### Params
///
/// * `counts` - Raw counts (cells x genes).
/// * `cells` - The cells to consider.
/// * `size_factors` - Size factor per cell of the full dataset.
///
/// ### Returns
///
/// Tuple of `(means, variances)` over all genes
pub fn gene_log_mean_var(
    counts: &CountMatrix,
    cells: &[usize],
    size_factors: &[f64],
) -> (Vec<f64>, Vec<f64>) {
    let n_genes = counts.shape().1;
    let n = cells.len() as f64;

    let (sums, sum_sq) = cells
        .par_iter()
        .fold(
            || (vec![0.0_f64; n_genes], vec![0.0_f64; n_genes]),
            |(mut s, mut sq), &c| {
                let (idx, vals) = counts.row(c);
                for (&g, &v) in idx.iter().zip(vals.iter()) {
                    let x = log_norm(v as f64, size_factors[c]);
                    s[g] += x;
                    sq[g] += x * x;
                }
                (s, sq)
            },
        )
        .reduce(
            || (vec![0.0_f64; n_genes], vec![0.0_f64; n_genes]),
            |(mut s1, mut sq1), (s2, sq2)| {
                for g in 0..n_genes {
                    s1[g] += s2[g];
                    sq1[g] += sq2[g];
                }
                (s1, sq1)
            },
        );

    let means: Vec<f64> = sums.iter().map(|s| s / n).collect();
    let vars: Vec<f64> = if cells.len() < 2 {
        vec![0.0; n_genes]
    } else {
        sum_sq
            .iter()
            .zip(means.iter())
            .map(|(sq, m)| ((sq - n * m * m) / (n - 1.0)).max(0.0))
            .collect()
    };

    (means, vars)
}

/// Dense log-normalised expression of a cell x gene subset
///
/// ### Params
///
/// * `counts` - Raw counts (cells x genes).
/// * `cells` - The cells (rows of the output).
/// * `genes` - The genes (columns of the output).
/// * `size_factors` - Size factor per cell of the full dataset.
///
/// ### Returns
///
/// Matrix of `log2(count / size_factor + 1)`
pub fn log_normalised_dense(
    counts: &CountMatrix,
    cells: &[usize],
    genes: &[usize],
    size_factors: &[f64],
) -> Mat<f32> {
    let mut gene_pos = vec![usize::MAX; counts.shape().1];
    for (j, &g) in genes.iter().enumerate() {
        gene_pos[g] = j;
    }
    let mut res = Mat::<f32>::zeros(cells.len(), genes.len());
    for (i, &c) in cells.iter().enumerate() {
        let (idx, vals) = counts.row(c);
        for (&g, &v) in idx.iter().zip(vals.iter()) {
            let j = gene_pos[g];
            if j != usize::MAX {
                res[(i, j)] = log_norm(v as f64, size_factors[c]) as f32;
            }
        }
    }
    res
}
