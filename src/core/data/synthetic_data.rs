use rand::prelude::*;

use crate::core::data::sparse_structures::{CompressedSparseFormat, CountMatrix};
use crate::error::{QcError, QcResult};

////////////////
// Structures //
////////////////

/// Configuration of one synthetic cell type
///
/// ### Fields
///
/// * `marker_genes` - Gene indices that are specific to this cell type.
/// * `marker_exp_range` - Inclusive range of the counts of an expressed
///   marker.
/// * `markers_per_cell` - Inclusive range of how many of the markers a
///   single cell expresses.
#[derive(Clone, Debug)]
pub struct CellTypeConfig {
    pub marker_genes: Vec<usize>,
    pub marker_exp_range: (u32, u32),
    pub markers_per_cell: (usize, usize),
}

/// Configuration of a synthetic single cell sample
///
/// Genes are laid out as consecutive marker blocks (one per cell type)
/// followed by the housekeeping genes. Every other housekeeping gene is
/// sparse (a single count with a gene-specific detection rate), the others
/// are dense with a gene-specific base level.
///
/// ### Fields
///
/// * `cell_type_sizes` - Number of cells per cell type.
/// * `markers_per_type` - Size of each marker block.
/// * `marker_exp_range` - Counts of an expressed marker.
/// * `markers_per_cell` - How many markers of its type a cell expresses.
/// * `n_housekeeping` - Number of housekeeping genes.
/// * `seed` - Seed for reproducibility purposes.
#[derive(Clone, Debug)]
pub struct SyntheticSampleConfig {
    pub cell_type_sizes: Vec<usize>,
    pub markers_per_type: usize,
    pub marker_exp_range: (u32, u32),
    pub markers_per_cell: (usize, usize),
    pub n_housekeeping: usize,
    pub seed: u64,
}

impl Default for SyntheticSampleConfig {
    fn default() -> Self {
        Self {
            cell_type_sizes: vec![20, 20, 10, 10, 10, 10, 10],
            markers_per_type: 15,
            marker_exp_range: (10, 20),
            markers_per_cell: (15, 15),
            n_housekeeping: 600,
            seed: 42,
        }
    }
}

impl SyntheticSampleConfig {
    /// Total number of genes
    pub fn n_genes(&self) -> usize {
        self.cell_type_sizes.len() * self.markers_per_type + self.n_housekeeping
    }

    /// Cell type configurations with consecutive marker blocks
    pub fn cell_type_configs(&self) -> Vec<CellTypeConfig> {
        (0..self.cell_type_sizes.len())
            .map(|t| CellTypeConfig {
                marker_genes: (t * self.markers_per_type..(t + 1) * self.markers_per_type)
                    .collect(),
                marker_exp_range: self.marker_exp_range,
                markers_per_cell: self.markers_per_cell,
            })
            .collect()
    }
}

/// Synthetic sample
///
/// ### Fields
///
/// * `counts` - Raw counts, cells x genes.
/// * `cell_types` - Cell type per cell; `None` for injected doublets.
/// * `doublet_of` - For injected doublets, the two source cells.
#[derive(Clone, Debug)]
pub struct SyntheticSample {
    pub counts: CountMatrix,
    pub cell_types: Vec<Option<usize>>,
    pub doublet_of: Vec<Option<(usize, usize)>>,
}

impl SyntheticSample {
    /// Number of cells (including injected doublets)
    pub fn n_cells(&self) -> usize {
        self.counts.shape().0
    }

    /// Which cells are injected doublets
    pub fn is_doublet(&self) -> Vec<bool> {
        self.doublet_of.iter().map(|d| d.is_some()).collect()
    }
}

///////////////
// Functions //
///////////////

/// Helper function to create synthetic data with specific cell types
///
/// Cells are generated in blocks, i.e., the first `cell_type_sizes[0]` cells
/// are of the first type.
///
/// ### Params
///
/// * `config` - The `SyntheticSampleConfig`.
///
/// ### Returns
///
/// The `SyntheticSample` without doublets.
pub fn create_celltype_sparse_csr_data(config: &SyntheticSampleConfig) -> SyntheticSample {
    let n_genes = config.n_genes();
    let n_cells: usize = config.cell_type_sizes.iter().sum();
    let hk_start = config.cell_type_sizes.len() * config.markers_per_type;
    let type_configs = config.cell_type_configs();

    let mut indptr = Vec::with_capacity(n_cells + 1);
    let mut indices = Vec::with_capacity(n_cells * 100);
    let mut data = Vec::with_capacity(n_cells * 100);
    let mut cell_types = Vec::with_capacity(n_cells);
    indptr.push(0);

    let mut temp_vec: Vec<(usize, u32)> = Vec::with_capacity(n_genes);
    let mut cell_idx = 0_usize;

    for (cell_type, &size) in config.cell_type_sizes.iter().enumerate() {
        let type_config = &type_configs[cell_type];
        for _ in 0..size {
            let mut rng = StdRng::seed_from_u64(config.seed + cell_idx as u64);
            temp_vec.clear();

            let n_markers = rng
                .random_range(type_config.markers_per_cell.0..=type_config.markers_per_cell.1)
                .min(type_config.marker_genes.len());
            let marker_indices: Vec<usize> = type_config
                .marker_genes
                .choose_multiple(&mut rng, n_markers)
                .copied()
                .collect();
            for &gene_idx in &marker_indices {
                let count = rng.random_range(
                    type_config.marker_exp_range.0..=type_config.marker_exp_range.1,
                );
                temp_vec.push((gene_idx, count));
            }

            for k in 0..config.n_housekeeping {
                let frac = k as f64 / config.n_housekeeping.max(1) as f64;
                let count = if k % 2 == 0 {
                    let detection = 0.05 + 0.55 * frac;
                    u32::from(rng.random_bool(detection))
                } else {
                    2 + (k % 19) as u32 + u32::from(rng.random_bool(0.5))
                };
                if count > 0 {
                    temp_vec.push((hk_start + k, count));
                }
            }

            temp_vec.sort_unstable_by_key(|(gene_idx, _)| *gene_idx);
            for &(gene_idx, count) in temp_vec.iter() {
                indices.push(gene_idx);
                data.push(count);
            }
            indptr.push(indices.len());
            cell_types.push(Some(cell_type));
            cell_idx += 1;
        }
    }

    let counts = CountMatrix {
        data,
        indices,
        indptr,
        cs_type: CompressedSparseFormat::Csr,
        shape: (n_cells, n_genes),
    };

    SyntheticSample {
        counts,
        cell_types,
        doublet_of: vec![None; n_cells],
    }
}

/// Append doublets as exact sums of the raw counts of two cells
///
/// ### Params
///
/// * `sample` - The sample to extend.
/// * `pairs` - Pairs of existing cells to sum up.
///
/// ### Returns
///
/// The sample with one additional cell per pair at the end.
pub fn inject_doublets(
    sample: SyntheticSample,
    pairs: &[(usize, usize)],
) -> QcResult<SyntheticSample> {
    let SyntheticSample {
        counts,
        mut cell_types,
        mut doublet_of,
    } = sample;
    let (n_cells, n_genes) = counts.shape();

    let mut data = counts.data.clone();
    let mut indices = counts.indices.clone();
    let mut indptr = counts.indptr.clone();
    let mut dense_row = vec![0_u32; n_genes];

    for &(a, b) in pairs {
        if a >= n_cells || b >= n_cells {
            return Err(QcError::InvalidInput(format!(
                "doublet source ({}, {}) outside of {} cells",
                a, b, n_cells
            )));
        }
        dense_row.iter_mut().for_each(|v| *v = 0);
        for &cell in &[a, b] {
            let (idx, vals) = counts.row(cell);
            for (&g, &v) in idx.iter().zip(vals.iter()) {
                dense_row[g] = dense_row[g].saturating_add(v);
            }
        }
        for (g, &v) in dense_row.iter().enumerate() {
            if v > 0 {
                indices.push(g);
                data.push(v);
            }
        }
        indptr.push(indices.len());
        cell_types.push(None);
        doublet_of.push(Some((a, b)));
    }

    let counts = CountMatrix::new_csr(data, indices, indptr, (n_cells + pairs.len(), n_genes))?;

    Ok(SyntheticSample {
        counts,
        cell_types,
        doublet_of,
    })
}

/// Draw random doublet source pairs between two cell types
///
/// ### Params
///
/// * `sample` - The sample to draw from.
/// * `type_a` - First cell type.
/// * `type_b` - Second cell type.
/// * `n` - Number of pairs.
/// * `seed` - Seed for reproducibility purposes.
///
/// ### Returns
///
/// Vector of `(cell_of_type_a, cell_of_type_b)`
pub fn random_doublet_pairs(
    sample: &SyntheticSample,
    type_a: usize,
    type_b: usize,
    n: usize,
    seed: u64,
) -> Vec<(usize, usize)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let of_type = |t: usize| -> Vec<usize> {
        sample
            .cell_types
            .iter()
            .enumerate()
            .filter(|(_, ct)| **ct == Some(t))
            .map(|(i, _)| i)
            .collect()
    };
    let cells_a = of_type(type_a);
    let cells_b = of_type(type_b);
    if cells_a.is_empty() || cells_b.is_empty() {
        return Vec::new();
    }
    (0..n)
        .map(|_| {
            (
                cells_a[rng.random_range(0..cells_a.len())],
                cells_b[rng.random_range(0..cells_b.len())],
            )
        })
        .collect()
}
