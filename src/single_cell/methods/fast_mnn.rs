use faer::{Mat, MatRef};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;
use std::time::Instant;

use crate::assert_ncols;
use crate::core::graph::knn::{find_knn, KnnSearch};
use crate::error::{QcError, QcResult};
use crate::utils::general::{rowbind_matrices, squared_euclidean};

////////////
// Params //
////////////

/// Parameters for fastMNN batch correction
///
/// ### Fields
///
/// * `k` - Number of nearest neighbours searched in the other batch when
///   identifying mutual nearest neighbours.
/// * `sigma` - Bandwidth of the Gaussian smoothing kernel (as proportion of
///   space radius after optional cosine normalisation).
/// * `cos_norm` - L2-normalise every cell of the embedding before the
///   correction.
/// * `n_pcs` - Number of dimensions of the shared PCA the correction works
///   in.
/// * `random_svd` - Use the randomised SVD for the shared PCA.
/// * `knn_method` - Exact or approximate (HNSW) neighbour search.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MnnParams {
    pub k: usize,
    pub sigma: f32,
    pub cos_norm: bool,
    pub n_pcs: usize,
    pub random_svd: bool,
    pub knn_method: KnnSearch,
}

impl Default for MnnParams {
    fn default() -> Self {
        Self {
            k: 20,
            sigma: 0.1,
            cos_norm: true,
            n_pcs: 50,
            random_svd: false,
            knn_method: KnnSearch::Exact,
        }
    }
}

/////////////
// Helpers //
/////////////

/// Find mutual nearest neighbours from two KNN graphs
///
/// ### Params
///
/// * `left_knn` - Neighbours in the right batch of every left cell.
/// * `right_knn` - Neighbours in the left batch of every right cell.
///
/// ### Returns
///
/// (left_indices, right_indices) of MNN pairs
pub fn find_mutual_nns(
    left_knn: &[Vec<usize>],
    right_knn: &[Vec<usize>],
) -> (Vec<usize>, Vec<usize>) {
    let right_sets: Vec<FxHashSet<usize>> = right_knn
        .iter()
        .map(|neighbours| neighbours.iter().copied().collect())
        .collect();

    left_knn
        .par_iter()
        .enumerate()
        .fold(
            || (Vec::new(), Vec::new()),
            |(mut left_mnn, mut right_mnn), (left_idx, left_neighbours)| {
                for &right_idx in left_neighbours {
                    if right_sets[right_idx].contains(&left_idx) {
                        left_mnn.push(left_idx);
                        right_mnn.push(right_idx);
                    }
                }
                (left_mnn, right_mnn)
            },
        )
        .reduce(
            || (Vec::new(), Vec::new()),
            |(mut l1, mut r1), (l2, r2)| {
                l1.extend(l2);
                r1.extend(r2);
                (l1, r1)
            },
        )
}

/// Average correction vectors of the MNN cells of the right batch
///
/// ### Params
///
/// * `data_1` - Left batch (cells x dims).
/// * `data_2` - Right batch (cells x dims).
/// * `mnn_1` - MNN indices in the left batch.
/// * `mnn_2` - MNN indices in the right batch.
///
/// ### Returns
///
/// Tuple of `(unique right MNN cells (sorted), averaged correction per
/// unique cell)`; row `i` of the matrix belongs to the `i`-th cell.
pub fn compute_correction_vecs(
    data_1: MatRef<f32>,
    data_2: MatRef<f32>,
    mnn_1: &[usize],
    mnn_2: &[usize],
) -> (Vec<usize>, Mat<f32>) {
    let n_features = data_1.ncols();

    let mut accum: FxHashMap<usize, (Vec<f32>, usize)> = FxHashMap::default();
    for (&idx1, &idx2) in mnn_1.iter().zip(mnn_2.iter()) {
        let (sums, count) = accum
            .entry(idx2)
            .or_insert_with(|| (vec![0_f32; n_features], 0));
        for g in 0..n_features {
            sums[g] += data_1[(idx1, g)] - data_2[(idx2, g)];
        }
        *count += 1;
    }

    let mut cells: Vec<usize> = accum.keys().copied().collect();
    cells.sort_unstable();

    let averaged = Mat::from_fn(cells.len(), n_features, |i, g| {
        let (sums, count) = &accum[&cells[i]];
        sums[g] / *count as f32
    });

    (cells, averaged)
}

/// Logspace addition to avoid underflow
#[inline]
fn logspace_add(log_a: f32, log_b: f32) -> f32 {
    if log_a.is_infinite() && log_a.is_sign_negative() {
        return log_b;
    }
    if log_b.is_infinite() && log_b.is_sign_negative() {
        return log_a;
    }

    let max = log_a.max(log_b);
    max + ((log_a - max).exp() + (log_b - max).exp()).ln()
}

/// Smooth correction vectors using Gaussian kernel weighted by MNN density
///
/// Every MNN cell spreads its correction over all cells with a Gaussian
/// kernel, down-weighted by the kernel density of the MNN cells around it.
/// The per-cell weights are normalised in log space, so cells far away from
/// every MNN cell still receive the correction of the closest ones.
///
/// ### Params
///
/// * `averaged` - Averaged correction vectors (mnn cells x features).
/// * `mnn_cells` - Rows of `data_2` the corrections belong to.
/// * `data_2` - Data of the batch to correct (cells x features).
/// * `sigma_square` - Bandwidth squared.
///
/// ### Returns
///
/// Smoothed correction vectors for all cells (cells x features)
pub fn smooth_gaussian_kernel_mnn(
    averaged: MatRef<f32>,
    mnn_cells: &[usize],
    data_2: MatRef<f32>,
    sigma_square: f32,
) -> Mat<f32> {
    let n_features = averaged.ncols();
    let inv_sigma_square = 1.0 / sigma_square;

    let rows: Vec<Vec<f32>> = (0..data_2.nrows())
        .map(|i| (0..data_2.ncols()).map(|j| data_2[(i, j)]).collect())
        .collect();

    let log_kernel = |a: usize, b: usize| -> f32 {
        -squared_euclidean(&rows[a], &rows[b]) * inv_sigma_square
    };

    // log density of the MNN cells around every MNN cell
    let log_density: Vec<f32> = mnn_cells
        .par_iter()
        .map(|&m| {
            mnn_cells
                .iter()
                .map(|&other| log_kernel(m, other))
                .fold(f32::NEG_INFINITY, logspace_add)
        })
        .collect();

    let smoothed: Vec<Vec<f32>> = (0..data_2.nrows())
        .into_par_iter()
        .map(|cell| {
            let log_weights: Vec<f32> = mnn_cells
                .iter()
                .zip(log_density.iter())
                .map(|(&m, &dens)| log_kernel(m, cell) - dens)
                .collect();
            let max = log_weights.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut correction = vec![0_f32; n_features];
            if !max.is_finite() {
                return correction;
            }
            let mut total = 0_f32;
            for (mnn_i, &lw) in log_weights.iter().enumerate() {
                let w = (lw - max).exp();
                total += w;
                for g in 0..n_features {
                    correction[g] += averaged[(mnn_i, g)] * w;
                }
            }
            for v in correction.iter_mut() {
                *v /= total;
            }
            correction
        })
        .collect();

    Mat::from_fn(data_2.nrows(), n_features, |i, g| smoothed[i][g])
}

/// L2-normalise every row
///
/// ### Params
///
/// * `x` - Cells x features.
///
/// ### Returns
///
/// Matrix with unit-length rows; all-zero rows stay zero.
pub fn cosine_normalise(x: MatRef<f32>) -> Mat<f32> {
    let norms: Vec<f32> = (0..x.nrows())
        .map(|i| (0..x.ncols()).map(|j| x[(i, j)].powi(2)).sum::<f32>().sqrt())
        .collect();
    Mat::from_fn(x.nrows(), x.ncols(), |i, j| {
        if norms[i] > 0.0 {
            x[(i, j)] / norms[i]
        } else {
            0.0
        }
    })
}

/// Merge two batches
///
/// ### Params
///
/// * `data_1` - Reference (cells x features)
/// * `data_2` - Batch to correct (cells x features)
/// * `params` - `MnnParams` with all of the parameters for this run
/// * `seed` - Random seed for the approximate kNN search
///
/// ### Returns
///
/// Corrected data_2 (cells x features)
pub fn merge_two_batches(
    data_1: MatRef<f32>,
    data_2: MatRef<f32>,
    params: &MnnParams,
    seed: u64,
) -> Mat<f32> {
    assert_ncols!(data_1, data_2);

    let sigma_square = params.sigma * params.sigma;

    let k_12 = params.k.min(data_2.nrows());
    let k_21 = params.k.min(data_1.nrows());
    let knn_1_to_2 = find_knn(data_1, data_2, k_12, params.knn_method, false, seed);
    let knn_2_to_1 = find_knn(data_2, data_1, k_21, params.knn_method, false, seed);

    let (mnn_1, mnn_2) = find_mutual_nns(&knn_1_to_2, &knn_2_to_1);

    if mnn_1.is_empty() {
        log::warn!("No MNN pairs found; batch left uncorrected");
        return data_2.to_owned();
    }

    log::debug!("Found {} MNN pairs", mnn_1.len());

    let (mnn_cells, averaged) = compute_correction_vecs(data_1, data_2, &mnn_1, &mnn_2);
    let corrections =
        smooth_gaussian_kernel_mnn(averaged.as_ref(), &mnn_cells, data_2, sigma_square);

    Mat::from_fn(data_2.nrows(), data_2.ncols(), |i, j| {
        data_2[(i, j)] + corrections[(i, j)]
    })
}

/// Fast MNN with cell order tracking
///
/// Batches are merged sequentially in the given order: every batch is
/// corrected towards all previously merged batches.
///
/// ### Params
///
/// * `batches` - Vec of embeddings per batch (cells x dims).
/// * `original_indices` - Vec of original cell indices per batch. Together
///   they must be a permutation of `0..n_cells`.
/// * `params` - `MnnParams` with all of the parameters for this run
/// * `seed` - Random seed for reproducibility
///
/// ### Returns
///
/// The corrected embedding in the original cell order.
pub fn fast_mnn(
    batches: Vec<Mat<f32>>,
    original_indices: Vec<Vec<usize>>,
    params: &MnnParams,
    seed: u64,
) -> QcResult<Mat<f32>> {
    if batches.len() != original_indices.len() {
        return Err(QcError::DimensionMismatch(format!(
            "{} batches with {} index vectors",
            batches.len(),
            original_indices.len()
        )));
    }
    if batches.is_empty() {
        return Err(QcError::EmptyInput("no batches to correct".to_string()));
    }
    for (b, idx) in batches.iter().zip(original_indices.iter()) {
        if b.nrows() != idx.len() {
            return Err(QcError::DimensionMismatch(format!(
                "batch with {} cells but {} original indices",
                b.nrows(),
                idx.len()
            )));
        }
    }

    let start = Instant::now();

    let batches: Vec<Mat<f32>> = if params.cos_norm {
        batches.iter().map(|b| cosine_normalise(b.as_ref())).collect()
    } else {
        batches
    };

    let mut iter = batches.into_iter().zip(original_indices);
    let (first, first_indices) = iter
        .next()
        .ok_or_else(|| QcError::EmptyInput("no batches to correct".to_string()))?;

    let mut merged = first;
    let mut index_map = first_indices;

    for (batch, batch_indices) in iter {
        let corrected = merge_two_batches(merged.as_ref(), batch.as_ref(), params, seed);
        merged = rowbind_matrices(&[merged, corrected]);
        index_map.extend(batch_indices);
    }

    let res = reorder_to_original(merged.as_ref(), &index_map)?;

    log::debug!(
        "fastMNN over {} cells done in {:.2?}",
        res.nrows(),
        start.elapsed()
    );

    Ok(res)
}

/// Reorder corrected embedding back to original cell order
///
/// ### Params
///
/// * `corrected` - Output of the sequential merge (cells x dims).
/// * `output_to_original` - Mapping from output row -> original index
///
/// ### Returns
///
/// Reordered matrix matching original cell order
pub fn reorder_to_original(
    corrected: MatRef<f32>,
    output_to_original: &[usize],
) -> QcResult<Mat<f32>> {
    let n_cells = corrected.nrows();
    let n_pcs = corrected.ncols();

    let mut original_to_output = vec![usize::MAX; n_cells];
    for (output_idx, &original_idx) in output_to_original.iter().enumerate() {
        if original_idx >= n_cells || original_to_output[original_idx] != usize::MAX {
            return Err(QcError::InvalidInput(format!(
                "cell index {} is out of range or assigned to more than one batch",
                original_idx
            )));
        }
        original_to_output[original_idx] = output_idx;
    }

    Ok(Mat::from_fn(n_cells, n_pcs, |row, col| {
        corrected[(original_to_output[row], col)]
    }))
}
