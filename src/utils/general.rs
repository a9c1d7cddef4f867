use faer::{Mat, MatRef};
use std::collections::BTreeMap;

//////////////////
// VECTOR STUFF //
//////////////////

/// Group positions by their label
///
/// ### Params
///
/// * `labels` - Slice of labels, one per element.
///
/// ### Returns
///
/// Ordered map of label to the positions carrying that label. Positions
/// within each group keep their original order.
pub fn group_by_label<K>(labels: &[K]) -> BTreeMap<K, Vec<usize>>
where
    K: Ord + Clone,
{
    let mut groups: BTreeMap<K, Vec<usize>> = BTreeMap::new();
    for (idx, label) in labels.iter().enumerate() {
        groups.entry(label.clone()).or_default().push(idx);
    }
    groups
}

/// Squared Euclidean distance between two slices
#[inline]
pub fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for i in 0..a.len() {
        let diff = a[i] - b[i];
        sum += diff * diff;
    }
    sum
}

//////////////////
// MATRIX STUFF //
//////////////////

/// Copy the rows of a faer matrix into nested vectors
///
/// ### Params
///
/// * `mat` - The matrix
///
/// ### Returns
///
/// One `Vec<f32>` per row.
pub fn mat_to_rows(mat: MatRef<f32>) -> Vec<Vec<f32>> {
    (0..mat.nrows())
        .map(|i| (0..mat.ncols()).map(|j| mat[(i, j)]).collect())
        .collect()
}

/// Select a subset of rows of a faer matrix
///
/// ### Params
///
/// * `mat` - The matrix
/// * `rows` - Row indices to take, in the output order
///
/// ### Returns
///
/// The row subset as a new matrix
pub fn select_rows(mat: MatRef<f32>, rows: &[usize]) -> Mat<f32> {
    Mat::from_fn(rows.len(), mat.ncols(), |i, j| mat[(rows[i], j)])
}

/// Rowbind a vector of faer Matrices
///
/// The function will panic if the number of columns of the matrices differ in
/// the vector
///
/// ### Params
///
/// * `matrices` - Slice of faer matrix to row bind
///
/// ### Returns
///
/// One row bound matrix from the initial matrices
pub fn rowbind_matrices(matrices: &[Mat<f32>]) -> Mat<f32> {
    let ncols = matrices.first().map(|m| m.ncols()).unwrap_or(0);
    let total_row = matrices.iter().map(|m| m.nrows()).sum();
    let mut result: Mat<f32> = Mat::zeros(total_row, ncols);
    let mut row_offset = 0;
    for matrix in matrices {
        assert_eq!(
            matrix.ncols(),
            ncols,
            "All matrices must have the same number of columns"
        );
        let nrows = matrix.nrows();
        for i in 0..nrows {
            for j in 0..ncols {
                result[(row_offset + i, j)] = matrix[(i, j)]
            }
        }
        row_offset += nrows;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_by_label() {
        let labels = vec![2, 0, 2, 1, 0];
        let groups = group_by_label(&labels);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[&0], vec![1, 4]);
        assert_eq!(groups[&1], vec![3]);
        assert_eq!(groups[&2], vec![0, 2]);
    }

    #[test]
    fn test_rowbind_and_select() {
        let a = Mat::from_fn(2, 3, |i, j| (i * 3 + j) as f32);
        let b = Mat::from_fn(1, 3, |_, j| 10.0 + j as f32);
        let bound = rowbind_matrices(&[a, b]);
        assert_eq!(bound.nrows(), 3);
        assert_eq!(bound[(2, 1)], 11.0);

        let sub = select_rows(bound.as_ref(), &[2, 0]);
        assert_eq!(sub[(0, 0)], 10.0);
        assert_eq!(sub[(1, 2)], 2.0);
    }
}
