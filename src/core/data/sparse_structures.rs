use crate::error::{QcError, QcResult};

//////////////////////////////
// Sparse format conversion //
//////////////////////////////

/// Type to describe the CompressedSparseFormat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressedSparseFormat {
    /// CSC-formatted data
    Csc,
    /// CSR-formatted data
    Csr,
}

/// Compressed sparse matrix (CSR or CSC)
///
/// ### Fields
///
/// * `data` - The non-zero values.
/// * `indices` - Column indices (CSR) or row indices (CSC) of the values.
/// * `indptr` - Row pointers (CSR) or column pointers (CSC).
/// * `cs_type` - Which of the two layouts is stored.
/// * `shape` - `(nrow, ncol)` of the matrix.
#[derive(Debug, Clone)]
pub struct CompressedSparseData<T>
where
    T: Clone + Default,
{
    pub data: Vec<T>,
    pub indices: Vec<usize>,
    pub indptr: Vec<usize>,
    pub cs_type: CompressedSparseFormat,
    pub shape: (usize, usize),
}

/// Raw UMI counts, cells in rows and genes in columns
pub type CountMatrix = CompressedSparseData<u32>;

impl<T> CompressedSparseData<T>
where
    T: Clone + Default,
{
    /// Generate a new CSR version of the matrix
    ///
    /// ### Params
    ///
    /// * `data` - The underlying data
    /// * `indices` - The column indices of the data
    /// * `indptr` - The row pointers
    /// * `shape` - `(nrow, ncol)`
    ///
    /// ### Returns
    ///
    /// The matrix, or an error if the pointers and indices are inconsistent
    /// with the shape.
    pub fn new_csr(
        data: Vec<T>,
        indices: Vec<usize>,
        indptr: Vec<usize>,
        shape: (usize, usize),
    ) -> QcResult<Self> {
        let res = Self {
            data,
            indices,
            indptr,
            cs_type: CompressedSparseFormat::Csr,
            shape,
        };
        res.validate()?;
        Ok(res)
    }

    /// Build a CSR matrix from coordinate triplets
    ///
    /// Duplicated coordinates are kept as separate entries; callers that need
    /// them merged should do so beforehand.
    ///
    /// ### Params
    ///
    /// * `rows` - Row index per entry
    /// * `cols` - Column index per entry
    /// * `vals` - Value per entry
    /// * `shape` - `(nrow, ncol)`
    ///
    /// ### Returns
    ///
    /// The CSR matrix with column indices sorted within each row.
    pub fn from_triplets_csr(
        rows: &[usize],
        cols: &[usize],
        vals: &[T],
        shape: (usize, usize),
    ) -> QcResult<Self> {
        if rows.len() != cols.len() || rows.len() != vals.len() {
            return Err(QcError::DimensionMismatch(format!(
                "triplets of different lengths: {} rows, {} cols, {} values",
                rows.len(),
                cols.len(),
                vals.len()
            )));
        }
        let (nrow, ncol) = shape;
        let mut entries: Vec<(usize, usize, T)> = Vec::with_capacity(rows.len());
        for ((&r, &c), v) in rows.iter().zip(cols.iter()).zip(vals.iter()) {
            if r >= nrow || c >= ncol {
                return Err(QcError::DimensionMismatch(format!(
                    "entry ({}, {}) outside of a {} x {} matrix",
                    r, c, nrow, ncol
                )));
            }
            entries.push((r, c, v.clone()));
        }
        entries.sort_by_key(|(r, c, _)| (*r, *c));

        let mut indptr = vec![0_usize; nrow + 1];
        for (r, _, _) in &entries {
            indptr[r + 1] += 1;
        }
        for i in 0..nrow {
            indptr[i + 1] += indptr[i];
        }
        let (indices, data): (Vec<usize>, Vec<T>) =
            entries.into_iter().map(|(_, c, v)| (c, v)).unzip();

        Ok(Self {
            data,
            indices,
            indptr,
            cs_type: CompressedSparseFormat::Csr,
            shape,
        })
    }

    fn validate(&self) -> QcResult<()> {
        let n_major = match self.cs_type {
            CompressedSparseFormat::Csr => self.shape.0,
            CompressedSparseFormat::Csc => self.shape.1,
        };
        let n_minor = match self.cs_type {
            CompressedSparseFormat::Csr => self.shape.1,
            CompressedSparseFormat::Csc => self.shape.0,
        };
        if self.indptr.len() != n_major + 1 {
            return Err(QcError::DimensionMismatch(format!(
                "index pointer of length {} for {} major elements",
                self.indptr.len(),
                n_major
            )));
        }
        if self.indices.len() != self.data.len()
            || self.indptr.last().copied() != Some(self.data.len())
        {
            return Err(QcError::DimensionMismatch(
                "index pointer, indices and data disagree on the number of entries".to_string(),
            ));
        }
        if self.indptr.windows(2).any(|w| w[0] > w[1]) {
            return Err(QcError::InvalidInput(
                "index pointer is not monotonically increasing".to_string(),
            ));
        }
        if self.indices.iter().any(|&i| i >= n_minor) {
            return Err(QcError::DimensionMismatch(format!(
                "index out of bounds for {} minor elements",
                n_minor
            )));
        }
        Ok(())
    }

    /// Transform from CSC to CSR or vice versa
    ///
    /// ### Returns
    ///
    /// The transformed version (same matrix, other layout)
    pub fn transform(self) -> Self {
        match self.cs_type {
            CompressedSparseFormat::Csc => csc_to_csr(self),
            CompressedSparseFormat::Csr => csr_to_csc(self),
        }
    }

    /// Returns the shape of the matrix
    ///
    /// ### Returns
    ///
    /// A tuple of `(nrow, ncol)`
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Returns the NNZ
    pub fn get_nnz(&self) -> usize {
        self.data.len()
    }

    /// Get one row of a CSR matrix
    ///
    /// ### Params
    ///
    /// * `i` - Row index
    ///
    /// ### Returns
    ///
    /// Tuple of `(column_indices, values)`
    #[inline]
    pub fn row(&self, i: usize) -> (&[usize], &[T]) {
        debug_assert_eq!(self.cs_type, CompressedSparseFormat::Csr);
        let start = self.indptr[i];
        let end = self.indptr[i + 1];
        (&self.indices[start..end], &self.data[start..end])
    }
}

impl CountMatrix {
    /// Library size (total counts) per row
    ///
    /// ### Returns
    ///
    /// Vector with the summed counts of each row
    pub fn library_sizes(&self) -> Vec<u64> {
        (0..self.shape.0)
            .map(|i| self.row(i).1.iter().map(|&v| v as u64).sum())
            .collect()
    }
}

/// Transforms a CompressedSparseData that is CSC to CSR
///
/// ### Params
///
/// * `sparse_data` - The CompressedSparseData you want to transform
pub fn csc_to_csr<T>(sparse_data: CompressedSparseData<T>) -> CompressedSparseData<T>
where
    T: Clone + Default,
{
    let (nrow, _) = sparse_data.shape();
    let nnz = sparse_data.get_nnz();
    let mut row_ptr = vec![0; nrow + 1];

    for &r in &sparse_data.indices {
        row_ptr[r + 1] += 1;
    }

    for i in 0..nrow {
        row_ptr[i + 1] += row_ptr[i];
    }

    let mut csr_data = vec![T::default(); nnz];
    let mut csr_col_ind = vec![0; nnz];
    let mut next = row_ptr[..nrow].to_vec();

    for col in 0..(sparse_data.indptr.len() - 1) {
        for idx in sparse_data.indptr[col]..sparse_data.indptr[col + 1] {
            let row = sparse_data.indices[idx];
            let pos = next[row];

            csr_data[pos] = sparse_data.data[idx].clone();
            csr_col_ind[pos] = col;

            next[row] += 1;
        }
    }

    CompressedSparseData {
        data: csr_data,
        indices: csr_col_ind,
        indptr: row_ptr,
        cs_type: CompressedSparseFormat::Csr,
        shape: sparse_data.shape(),
    }
}

/// Transform CSR stored data into CSC stored data
///
/// This version does a full memory copy of the data.
///
/// ### Params
///
/// * `sparse_data` - The data stored in CSR format.
///
/// ### Returns
///
/// The data in CSC format
pub fn csr_to_csc<T>(sparse_data: CompressedSparseData<T>) -> CompressedSparseData<T>
where
    T: Clone + Default,
{
    let nnz = sparse_data.get_nnz();
    let (_, ncol) = sparse_data.shape();
    let mut col_ptr = vec![0; ncol + 1];

    for &c in &sparse_data.indices {
        col_ptr[c + 1] += 1;
    }

    for i in 0..ncol {
        col_ptr[i + 1] += col_ptr[i];
    }

    let mut csc_data = vec![T::default(); nnz];
    let mut csc_row_ind = vec![0; nnz];
    let mut next = col_ptr[..ncol].to_vec();

    for row in 0..(sparse_data.indptr.len() - 1) {
        for idx in sparse_data.indptr[row]..sparse_data.indptr[row + 1] {
            let col = sparse_data.indices[idx];
            let pos = next[col];

            csc_data[pos] = sparse_data.data[idx].clone();
            csc_row_ind[pos] = row;

            next[col] += 1;
        }
    }

    CompressedSparseData {
        data: csc_data,
        indices: csc_row_ind,
        indptr: col_ptr,
        cs_type: CompressedSparseFormat::Csc,
        shape: sparse_data.shape(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_counts() -> CountMatrix {
        // [[1, 0, 2],
        //  [0, 3, 0]]
        CountMatrix::from_triplets_csr(&[1, 0, 0], &[1, 2, 0], &[3, 2, 1], (2, 3)).unwrap()
    }

    #[test]
    fn test_from_triplets_sorted() {
        let m = small_counts();
        assert_eq!(m.indptr, vec![0, 2, 3]);
        assert_eq!(m.row(0), (&[0_usize, 2][..], &[1_u32, 2][..]));
        assert_eq!(m.row(1), (&[1_usize][..], &[3_u32][..]));
    }

    #[test]
    fn test_out_of_bounds_triplet() {
        let res = CountMatrix::from_triplets_csr(&[2], &[0], &[1], (2, 3));
        assert!(res.is_err());
    }

    #[test]
    fn test_csr_csc_round_trip() {
        let m = small_counts();
        let back = m.clone().transform().transform();
        assert_eq!(back.indptr, m.indptr);
        assert_eq!(back.indices, m.indices);
        assert_eq!(back.data, m.data);
    }

    #[test]
    fn test_library_sizes() {
        let m = small_counts();
        assert_eq!(m.library_sizes(), vec![3, 3]);
        assert_eq!(m.get_nnz(), 3);
    }

    #[test]
    fn test_new_csr_validates() {
        assert!(CountMatrix::new_csr(vec![1], vec![5], vec![0, 1], (1, 3)).is_err());
        assert!(CountMatrix::new_csr(vec![1], vec![2], vec![0, 1], (1, 3)).is_ok());
    }
}
