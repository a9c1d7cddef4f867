///////////////////
// Matrix macros //
///////////////////

/// Assertion that two matrices have the same number of columns.
#[macro_export]
macro_rules! assert_ncols {
    ($matrix1:expr, $matrix2:expr) => {
        assert_eq!(
            $matrix1.ncols(),
            $matrix2.ncols(),
            "Matrices have different number of columns: {} != {}",
            $matrix1.ncols(),
            $matrix2.ncols()
        );
    };
}

///////////////////
// Vector macros //
///////////////////

/// Assertion that all vectors have the same length.
#[macro_export]
macro_rules! assert_same_len {
    ($($vec:expr),+ $(,)?) => {
        {
            let lengths: Vec<usize> = vec![$($vec.len()),+];
            let first_len = lengths[0];

            if !lengths.iter().all(|&len| len == first_len) {
                panic!(
                    "Vectors have different lengths: {:?}",
                    lengths
                );
            }
        }
    };
}
