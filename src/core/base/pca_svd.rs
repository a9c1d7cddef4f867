use faer::{Mat, MatRef};
use rand::prelude::*;
use rand_distr::Normal;

use crate::error::{QcError, QcResult};

////////////////
// Structures //
////////////////

/// Structure for random SVD results
///
/// ### Fields
///
/// * `u` - Matrix u of the SVD decomposition
/// * `v` - Matrix v of the SVD decomposition
/// * `s` - Singular values of the SVD decomposition
#[derive(Clone, Debug)]
pub struct RandomSvdResults<T> {
    pub u: faer::Mat<T>,
    pub v: faer::Mat<T>,
    pub s: Vec<T>,
}

/// A fitted PCA
///
/// Keeps the column centres (and optional scales) of the data it was fitted
/// on, so new observations can be projected into the same space without
/// refitting.
///
/// ### Fields
///
/// * `scores` - Embedding of the fitted rows (rows x components).
/// * `loadings` - Feature loadings (features x components).
/// * `centres` - Column means of the fitted data.
/// * `scales` - Column standard deviations if the data was scaled.
#[derive(Clone, Debug)]
pub struct PcaResult {
    pub scores: Mat<f32>,
    pub loadings: Mat<f32>,
    pub centres: Vec<f32>,
    pub scales: Option<Vec<f32>>,
}

impl PcaResult {
    /// Number of components
    pub fn n_components(&self) -> usize {
        self.loadings.ncols()
    }

    /// Project new observations into the fitted PCA space
    ///
    /// ### Params
    ///
    /// * `x` - New observations (rows x the same features as the fit).
    ///
    /// ### Returns
    ///
    /// The projected scores (rows x components).
    pub fn project(&self, x: MatRef<f32>) -> Mat<f32> {
        let standardised = self.standardise(x);
        &standardised * &self.loadings
    }

    fn standardise(&self, x: MatRef<f32>) -> Mat<f32> {
        Mat::from_fn(x.nrows(), x.ncols(), |i, j| {
            let centred = x[(i, j)] - self.centres[j];
            match &self.scales {
                Some(s) => centred / s[j],
                None => centred,
            }
        })
    }
}

///////////////
// Functions //
///////////////

/// Randomised SVD (f32)
///
/// ### Params
///
/// * `x` - The matrix on which to apply the randomised SVD.
/// * `rank` - The target rank of the approximation (number of singular values,
///   vectors to compute).
/// * `seed` - Random seed for reproducible results.
/// * `oversampling` - Additional samples beyond the target rank to improve
///   accuracy. Defaults to 10 if not specified.
/// * `n_power_iter` - Number of power iterations to perform for better
///   approximation quality. Defaults to 2 if not specified.
///
/// ### Returns
///
/// The randomised SVD results in form of `RandomSvdResults`.
///
/// ### Algorithm Details
///
/// 1. Generate a random Gaussian matrix Ω of size n × (rank + oversampling)
/// 2. Compute Y = X * Ω to capture the range of X
/// 3. Orthogonalize Y using QR decomposition to get Q
/// 4. Apply power iterations: for each iteration, compute Z = X^T * Q, then Q = QR(X * Z)
/// 5. Form B = Q^T * X and compute its SVD
/// 6. Reconstruct the final SVD: U = Q * U_B, V = V_B, S = S_B
pub fn randomised_svd_f32(
    x: MatRef<f32>,
    rank: usize,
    seed: u64,
    oversampling: Option<usize>,
    n_power_iter: Option<usize>,
) -> QcResult<RandomSvdResults<f32>> {
    let ncol = x.ncols();
    let nrow = x.nrows();

    let os = oversampling.unwrap_or(10);
    let sample_size = (rank + os).min(ncol.min(nrow));
    let n_iter = n_power_iter.unwrap_or(2);

    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0_f32, 1.0_f32)
        .map_err(|e| QcError::LinearAlgebra(format!("random projection: {}", e)))?;
    let omega = Mat::from_fn(ncol, sample_size, |_, _| normal.sample(&mut rng));

    let y = x * omega;

    let mut q = y.qr().compute_thin_Q();
    for _ in 0..n_iter {
        let z = x.transpose() * &q;
        q = (x * z).qr().compute_thin_Q();
    }

    let b = q.transpose() * x;
    let svd = b
        .thin_svd()
        .map_err(|e| QcError::LinearAlgebra(format!("randomised SVD: {:?}", e)))?;

    Ok(RandomSvdResults {
        u: &q * svd.U(),
        v: svd.V().to_owned(),
        s: svd.S().column_vector().iter().copied().collect(),
    })
}

/// Run a PCA on a dense observation x feature matrix
///
/// The number of components is capped at `min(n_pcs, n_rows - 1,
/// n_features)`. Component signs are fixed so that the largest absolute
/// loading of each component is positive, which keeps embeddings stable
/// between runs.
///
/// ### Params
///
/// * `x` - Observations x features.
/// * `n_pcs` - Requested number of components.
/// * `scale` - Scale the features to unit variance after centring.
/// * `random_svd` - Use the randomised SVD instead of the exact one.
/// * `seed` - Seed for the randomised SVD.
///
/// ### Returns
///
/// The fitted `PcaResult`.
pub fn run_pca(
    x: MatRef<f32>,
    n_pcs: usize,
    scale: bool,
    random_svd: bool,
    seed: u64,
) -> QcResult<PcaResult> {
    let (nrow, ncol) = (x.nrows(), x.ncols());
    let n_comp = n_pcs.min(nrow.saturating_sub(1)).min(ncol);
    if n_comp == 0 {
        return Err(QcError::EmptyInput(format!(
            "PCA needs at least two observations and one feature (got {} x {})",
            nrow, ncol
        )));
    }

    let centres: Vec<f32> = (0..ncol)
        .map(|j| (0..nrow).map(|i| x[(i, j)]).sum::<f32>() / nrow as f32)
        .collect();

    let scales = if scale {
        Some(
            (0..ncol)
                .map(|j| {
                    let var = (0..nrow)
                        .map(|i| (x[(i, j)] - centres[j]).powi(2))
                        .sum::<f32>()
                        / (nrow as f32 - 1.0).max(1.0);
                    let sd = var.sqrt();
                    if sd > 0.0 {
                        sd
                    } else {
                        1.0
                    }
                })
                .collect::<Vec<f32>>(),
        )
    } else {
        None
    };

    let standardised = Mat::from_fn(nrow, ncol, |i, j| {
        let centred = x[(i, j)] - centres[j];
        match &scales {
            Some(s) => centred / s[j],
            None => centred,
        }
    });

    let mut loadings = if random_svd {
        let res = randomised_svd_f32(standardised.as_ref(), n_comp, seed, None, None)?;
        res.v.submatrix(0, 0, ncol, n_comp).to_owned()
    } else {
        let res = standardised
            .thin_svd()
            .map_err(|e| QcError::LinearAlgebra(format!("SVD: {:?}", e)))?;
        res.V().submatrix(0, 0, ncol, n_comp).to_owned()
    };

    for c in 0..n_comp {
        let mut max_abs = 0.0_f32;
        let mut sign = 1.0_f32;
        for r in 0..ncol {
            let v = loadings[(r, c)];
            if v.abs() > max_abs {
                max_abs = v.abs();
                sign = v.signum();
            }
        }
        if sign < 0.0 {
            for r in 0..ncol {
                loadings[(r, c)] = -loadings[(r, c)];
            }
        }
    }

    let scores = &standardised * &loadings;

    Ok(PcaResult {
        scores,
        loadings,
        centres,
        scales,
    })
}
