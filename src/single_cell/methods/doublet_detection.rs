use faer::{Mat, MatRef};
use rand::prelude::*;
use rayon::prelude::*;
use serde::Deserialize;
use std::time::Instant;

use crate::assert_ncols;
use crate::core::base::loess::tricube_weight;
use crate::core::base::pca_svd::run_pca;
use crate::core::data::sparse_structures::CountMatrix;
use crate::error::QcResult;
use crate::single_cell::hvg::{select_hvgs, HvgParams};
use crate::single_cell::processing::{log_norm, log_normalised_dense};
use crate::utils::general::{mat_to_rows, squared_euclidean};

////////////
// Params //
////////////

/// Structure to store the doublet scoring parameters
///
/// ### Fields
///
/// **Doublet simulation:**
///
/// * `n_simulated` - Number of simulated doublets per sample.
/// * `neighbourhood_divisor` - The density neighbourhood holds
///   `n_simulated / neighbourhood_divisor` points.
///
/// **Embedding:**
///
/// * `n_pcs` - Number of principal components (capped at the number of
///   cells minus one).
/// * `random_svd` - Use the randomised SVD for the PCA.
/// * `hvg` - Parameters of the highly variable gene selection.
///
/// **General:**
///
/// * `min_cells` - Samples with fewer cells get undefined scores.
/// * `seed` - Seed for the simulation and the randomised SVD.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DoubletParams {
    // simulation
    pub n_simulated: usize,
    pub neighbourhood_divisor: usize,
    // embedding
    pub n_pcs: usize,
    pub random_svd: bool,
    pub hvg: HvgParams,
    // general
    pub min_cells: usize,
    pub seed: u64,
}

impl Default for DoubletParams {
    fn default() -> Self {
        Self {
            n_simulated: 10_000,
            neighbourhood_divisor: 10,
            n_pcs: 50,
            random_svd: false,
            hvg: HvgParams::default(),
            min_cells: 3,
            seed: 42,
        }
    }
}

/////////////
// Results //
/////////////

/// Doublet scores of one sample
///
/// ### Fields
///
/// * `scores` - Score per cell in the order of the scored cells; `None`
///   where the density estimate is degenerate.
/// * `hvgs` - Genes used for the embedding.
/// * `n_pcs` - Number of principal components actually used.
/// * `neighbourhood` - Number of points in the density neighbourhood.
#[derive(Clone, Debug)]
pub struct DoubletScores {
    pub scores: Vec<Option<f64>>,
    pub hvgs: Vec<usize>,
    pub n_pcs: usize,
    pub neighbourhood: usize,
}

impl DoubletScores {
    fn undefined(n_cells: usize) -> Self {
        Self {
            scores: vec![None; n_cells],
            hvgs: Vec::new(),
            n_pcs: 0,
            neighbourhood: 0,
        }
    }

    /// Number of cells with a defined score
    pub fn n_defined(&self) -> usize {
        self.scores.iter().filter(|s| s.is_some()).count()
    }
}

/////////////
// Helpers //
/////////////

/// Simulate doublets from random pairs of cells
///
/// Pairs are drawn uniformly with replacement. The profile of a pair is the
/// sum of the raw counts on the selected genes divided by the sum of the two
/// size factors, then log-transformed like the real cells.
///
/// ### Params
///
/// * `counts` - Raw counts (cells x genes).
/// * `cells` - The cells of the sample.
/// * `genes` - The genes to keep (columns of the output).
/// * `size_factors` - Size factor per cell of the full dataset.
/// * `n_simulated` - Number of doublets to simulate.
/// * `seed` - Seed for reproducibility purposes.
///
/// ### Returns
///
/// The log-expression of the simulated doublets (n_simulated x genes)
pub fn simulate_doublets(
    counts: &CountMatrix,
    cells: &[usize],
    genes: &[usize],
    size_factors: &[f64],
    n_simulated: usize,
    seed: u64,
) -> Mat<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let n = cells.len();
    let pairs: Vec<(usize, usize)> = (0..n_simulated)
        .map(|_| (cells[rng.random_range(0..n)], cells[rng.random_range(0..n)]))
        .collect();

    let mut gene_pos = vec![usize::MAX; counts.shape().1];
    for (j, &g) in genes.iter().enumerate() {
        gene_pos[g] = j;
    }

    let rows: Vec<Vec<f32>> = pairs
        .par_iter()
        .map(|&(a, b)| {
            let mut summed = vec![0_u64; genes.len()];
            for cell in [a, b] {
                let (idx, vals) = counts.row(cell);
                for (&g, &v) in idx.iter().zip(vals.iter()) {
                    let j = gene_pos[g];
                    if j != usize::MAX {
                        summed[j] += u64::from(v);
                    }
                }
            }
            let sf = size_factors[a] + size_factors[b];
            summed
                .iter()
                .map(|&v| log_norm(v as f64, sf) as f32)
                .collect()
        })
        .collect();

    Mat::from_fn(n_simulated, genes.len(), |i, j| rows[i][j])
}

/// Ratio of simulated doublet to real cell density at every real cell
///
/// The bandwidth of each cell is the distance to its `k`-th nearest point
/// among all real and simulated points (the cell itself excluded). Points
/// within the bandwidth are weighted with the tricube kernel; the cell
/// itself enters the real density with weight one. Both densities are
/// normalised by their number of points.
///
/// ### Params
///
/// * `real` - Embedding of the real cells (cells x dims).
/// * `simulated` - Embedding of the simulated doublets (n_sim x dims).
/// * `k` - Neighbourhood size; capped at the number of other points.
///
/// ### Returns
///
/// Score per real cell; `None` if the bandwidth is zero or not finite.
pub fn density_ratio_scores(
    real: MatRef<f32>,
    simulated: MatRef<f32>,
    k: usize,
) -> Vec<Option<f64>> {
    assert_ncols!(real, simulated);

    let n_real = real.nrows();
    let n_sim = simulated.nrows();
    let k = k.min((n_real + n_sim).saturating_sub(1)).max(1);

    let real_rows = mat_to_rows(real);
    let sim_rows = mat_to_rows(simulated);

    real_rows
        .par_iter()
        .enumerate()
        .map(|(i, query)| {
            let d_real: Vec<f64> = real_rows
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, r)| (squared_euclidean(query, r) as f64).sqrt())
                .collect();
            let d_sim: Vec<f64> = sim_rows
                .iter()
                .map(|s| (squared_euclidean(query, s) as f64).sqrt())
                .collect();

            let mut pooled: Vec<f64> = d_real.iter().chain(d_sim.iter()).copied().collect();
            if pooled.len() < k {
                return None;
            }
            let (_, kth, _) = pooled.select_nth_unstable_by(k - 1, |a, b| a.total_cmp(b));
            let bandwidth = *kth;
            if !bandwidth.is_finite() || bandwidth <= 0.0 {
                return None;
            }

            let w_real: f64 = 1.0
                + d_real
                    .iter()
                    .map(|d| tricube_weight(d / bandwidth))
                    .sum::<f64>();
            let w_sim: f64 = d_sim.iter().map(|d| tricube_weight(d / bandwidth)).sum();

            let density_real = w_real / n_real as f64;
            let density_sim = w_sim / n_sim as f64;
            let score = density_sim / density_real;
            if score.is_finite() {
                Some(score)
            } else {
                None
            }
        })
        .collect()
}

////////////////////
// Main structure //
////////////////////

/// Doublet scorer for a single sample
///
/// ### Fields
///
/// * `counts` - Raw counts of the full dataset (cells x genes).
/// * `size_factors` - Size factors of the full dataset.
/// * `cells` - The cells of the sample.
/// * `params` - The `DoubletParams`.
#[derive(Clone, Debug)]
pub struct DoubletScorer<'a> {
    counts: &'a CountMatrix,
    size_factors: &'a [f64],
    cells: &'a [usize],
    params: DoubletParams,
}

impl<'a> DoubletScorer<'a> {
    /// Generate a new instance
    pub fn new(
        counts: &'a CountMatrix,
        size_factors: &'a [f64],
        cells: &'a [usize],
        params: DoubletParams,
    ) -> Self {
        Self {
            counts,
            size_factors,
            cells,
            params,
        }
    }

    /// Neighbourhood size of the density estimate
    pub fn neighbourhood_size(&self) -> usize {
        (self.params.n_simulated / self.params.neighbourhood_divisor.max(1)).max(1)
    }

    /// Run the scoring
    ///
    /// ### Returns
    ///
    /// The `DoubletScores`, one score per cell of the sample.
    pub fn run_scoring(&self) -> QcResult<DoubletScores> {
        let n_cells = self.cells.len();
        if n_cells < self.params.min_cells.max(2) || self.params.n_simulated == 0 {
            log::warn!(
                "{} cells are too few for a density estimate; doublet scores are undefined",
                n_cells
            );
            return Ok(DoubletScores::undefined(n_cells));
        }

        let start_all = Instant::now();

        log::debug!("Identifying highly variable genes...");
        let hvg = select_hvgs(self.counts, self.cells, self.size_factors, &self.params.hvg)?;

        let start_pca = Instant::now();
        let log_expr =
            log_normalised_dense(self.counts, self.cells, &hvg.selected, self.size_factors);
        let pca = run_pca(
            log_expr.as_ref(),
            self.params.n_pcs,
            false,
            self.params.random_svd,
            self.params.seed,
        )?;
        log::debug!(
            "PCA with {} components done in {:.2?}",
            pca.n_components(),
            start_pca.elapsed()
        );

        let start_sim = Instant::now();
        let simulated = simulate_doublets(
            self.counts,
            self.cells,
            &hvg.selected,
            self.size_factors,
            self.params.n_simulated,
            self.params.seed,
        );
        let sim_embd = pca.project(simulated.as_ref());
        log::debug!(
            "Simulated and projected {} doublets in {:.2?}",
            self.params.n_simulated,
            start_sim.elapsed()
        );

        let start_density = Instant::now();
        let neighbourhood = self.neighbourhood_size();
        let scores = density_ratio_scores(pca.scores.as_ref(), sim_embd.as_ref(), neighbourhood);
        log::debug!(
            "Density estimates done in {:.2?}",
            start_density.elapsed()
        );

        let res = DoubletScores {
            scores,
            hvgs: hvg.selected,
            n_pcs: pca.n_components(),
            neighbourhood,
        };

        if res.n_defined() < n_cells {
            log::warn!(
                "{} of {} cells have an undefined doublet score",
                n_cells - res.n_defined(),
                n_cells
            );
        }
        log::debug!("Finished doublet scoring in {:.2?}", start_all.elapsed());

        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::*;

    fn sample_with_doublets(seed: u64) -> SyntheticSample {
        // nine small types keep the marker genes from dominating the trend
        let config = SyntheticSampleConfig {
            cell_type_sizes: vec![10; 9],
            markers_per_type: 6,
            markers_per_cell: (6, 6),
            seed,
            ..Default::default()
        };
        let sample = create_celltype_sparse_csr_data(&config);
        let pairs = random_doublet_pairs(&sample, 0, 1, 10, seed + 1000);
        inject_doublets(sample, &pairs).unwrap()
    }

    #[test]
    fn test_simulated_doublets_are_normalised_sums() {
        let counts = CountMatrix::from_triplets_csr(
            &[0, 1, 1],
            &[0, 0, 1],
            &[4, 2, 6],
            (2, 2),
        )
        .unwrap();
        let sf = vec![1.0, 2.0];
        let sim = simulate_doublets(&counts, &[0, 1], &[0, 1], &sf, 50, 1);
        assert_eq!(sim.nrows(), 50);
        let allowed = |v: f32, c: f64, s: f64| (v as f64 - log_norm(c, s)).abs() < 1e-5;
        for i in 0..50 {
            let g0 = sim[(i, 0)];
            // either (0, 0), (0, 1) or (1, 1)
            assert!(
                allowed(g0, 8.0, 2.0) || allowed(g0, 6.0, 3.0) || allowed(g0, 4.0, 4.0),
                "unexpected simulated value {}",
                g0
            );
        }
    }

    #[test]
    fn test_simulated_counts_beyond_u32() {
        let counts =
            CountMatrix::from_triplets_csr(&[0, 1], &[0, 0], &[u32::MAX, u32::MAX], (2, 1))
                .unwrap();
        let sim = simulate_doublets(&counts, &[0, 1], &[0], &[1.0, 1.0], 5, 3);
        let expected = log_norm(2.0 * u32::MAX as f64, 2.0) as f32;
        for i in 0..5 {
            assert!((sim[(i, 0)] - expected).abs() < 1e-3);
        }
    }

    #[test]
    fn test_density_ratio_higher_in_simulated_region() {
        // real cells around 0, simulated doublets around 5, one real cell at 5
        let real = Mat::from_fn(21, 1, |i, _| if i == 20 { 5.0 } else { i as f32 * 0.05 });
        let sim = Mat::from_fn(40, 1, |i, _| 4.5 + i as f32 * 0.025);
        let scores = density_ratio_scores(real.as_ref(), sim.as_ref(), 10);
        let outlier = scores[20].unwrap();
        let bulk = scores[5].unwrap();
        assert!(outlier > bulk, "outlier {} vs bulk {}", outlier, bulk);
        assert!(bulk < 1e-6);
    }

    #[test]
    fn test_degenerate_bandwidth_is_undefined() {
        let real = Mat::<f32>::zeros(5, 2);
        let sim = Mat::<f32>::zeros(10, 2);
        let scores = density_ratio_scores(real.as_ref(), sim.as_ref(), 3);
        assert!(scores.iter().all(|s| s.is_none()));
    }

    #[test]
    fn test_small_samples_are_undefined() {
        let sample = sample_with_doublets(1);
        let sf = vec![1.0; sample.n_cells()];
        let cells = vec![0, 1];
        let scorer = DoubletScorer::new(&sample.counts, &sf, &cells, DoubletParams::default());
        let res = scorer.run_scoring().unwrap();
        assert_eq!(res.scores, vec![None, None]);
    }

    #[test]
    fn test_injected_doublets_score_higher() {
        for seed in [1_u64, 2, 3] {
            let sample = sample_with_doublets(seed);
            let sf = vec![1.0; sample.n_cells()];
            let cells: Vec<usize> = (0..sample.n_cells()).collect();
            let params = DoubletParams {
                n_simulated: 2000,
                seed,
                ..Default::default()
            };
            let res = DoubletScorer::new(&sample.counts, &sf, &cells, params)
                .run_scoring()
                .unwrap();
            assert_eq!(res.scores.len(), 100);
            assert_eq!(res.neighbourhood, 200);
            // the markers of both source types carry the doublet signal
            for g in 0..12 {
                assert!(res.hvgs.contains(&g), "seed {}: marker {} not selected", seed, g);
            }

            let is_doublet = sample.is_doublet();
            let mean_of = |want: bool| {
                let vals: Vec<f64> = res
                    .scores
                    .iter()
                    .zip(is_doublet.iter())
                    .filter(|(_, &d)| d == want)
                    .filter_map(|(s, _)| *s)
                    .collect();
                vals.iter().sum::<f64>() / vals.len() as f64
            };
            let doublets = mean_of(true);
            let singlets = mean_of(false);
            assert!(
                doublets > 2.0 * singlets,
                "seed {}: doublets {} vs singlets {}",
                seed,
                doublets,
                singlets
            );
        }
    }
}
