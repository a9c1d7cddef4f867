use serde::Deserialize;
use std::time::Instant;

use crate::core::base::loess::{LoessDegree, LoessRegression};
use crate::core::base::stats::{calc_fdr, chi_squared_upper_pval};
use crate::core::data::sparse_structures::CountMatrix;
use crate::error::{QcError, QcResult};
use crate::single_cell::processing::gene_log_mean_var;

////////////
// Params //
////////////

/// Parameters for the highly variable gene selection
///
/// ### Fields
///
/// * `fdr_threshold` - Genes with a trend-deviation FDR below this value are
///   selected.
/// * `loess_span` - Span of the loess fit of the mean-variance trend.
/// * `loess_degree` - Degree of the local polynomials (`linear` or
///   `quadratic`).
/// * `loess_robust_iters` - Bisquare robustness iterations of the trend
///   fit. Marker genes shared by several populations sit close together on
///   the mean axis; without these iterations they pull the trend up to
///   their own variance.
/// * `min_hvgs` - If fewer genes pass the FDR threshold, the genes with the
///   largest variance over trend ratio are taken instead.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HvgParams {
    pub fdr_threshold: f64,
    pub loess_span: f64,
    pub loess_degree: LoessDegree,
    pub loess_robust_iters: usize,
    pub min_hvgs: usize,
}

impl Default for HvgParams {
    fn default() -> Self {
        Self {
            fdr_threshold: 0.05,
            loess_span: 0.3,
            loess_degree: LoessDegree::Linear,
            loess_robust_iters: 4,
            min_hvgs: 10,
        }
    }
}

/////////////
// Results //
/////////////

/// Results of the HVG selection
///
/// All vectors are over all genes. Genes without expression have a `NaN`
/// trend and p-values/FDR of `1.0`.
///
/// ### Fields
///
/// * `mean` - Mean log-expression per gene.
/// * `var` - Variance of the log-expression per gene.
/// * `trend` - Fitted variance at the gene's mean.
/// * `p_values` - Upper tail p-value of the variance against the trend.
/// * `fdr` - Benjamini-Hochberg adjusted p-values.
/// * `selected` - Indices of the selected genes, sorted.
/// * `fallback` - The FDR threshold gave fewer than `min_hvgs` genes and the
///   top genes by variance ratio were taken.
#[derive(Clone, Debug)]
pub struct HvgResult {
    pub mean: Vec<f64>,
    pub var: Vec<f64>,
    pub trend: Vec<f64>,
    pub p_values: Vec<f64>,
    pub fdr: Vec<f64>,
    pub selected: Vec<usize>,
    pub fallback: bool,
}

///////////////
// Functions //
///////////////

/// Select highly variable genes from per gene means and variances
///
/// Fits a robust loess trend of the variance on the mean over the expressed
/// genes.
/// Under the null, `(n - 1) * var / trend` follows a chi-squared distribution
/// with `n - 1` degrees of freedom.
///
/// ### Params
///
/// * `mean` - Mean log-expression per gene.
/// * `var` - Variance of the log-expression per gene.
/// * `n_cells` - Number of cells the statistics are based on.
/// * `params` - The `HvgParams`.
///
/// ### Returns
///
/// The `HvgResult`
pub fn select_hvgs_from_stats(
    mean: Vec<f64>,
    var: Vec<f64>,
    n_cells: usize,
    params: &HvgParams,
) -> QcResult<HvgResult> {
    let n_genes = mean.len();
    let expressed: Vec<usize> = (0..n_genes).filter(|&g| mean[g] > 0.0).collect();
    if expressed.is_empty() {
        return Err(QcError::EmptyInput(
            "no expressed genes for the HVG selection".to_string(),
        ));
    }
    if n_cells < 2 {
        return Err(QcError::EmptyInput(format!(
            "at least two cells are needed to estimate gene variances, got {}",
            n_cells
        )));
    }

    let x: Vec<f64> = expressed.iter().map(|&g| mean[g]).collect();
    let y: Vec<f64> = expressed.iter().map(|&g| var[g]).collect();
    let loess = LoessRegression::new(params.loess_span, params.loess_degree)?
        .with_robust_iterations(params.loess_robust_iters);
    let fit = loess.fit(&x, &y);

    let mut trend = vec![f64::NAN; n_genes];
    let mut p_values = vec![1.0; n_genes];
    let df = (n_cells - 1) as f64;

    for (pos, &g) in expressed.iter().enumerate() {
        let t = fit.fitted[pos];
        trend[g] = t;
        if t.is_finite() && t > 0.0 {
            p_values[g] = chi_squared_upper_pval(df * var[g] / t, df);
        }
    }

    let tested_p: Vec<f64> = expressed.iter().map(|&g| p_values[g]).collect();
    let tested_fdr = calc_fdr(&tested_p);
    let mut fdr = vec![1.0; n_genes];
    for (pos, &g) in expressed.iter().enumerate() {
        fdr[g] = tested_fdr[pos];
    }

    let mut selected: Vec<usize> = expressed
        .iter()
        .copied()
        .filter(|&g| fdr[g] < params.fdr_threshold)
        .collect();

    let mut fallback = false;
    if selected.len() < params.min_hvgs {
        fallback = true;
        let mut ratios: Vec<(usize, f64)> = expressed
            .iter()
            .filter(|&&g| trend[g].is_finite() && trend[g] > 0.0)
            .map(|&g| (g, var[g] / trend[g]))
            .collect();
        ratios.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        selected = ratios
            .into_iter()
            .take(params.min_hvgs)
            .map(|(g, _)| g)
            .collect();
        if selected.is_empty() {
            selected = expressed.clone();
        }
        selected.sort_unstable();
    }

    Ok(HvgResult {
        mean,
        var,
        trend,
        p_values,
        fdr,
        selected,
        fallback,
    })
}

/// Select highly variable genes in a set of cells
///
/// ### Params
///
/// * `counts` - Raw counts (cells x genes).
/// * `cells` - The cells to consider.
/// * `size_factors` - Size factor per cell of the full dataset.
/// * `params` - The `HvgParams`.
///
/// ### Returns
///
/// The `HvgResult`
pub fn select_hvgs(
    counts: &CountMatrix,
    cells: &[usize],
    size_factors: &[f64],
    params: &HvgParams,
) -> QcResult<HvgResult> {
    let start = Instant::now();

    let (mean, var) = gene_log_mean_var(counts, cells, size_factors);
    let res = select_hvgs_from_stats(mean, var, cells.len(), params)?;

    if res.fallback {
        log::warn!(
            "Fewer than {} genes passed the HVG threshold; using the top {} genes by variance ratio",
            params.min_hvgs,
            res.selected.len()
        );
    }
    log::debug!(
        "Selected {} highly variable genes over {} cells. Done in {:.2?}",
        res.selected.len(),
        cells.len(),
        start.elapsed()
    );

    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::*;

    /// 200 genes on a flat variance trend of about 0.2; genes 7, 47, 87, 127
    /// and 167 have a strongly inflated variance
    fn trend_with_outliers() -> (Vec<f64>, Vec<f64>) {
        let mean: Vec<f64> = (0..200).map(|g| 0.1 + g as f64 * 0.01).collect();
        let var: Vec<f64> = (0..200)
            .map(|g| if g % 40 == 7 { 1.5 } else { 0.2 + (g % 3) as f64 * 0.01 })
            .collect();
        (mean, var)
    }

    #[test]
    fn test_inflated_genes_are_selected() {
        let (mean, var) = trend_with_outliers();
        let params = HvgParams {
            min_hvgs: 5,
            ..Default::default()
        };
        let res = select_hvgs_from_stats(mean, var, 100, &params).unwrap();
        assert!(!res.fallback);
        assert_eq!(res.selected, vec![7, 47, 87, 127, 167]);
        assert!(res.fdr[7] < 0.05);
        assert!(res.fdr[8] > 0.05);
    }

    #[test]
    fn test_fallback_to_top_ratio() {
        let (mean, var) = trend_with_outliers();
        let params = HvgParams {
            min_hvgs: 8,
            ..Default::default()
        };
        let res = select_hvgs_from_stats(mean, var, 100, &params).unwrap();
        assert!(res.fallback);
        assert_eq!(res.selected.len(), 8);
        for g in [7, 47, 87, 127, 167] {
            assert!(res.selected.contains(&g));
        }
    }

    #[test]
    fn test_markers_shared_by_two_types_are_selected() {
        // doublets of types 0 and 1 double the frequency of their markers,
        // which puts those twelve genes next to each other on the mean axis
        let config = SyntheticSampleConfig {
            cell_type_sizes: vec![10; 9],
            markers_per_type: 6,
            markers_per_cell: (6, 6),
            seed: 11,
            ..Default::default()
        };
        let sample = create_celltype_sparse_csr_data(&config);
        let pairs = random_doublet_pairs(&sample, 0, 1, 10, 5);
        let sample = inject_doublets(sample, &pairs).unwrap();
        let cells: Vec<usize> = (0..sample.n_cells()).collect();
        let sf = vec![1.0; sample.n_cells()];

        let res = select_hvgs(&sample.counts, &cells, &sf, &HvgParams::default()).unwrap();
        assert!(!res.fallback);
        for g in 0..12 {
            assert!(
                res.selected.contains(&g),
                "shared marker {}: var {:.3}, trend {:.3}, fdr {:.3e}",
                g,
                res.var[g],
                res.trend[g],
                res.fdr[g]
            );
            assert!(res.trend[g] < 0.5 * res.var[g]);
        }
        // markers only, no housekeeping genes
        assert_eq!(res.selected, (0..54).collect::<Vec<_>>());
    }

    #[test]
    fn test_unexpressed_genes_are_ignored() {
        let mut mean = vec![0.0; 50];
        let mut var = vec![0.0; 50];
        for g in 10..50 {
            mean[g] = g as f64 * 0.05;
            var[g] = 0.3;
        }
        let res = select_hvgs_from_stats(mean, var, 50, &HvgParams::default()).unwrap();
        assert!(res.trend[0].is_nan());
        assert_eq!(res.p_values[0], 1.0);
        assert!(res.selected.iter().all(|&g| g >= 10));
    }

    #[test]
    fn test_no_expression_fails() {
        let res = select_hvgs_from_stats(vec![0.0; 5], vec![0.0; 5], 10, &HvgParams::default());
        assert!(res.is_err());
    }
}
