use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};
use std::ops::{Add, Div};

/// Consistency constant to turn a MAD into a normal standard deviation
pub const MAD_CONSTANT: f64 = 1.4826;

///////////////
// Functions //
///////////////

/// Get the median
///
/// ### Params
///
/// * `x` - The slice for which to calculate the median for.
///
/// ### Results
///
/// The median (if the vector is not empty)
pub fn median<T>(x: &[T]) -> Option<T>
where
    T: Clone + PartialOrd + Add<Output = T> + Div<T, Output = T> + From<u8>,
{
    if x.is_empty() {
        return None;
    }

    let mut data = x.to_vec();
    let len = data.len();
    let cmp = |a: &T, b: &T| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal);

    if len % 2 == 0 {
        let (_, median1, right) = data.select_nth_unstable_by(len / 2 - 1, cmp);
        let median1 = median1.clone();
        let median2 = right.iter().min_by(|a, b| cmp(a, b))?.clone();
        Some((median1 + median2) / T::from(2))
    } else {
        let (_, median, _) = data.select_nth_unstable_by(len / 2, cmp);
        Some(median.clone())
    }
}

/// Calculate the FDR (Benjamini-Hochberg)
///
/// ### Params
///
/// * `pvals` - P-values for which to calculate the FDR
///
/// ### Returns
///
/// The calculated FDRs, in the order of the input
pub fn calc_fdr(pvals: &[f64]) -> Vec<f64> {
    let n = pvals.len();
    if n == 0 {
        return Vec::new();
    }
    let n_f64 = n as f64;

    let mut indexed_pval: Vec<(usize, f64)> =
        pvals.iter().enumerate().map(|(i, &x)| (i, x)).collect();

    indexed_pval
        .sort_unstable_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let adj_pvals_tmp: Vec<f64> = indexed_pval
        .iter()
        .enumerate()
        .map(|(i, (_, p))| (n_f64 / (i + 1) as f64) * p)
        .collect();

    let mut current_min = adj_pvals_tmp[n - 1].min(1.0);
    let mut monotonic_adj = vec![current_min; n];

    for i in (0..n - 1).rev() {
        current_min = current_min.min(adj_pvals_tmp[i]).min(1.0);
        monotonic_adj[i] = current_min;
    }

    let mut adj_pvals = vec![0.0; n];

    for (i, &(original_idx, _)) in indexed_pval.iter().enumerate() {
        adj_pvals[original_idx] = monotonic_adj[i];
    }

    adj_pvals
}

/// Robust location and upper-tail spread of a set of values
///
/// The spread is the median of the positive deviations from the median,
/// scaled by [`MAD_CONSTANT`]. Only values strictly above the median enter
/// the spread, so a lower tail truncated at zero does not shrink it.
///
/// ### Params
///
/// * `x` - The values. Must be finite.
///
/// ### Returns
///
/// Tuple of `(median, spread)`; `None` for empty input. The spread is `0.0`
/// when no value exceeds the median.
pub fn upper_tail_location_spread(x: &[f64]) -> Option<(f64, f64)> {
    let med = median(x)?;
    let upper: Vec<f64> = x.iter().filter(|&&v| v > med).map(|&v| v - med).collect();
    let spread = median(&upper).map(|m| m * MAD_CONSTANT).unwrap_or(0.0);
    Some((med, spread))
}

/// One-sided upper tail p-value under a normal distribution
///
/// ### Params
///
/// * `x` - Observed value.
/// * `mean` - Mean of the null.
/// * `sd` - Standard deviation of the null. With `sd <= 0` the null is a
///   point mass at `mean`.
///
/// ### Returns
///
/// `P(X >= x)`
pub fn normal_upper_pval(x: f64, mean: f64, sd: f64) -> f64 {
    if !sd.is_finite() || sd <= 0.0 {
        return if x > mean { 0.0 } else { 1.0 };
    }
    match Normal::new(mean, sd) {
        Ok(dist) => dist.sf(x),
        Err(_) => 1.0,
    }
}

/// Upper tail p-value of a chi-squared statistic
///
/// ### Params
///
/// * `stat` - The chi-squared statistic.
/// * `df` - Degrees of freedom.
///
/// ### Returns
///
/// `P(X >= stat)`; `1.0` if the distribution is undefined.
pub fn chi_squared_upper_pval(stat: f64, df: f64) -> f64 {
    if !stat.is_finite() {
        return if stat > 0.0 { 0.0 } else { 1.0 };
    }
    match ChiSquared::new(df) {
        Ok(dist) => dist.sf(stat.max(0.0)),
        Err(_) => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median::<f64>(&[]), None);
    }

    #[test]
    fn test_fdr_monotone() {
        let p = vec![0.01, 0.04, 0.03, 0.2, 0.001];
        let q = calc_fdr(&p);

        let mut pairs: Vec<(f64, f64)> = p.iter().copied().zip(q.iter().copied()).collect();
        pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        for w in pairs.windows(2) {
            assert!(w[0].1 <= w[1].1, "q-values must follow the p-value order");
        }
        // smallest p-value: 0.001 * 5 / 1
        assert!((q[4] - 0.005).abs() < 1e-12);
        assert!(q.iter().all(|&v| v <= 1.0));
    }

    #[test]
    fn test_upper_tail_spread() {
        let x = vec![1.0, 2.0, 3.0, 5.0, 9.0];
        let (med, spread) = upper_tail_location_spread(&x).unwrap();
        assert_eq!(med, 3.0);
        // deviations above the median: 2 and 6 -> median 4
        assert!((spread - 4.0 * MAD_CONSTANT).abs() < 1e-12);

        let (_, zero) = upper_tail_location_spread(&[2.0, 2.0, 2.0]).unwrap();
        assert_eq!(zero, 0.0);
    }

    #[test]
    fn test_normal_upper_pval() {
        assert!((normal_upper_pval(0.0, 0.0, 1.0) - 0.5).abs() < 1e-9);
        assert!(normal_upper_pval(5.0, 0.0, 1.0) < 1e-6);
        assert_eq!(normal_upper_pval(1.0, 1.0, 0.0), 1.0);
        assert_eq!(normal_upper_pval(2.0, 1.0, 0.0), 0.0);
    }

    #[test]
    fn test_chi_squared_upper_pval() {
        // mean of a chi-squared with df = 10 is 10; far above is significant
        assert!(chi_squared_upper_pval(40.0, 10.0) < 1e-4);
        assert!(chi_squared_upper_pval(1.0, 10.0) > 0.99);
    }
}
