use rayon::prelude::*;
use serde::Deserialize;

use crate::assert_same_len;
use crate::core::base::stats::median;
use crate::error::{QcError, QcResult};

/// Degree of the local polynomials
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoessDegree {
    /// Local straight lines
    Linear,
    /// Local parabolas
    Quadratic,
}

impl LoessDegree {
    fn n_coefficients(self) -> usize {
        match self {
            LoessDegree::Linear => 2,
            LoessDegree::Quadratic => 3,
        }
    }
}

/// Loess fit
///
/// ### Fields
///
/// * `fitted` - Fitted value per input point; `NaN` where x or y was not
///   finite.
/// * `n_used` - Number of finite points that entered the fit.
#[derive(Debug, Clone)]
pub struct LoessFit {
    pub fitted: Vec<f64>,
    pub n_used: usize,
}

/// Tricube weight function: (1 - |u|³)³ for |u| < 1, 0 otherwise
///
/// ### Params
///
/// * `u` - The scaled distance
///
/// ### Returns
///
/// The tricube weight
#[inline]
pub fn tricube_weight(u: f64) -> f64 {
    let u = u.abs();
    if u >= 1.0 {
        0.0
    } else {
        let temp = 1.0 - u * u * u;
        temp * temp * temp
    }
}

/////////////
// Helpers //
/////////////

/// Solve a small symmetric system in place (Gaussian elimination with
/// partial pivoting)
///
/// ### Returns
///
/// `None` if the system is (numerically) singular.
fn solve_small_system<const N: usize>(mut a: [[f64; N]; N], mut b: [f64; N]) -> Option<[f64; N]> {
    for col in 0..N {
        let pivot = (col..N).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in (col + 1)..N {
            let factor = a[row][col] / a[col][col];
            for k in col..N {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0; N];
    for row in (0..N).rev() {
        let tail: f64 = ((row + 1)..N).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Some(x)
}

/// Bisquare robustness weights from the residuals of a fit
///
/// Residuals beyond six median absolute residuals get weight zero.
///
/// ### Returns
///
/// `None` if the fit is already (numerically) exact.
fn bisquare_weights(ys: &[f64], fitted: &[f64]) -> Option<Vec<f64>> {
    let residuals: Vec<f64> = ys.iter().zip(fitted).map(|(y, f)| y - f).collect();
    let abs_res: Vec<f64> = residuals.iter().map(|r| r.abs()).collect();
    let mad = median(&abs_res)?;
    let scale = ys.iter().map(|y| y.abs()).sum::<f64>() / ys.len() as f64;
    if !mad.is_finite() || mad <= 1e-7 * scale {
        return None;
    }
    let cutoff = 6.0 * mad;
    Some(
        residuals
            .iter()
            .map(|r| {
                let u = r / cutoff;
                if u.abs() < 1.0 {
                    let temp = 1.0 - u * u;
                    temp * temp
                } else {
                    0.0
                }
            })
            .collect(),
    )
}

/// Start of the window of `k` consecutive sorted points closest to `target`
fn nearest_window(xs: &[f64], target: f64, k: usize) -> usize {
    let n = xs.len();
    if k >= n {
        return 0;
    }
    let pos = xs.partition_point(|&x| x < target);
    let mut lo = pos.saturating_sub(k).min(n - k);
    // slide right while the next point beats the leftmost one
    while lo + k < n && (xs[lo + k] - target).abs() < (target - xs[lo]).abs() {
        lo += 1;
    }
    lo
}

/// Weighted polynomial fit centred on `target`, evaluated at `target`
///
/// With the design centred on the target, the fitted value is the
/// intercept. Falls back to the weighted mean when the system is singular.
fn local_fit<const N: usize>(target: f64, xs: &[f64], ys: &[f64], ws: &[f64]) -> f64 {
    let mut a = [[0.0; N]; N];
    let mut b = [0.0; N];
    for ((&x, &y), &w) in xs.iter().zip(ys).zip(ws) {
        let u = x - target;
        let mut powers = [1.0; N];
        for p in 1..N {
            powers[p] = powers[p - 1] * u;
        }
        for i in 0..N {
            b[i] += w * powers[i] * y;
            for j in 0..N {
                a[i][j] += w * powers[i] * powers[j];
            }
        }
    }

    let w_sum = a[0][0];
    if w_sum <= 0.0 {
        return ys.iter().sum::<f64>() / ys.len() as f64;
    }
    match solve_small_system(a, b) {
        Some(coef) => coef[0],
        None => b[0] / w_sum,
    }
}

///////////
// Loess //
///////////

/// Local regression used for the mean-variance trend
///
/// Every point is fitted from the `span` fraction of points closest in x,
/// tricube-weighted by their distance relative to the furthest of them.
/// With robustness iterations, every refit multiplies these weights with
/// bisquare weights of the previous residuals, so that a group of points
/// far above the bulk cannot drag the trend towards itself.
#[derive(Clone, Debug)]
pub struct LoessRegression {
    span: f64,
    degree: LoessDegree,
    robust_iters: usize,
}

impl LoessRegression {
    /// Generate a new instance of the Loess regression
    ///
    /// ### Params
    ///
    /// * `span` - Fraction of the points used in every local fit (0, 1].
    /// * `degree` - Degree of the local polynomials.
    ///
    /// ### Return
    ///
    /// Initialised class
    pub fn new(span: f64, degree: LoessDegree) -> QcResult<Self> {
        if !(span > 0.0 && span <= 1.0) {
            return Err(QcError::InvalidInput(format!(
                "loess span must be in (0, 1], got {}",
                span
            )));
        }
        Ok(Self {
            span,
            degree,
            robust_iters: 0,
        })
    }

    /// Number of bisquare robustness iterations after the initial fit
    pub fn with_robust_iterations(mut self, iters: usize) -> Self {
        self.robust_iters = iters;
        self
    }

    /// Fit y on x
    ///
    /// ### Params
    ///
    /// * `x` - The predictor variable
    /// * `y` - The response variable
    ///
    /// ### Returns
    ///
    /// The `LoessFit`
    pub fn fit(&self, x: &[f64], y: &[f64]) -> LoessFit {
        assert_same_len!(x, y);

        let mut points: Vec<(usize, f64, f64)> = x
            .iter()
            .zip(y.iter())
            .enumerate()
            .filter(|(_, (x, y))| x.is_finite() && y.is_finite())
            .map(|(i, (&x, &y))| (i, x, y))
            .collect();
        points.sort_by(|a, b| a.1.total_cmp(&b.1));

        let xs: Vec<f64> = points.iter().map(|p| p.1).collect();
        let ys: Vec<f64> = points.iter().map(|p| p.2).collect();
        let n_used = points.len();
        let k = ((n_used as f64 * self.span).ceil() as usize).clamp(1, n_used.max(1));

        let mut robustness = vec![1.0; n_used];
        let mut fitted_sorted = self.fit_pass(&xs, &ys, &robustness, k);
        for _ in 0..self.robust_iters {
            match bisquare_weights(&ys, &fitted_sorted) {
                Some(w) => robustness = w,
                None => break,
            }
            fitted_sorted = self.fit_pass(&xs, &ys, &robustness, k);
        }

        let mut fitted = vec![f64::NAN; x.len()];
        for ((orig, _, _), f) in points.iter().zip(fitted_sorted) {
            fitted[*orig] = f;
        }

        LoessFit { fitted, n_used }
    }

    /// Fitted values at all (sorted) points
    fn fit_pass(&self, xs: &[f64], ys: &[f64], robustness: &[f64], k: usize) -> Vec<f64> {
        xs.par_iter()
            .map(|&target| self.fit_at(xs, ys, robustness, target, k))
            .collect()
    }

    /// Fitted value at one position
    fn fit_at(&self, xs: &[f64], ys: &[f64], robustness: &[f64], target: f64, k: usize) -> f64 {
        let lo = nearest_window(xs, target, k);
        let hi = (lo + k).min(xs.len());
        let (wx, wy) = (&xs[lo..hi], &ys[lo..hi]);

        let max_dist = (target - wx[0]).abs().max((wx[wx.len() - 1] - target).abs());
        if max_dist == 0.0 {
            return wy.iter().sum::<f64>() / wy.len() as f64;
        }
        // the furthest neighbour keeps a small weight
        let scale = 1.0 / (max_dist * 1.0001);
        let tricube: Vec<f64> = wx.iter().map(|&x| tricube_weight((x - target) * scale)).collect();
        let mut ws: Vec<f64> = tricube
            .iter()
            .zip(&robustness[lo..hi])
            .map(|(t, r)| t * r)
            .collect();
        // whole window rejected
        if ws.iter().sum::<f64>() <= 0.0 {
            ws = tricube;
        }

        match self.degree {
            LoessDegree::Linear => local_fit::<2>(target, wx, wy, &ws),
            LoessDegree::Quadratic if wx.len() >= self.degree.n_coefficients() => {
                local_fit::<3>(target, wx, wy, &ws)
            }
            LoessDegree::Quadratic => local_fit::<2>(target, wx, wy, &ws),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tricube_weight() {
        assert_eq!(tricube_weight(0.0), 1.0);
        assert_eq!(tricube_weight(1.0), 0.0);
        assert_eq!(tricube_weight(-2.0), 0.0);
        let w = tricube_weight(0.5);
        assert!((w - (1.0 - 0.125_f64).powi(3)).abs() < 1e-12);
    }

    #[test]
    fn test_nearest_window() {
        let xs = vec![0.0, 1.0, 2.0, 10.0, 11.0];
        assert_eq!(nearest_window(&xs, 0.0, 3), 0);
        assert_eq!(nearest_window(&xs, 10.5, 2), 3);
        assert_eq!(nearest_window(&xs, 2.0, 3), 0);
        assert_eq!(nearest_window(&xs, 9.0, 3), 2);
        assert_eq!(nearest_window(&xs, 5.0, 10), 0);
    }

    #[test]
    fn test_loess_recovers_line() {
        let x: Vec<f64> = (0..50).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v + 1.0).collect();
        let res = LoessRegression::new(0.3, LoessDegree::Linear)
            .unwrap()
            .fit(&x, &y);
        for (i, f) in res.fitted.iter().enumerate() {
            assert!((f - y[i]).abs() < 1e-6, "fit at {} was {}", i, f);
        }
        assert_eq!(res.n_used, 50);
    }

    #[test]
    fn test_quadratic_recovers_parabola() {
        let x: Vec<f64> = (0..40).map(|i| i as f64 * 0.25).collect();
        let y: Vec<f64> = x.iter().map(|v| v * v - 3.0 * v).collect();
        let res = LoessRegression::new(0.5, LoessDegree::Quadratic)
            .unwrap()
            .fit(&x, &y);
        for (i, f) in res.fitted.iter().enumerate() {
            assert!((f - y[i]).abs() < 1e-6, "fit at {} was {}", i, f);
        }
    }

    #[test]
    fn test_loess_skips_non_finite() {
        let x = vec![0.0, 1.0, f64::NAN, 3.0, 4.0];
        let y = vec![0.0, 1.0, 2.0, 3.0, 4.0];
        let res = LoessRegression::new(1.0, LoessDegree::Quadratic)
            .unwrap()
            .fit(&x, &y);
        assert!(res.fitted[2].is_nan());
        assert_eq!(res.n_used, 4);
        assert!((res.fitted[3] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_robust_fit_ignores_outlier_group() {
        let x: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let y: Vec<f64> = (0..100)
            .map(|i| {
                if (40..47).contains(&i) {
                    5.0
                } else {
                    1.0 + 0.05 * (i as f64).sin()
                }
            })
            .collect();

        let plain = LoessRegression::new(0.3, LoessDegree::Linear)
            .unwrap()
            .fit(&x, &y);
        assert!(plain.fitted[43] > 2.0, "plain fit {}", plain.fitted[43]);

        let robust = LoessRegression::new(0.3, LoessDegree::Linear)
            .unwrap()
            .with_robust_iterations(4)
            .fit(&x, &y);
        for i in [20, 38, 43, 50, 80] {
            assert!(
                (robust.fitted[i] - 1.0).abs() < 0.1,
                "robust fit at {} was {}",
                i,
                robust.fitted[i]
            );
        }
    }

    #[test]
    fn test_robust_iterations_keep_exact_fit() {
        let x: Vec<f64> = (0..30).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 0.5 * v - 2.0).collect();
        let res = LoessRegression::new(0.5, LoessDegree::Linear)
            .unwrap()
            .with_robust_iterations(4)
            .fit(&x, &y);
        for (i, f) in res.fitted.iter().enumerate() {
            assert!((f - y[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_invalid_span() {
        assert!(LoessRegression::new(0.0, LoessDegree::Linear).is_err());
        assert!(LoessRegression::new(1.5, LoessDegree::Linear).is_err());
    }
}
