//! Metrics
//!
//! Regression error statistics used in fold diagnostics, Stage-2 tuning and
//! held-out evaluation. NaN predictions propagate, callers filter beforehand.

pub fn root_mean_squared_error(y: &[f64], yhat: &[f64]) -> f64 {
    if y.is_empty() {
        return f64::NAN;
    }
    let res = y.iter().zip(yhat).map(|(y_, yhat_)| (y_ - yhat_).powi(2)).sum::<f64>();
    (res / y.len() as f64).sqrt()
}

pub fn mean_absolute_error(y: &[f64], yhat: &[f64]) -> f64 {
    if y.is_empty() {
        return f64::NAN;
    }
    y.iter().zip(yhat).map(|(y_, yhat_)| (y_ - yhat_).abs()).sum::<f64>() / y.len() as f64
}

/// Coefficient of determination, NaN when `y` has no variance.
pub fn r2_score(y: &[f64], yhat: &[f64]) -> f64 {
    if y.is_empty() {
        return f64::NAN;
    }
    let mean = y.iter().sum::<f64>() / y.len() as f64;
    let ss_tot = y.iter().map(|v| (v - mean).powi(2)).sum::<f64>();
    let ss_res = y.iter().zip(yhat).map(|(y_, yhat_)| (y_ - yhat_).powi(2)).sum::<f64>();
    if ss_tot == 0.0 {
        f64::NAN
    } else {
        1.0 - ss_res / ss_tot
    }
}

/// Median absolute percentage error in percent.
///
/// The denominator is `max(y, 1)` so tiny or zero prices do not blow up the ratio.
pub fn median_absolute_percentage_error(y: &[f64], yhat: &[f64]) -> f64 {
    let mut ape: Vec<f64> = y
        .iter()
        .zip(yhat)
        .map(|(y_, yhat_)| ((y_ - yhat_) / y_.max(1.0)).abs())
        .filter(|v| !v.is_nan())
        .collect();
    if ape.is_empty() {
        return f64::NAN;
    }
    ape.sort_unstable_by(|a, b| a.total_cmp(b));
    let n = ape.len();
    let med = if n % 2 == 1 {
        ape[n / 2]
    } else {
        0.5 * (ape[n / 2 - 1] + ape[n / 2])
    };
    med * 100.0
}

/// Compare two metric values that are minimised, determining if `comparison` is better.
/// If one of them is NaN favor the non NaN value.
/// If both are NaN, consider the first value to be better.
pub fn is_comparison_better(value: f64, comparison: f64) -> bool {
    match (value.is_nan(), comparison.is_nan()) {
        (true, true) | (false, true) => false,
        (true, false) => true,
        (false, false) => value > comparison,
    }
}
