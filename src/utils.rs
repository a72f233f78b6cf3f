use crate::errors::PriceboundError;
use std::collections::VecDeque;

/// Create a string of all available items.
pub fn items_to_strings(items: Vec<&str>) -> String {
    items.join(", ")
}

pub fn fmt_vec_output(v: &[f64]) -> String {
    let mut res = String::new();
    if let Some(last) = v.len().checked_sub(1) {
        if last == 0 {
            return format!("{:.4}", v[0]);
        }
        for n in &v[..last] {
            res.push_str(format!("{:.4}", n).as_str());
            res.push_str(", ");
        }
        res.push_str(format!("{:.4}", &v[last]).as_str());
    }
    res
}

// Validation
pub fn validate_positive_float_parameter(value: f64, parameter: &str) -> Result<(), PriceboundError> {
    if value.is_nan() || value <= 0.0 || value.is_infinite() {
        Err(PriceboundError::InvalidParameter(
            parameter.to_string(),
            "positive finite real value".to_string(),
            value.to_string(),
        ))
    } else {
        Ok(())
    }
}

pub fn validate_float_parameter(value: f64, min: f64, max: f64, parameter: &str) -> Result<(), PriceboundError> {
    if value.is_nan() || value < min || max < value {
        let ex_msg = format!("real value within range {} and {}", min, max);
        Err(PriceboundError::InvalidParameter(
            parameter.to_string(),
            ex_msg,
            value.to_string(),
        ))
    } else {
        Ok(())
    }
}

pub fn validate_count_parameter(value: usize, min: usize, parameter: &str) -> Result<(), PriceboundError> {
    if value < min {
        Err(PriceboundError::InvalidParameter(
            parameter.to_string(),
            format!("an integer of at least {}", min),
            value.to_string(),
        ))
    } else {
        Ok(())
    }
}

/// Calculate weighted percentiles of a slice.
///
/// Missing values must be removed before calling; an empty input yields an empty result.
///
/// * `v` - A slice of which to find percentiles for.
/// * `sample_weight` - Sample weights for the instances of the vector.
/// * `percentiles` - Percentiles to look for in the data. This should be
///   values from 0 to 1, and in sorted order.
pub fn percentiles(v: &[f64], sample_weight: &[f64], percentiles: &[f64]) -> Vec<f64> {
    if v.is_empty() || percentiles.is_empty() {
        return Vec::new();
    }
    let mut idx: Vec<usize> = (0..v.len()).collect();
    idx.sort_unstable_by(|a, b| v[*a].total_cmp(&v[*b]));

    let mut pcts = VecDeque::from_iter(percentiles.iter());
    let mut current_pct = match pcts.pop_front() {
        Some(p) => *p,
        None => return Vec::new(),
    };

    let mut p = Vec::new();
    let mut cuml_pct = 0.0;
    let total_values: f64 = sample_weight.iter().sum();

    for i in idx.iter() {
        cuml_pct += sample_weight[*i] / total_values;
        // The same value might satisfy several percentiles.
        while cuml_pct >= current_pct {
            p.push(v[*i]);
            match pcts.pop_front() {
                Some(p_) => current_pct = *p_,
                None => return p,
            }
        }
    }
    // Rounding can leave the last percentiles (close to 1.0) unmatched.
    let last = v[idx[idx.len() - 1]];
    while p.len() < percentiles.len() {
        p.push(last);
    }
    p
}

/// Median of the finite values of a slice, `None` if there are none.
pub fn nan_median(v: &[f64]) -> Option<f64> {
    let mut finite: Vec<f64> = v.iter().copied().filter(|x| x.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    finite.sort_unstable_by(|a, b| a.total_cmp(b));
    let n = finite.len();
    if n % 2 == 1 {
        Some(finite[n / 2])
    } else {
        Some(0.5 * (finite[n / 2 - 1] + finite[n / 2]))
    }
}

/// Mean of the finite values of a slice, `None` if there are none.
pub fn nan_mean(v: &[f64]) -> Option<f64> {
    let (sum, n) = v
        .iter()
        .filter(|x| x.is_finite())
        .fold((0.0, 0usize), |(s, n), x| (s + x, n + 1));
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}

/// Median of a list of counts, rounding half-way cases down.
pub fn median_usize(v: &[usize]) -> Option<usize> {
    if v.is_empty() {
        return None;
    }
    let mut s = v.to_vec();
    s.sort_unstable();
    let n = s.len();
    if n % 2 == 1 {
        Some(s[n / 2])
    } else {
        Some((s[n / 2 - 1] + s[n / 2]) / 2)
    }
}

/// Golden-section search for the minimum of `f` on `[lo, hi]`.
///
/// Derivative free, so it is safe on step functions, though on those it only
/// returns some point of a locally minimal plateau. Returns `(x, f(x))`.
pub fn minimize_bounded<F>(mut f: F, lo: f64, hi: f64, xtol: f64, max_iter: usize) -> (f64, f64)
where
    F: FnMut(f64) -> f64,
{
    let inv_phi = (5f64.sqrt() - 1.0) / 2.0;
    let (mut a, mut b) = (lo, hi);
    let mut c = b - inv_phi * (b - a);
    let mut d = a + inv_phi * (b - a);
    let mut fc = f(c);
    let mut fd = f(d);
    let mut iter = 0;
    while (b - a).abs() > xtol && iter < max_iter {
        if fc <= fd {
            b = d;
            d = c;
            fd = fc;
            c = b - inv_phi * (b - a);
            fc = f(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + inv_phi * (b - a);
            fd = f(d);
        }
        iter += 1;
    }
    if fc <= fd {
        (c, fc)
    } else {
        (d, fd)
    }
}
