//! Interval Coverage
//!
//! Empirical coverage of symmetric central intervals `mean ± z * sigma`.
use crate::errors::PriceboundError;
use statrs::distribution::{ContinuousCDF, Normal};

/// Two sided z-score for a central interval, `Φ⁻¹(0.5 + confidence / 2)`.
///
/// * `confidence` - Confidence level in the open interval (0, 1).
pub fn z_score(confidence: f64) -> Result<f64, PriceboundError> {
    if !(confidence > 0.0 && confidence < 1.0) {
        return Err(PriceboundError::InvalidConfidence(confidence));
    }
    let normal = Normal::new(0.0, 1.0).map_err(|e| {
        PriceboundError::InvalidParameter("standard normal".to_string(), "valid".to_string(), e.to_string())
    })?;
    Ok(normal.inverse_cdf(0.5 + confidence / 2.0))
}

#[inline]
fn valid_row(y: f64, m: f64, s: Option<f64>) -> Option<(f64, f64, f64)> {
    match s {
        Some(s) if s.is_finite() && m.is_finite() && y.is_finite() => Some((y, m, s)),
        _ => None,
    }
}

/// Count (covered, valid) rows for a given z and sigma multiplier.
pub(crate) fn coverage_counts(y: &[f64], mean: &[f64], sigma: &[Option<f64>], z: f64, scale: f64) -> (usize, usize) {
    let mut covered = 0;
    let mut valid = 0;
    for ((y_, m_), s_) in y.iter().zip(mean).zip(sigma) {
        if let Some((y_, m_, s_)) = valid_row(*y_, *m_, *s_) {
            valid += 1;
            let half = z * scale * s_;
            if (m_ - half) <= y_ && y_ <= (m_ + half) {
                covered += 1;
            }
        }
    }
    (covered, valid)
}

/// Fraction of rows whose true value lies within `mean ± z * sigma`.
///
/// Rows with a missing or non-finite sigma, mean or true value are left out of
/// both numerator and denominator. `None` when no valid row remains.
pub fn coverage(y: &[f64], mean: &[f64], sigma: &[Option<f64>], z: f64) -> Option<f64> {
    scaled_coverage(y, mean, sigma, z, 1.0)
}

/// Coverage after multiplying every sigma by `scale`.
pub fn scaled_coverage(y: &[f64], mean: &[f64], sigma: &[Option<f64>], z: f64, scale: f64) -> Option<f64> {
    let (covered, valid) = coverage_counts(y, mean, sigma, z, scale);
    if valid == 0 {
        None
    } else {
        Some(covered as f64 / valid as f64)
    }
}

/// Coverage at a confidence level instead of a z-score.
pub fn coverage_at(y: &[f64], mean: &[f64], sigma: &[Option<f64>], confidence: f64) -> Result<Option<f64>, PriceboundError> {
    Ok(coverage(y, mean, sigma, z_score(confidence)?))
}

/// Number of rows that take part in a coverage computation.
pub fn n_valid(y: &[f64], mean: &[f64], sigma: &[Option<f64>]) -> usize {
    y.iter()
        .zip(mean)
        .zip(sigma)
        .filter(|((y_, m_), s_)| valid_row(**y_, **m_, **s_).is_some())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use statrs::distribution::Normal as Gaussian;
    use rand::distributions::Distribution;

    #[test]
    fn test_z_score() {
        assert_relative_eq!(z_score(0.90).unwrap(), 1.6448536, epsilon = 1e-6);
        assert_relative_eq!(z_score(0.95).unwrap(), 1.9599640, epsilon = 1e-6);
        assert_relative_eq!(z_score(0.50).unwrap(), 0.6744898, epsilon = 1e-6);
        assert!(matches!(z_score(1.0), Err(PriceboundError::InvalidConfidence(_))));
        assert!(matches!(z_score(0.0), Err(PriceboundError::InvalidConfidence(_))));
        assert!(z_score(f64::NAN).is_err());
    }

    #[test]
    fn test_coverage_small() {
        let y = vec![9.0, 10.0, 11.0, 12.0];
        let m = vec![10.0; 4];
        let s = vec![Some(1.0); 4];
        assert_relative_eq!(coverage(&y, &m, &s, 0.674).unwrap(), 0.25);
        assert_relative_eq!(coverage(&y, &m, &s, 1.0).unwrap(), 0.75);
        assert_relative_eq!(scaled_coverage(&y, &m, &s, 0.674, 3.0).unwrap(), 1.0);
    }

    #[test]
    fn test_coverage_skips_invalid_rows() {
        let y = vec![10.0, 10.0, f64::NAN, 10.0, 50.0];
        let m = vec![10.0, 10.0, 10.0, f64::INFINITY, 10.0];
        let s = vec![Some(1.0), None, Some(1.0), Some(1.0), Some(1.0)];
        assert_eq!(n_valid(&y, &m, &s), 2);
        assert_relative_eq!(coverage(&y, &m, &s, 1.0).unwrap(), 0.5);
    }

    #[test]
    fn test_coverage_undefined_without_valid_rows() {
        let y = vec![1.0, 2.0];
        let m = vec![1.0, 2.0];
        let s = vec![None, Some(f64::NAN)];
        assert_eq!(coverage(&y, &m, &s, 1.645), None);
        assert_eq!(coverage(&[], &[], &[], 1.645), None);
    }

    #[test]
    fn test_coverage_converges_to_nominal() {
        let mut rng = StdRng::seed_from_u64(0);
        let noise = Gaussian::new(0.0, 0.3).unwrap();
        let n = 100_000;
        let m: Vec<f64> = (0..n).map(|i| (i % 17) as f64).collect();
        let y: Vec<f64> = m.iter().map(|v| v + noise.sample(&mut rng)).collect();
        let s = vec![Some(0.3); n];
        let c = coverage_at(&y, &m, &s, 0.90).unwrap().unwrap();
        assert!((c - 0.90).abs() < 0.01, "coverage {}", c);
    }
}
