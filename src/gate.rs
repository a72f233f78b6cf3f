//! Sigmoid Gate
//!
//! Smooth blending weight that switches the Stage-2 correction on for rows the
//! base model places above the luxury threshold.
use crate::constants::SIGMOID_CLIP;
use crate::errors::PriceboundError;
use crate::transform::TargetTransform;
use crate::utils::validate_positive_float_parameter;
use serde::{Deserialize, Serialize};

#[inline]
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x.clamp(-SIGMOID_CLIP, SIGMOID_CLIP)).exp())
}

/// Gate centred on a log-space threshold with smoothness `tau`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    pub threshold_log: f64,
    pub smoothness: f64,
}

impl Gate {
    pub fn new(threshold_log: f64, smoothness: f64) -> Result<Self, PriceboundError> {
        validate_positive_float_parameter(smoothness, "gate smoothness")?;
        if !threshold_log.is_finite() {
            return Err(PriceboundError::InvalidParameter(
                "luxury threshold".to_string(),
                "a finite value in log space".to_string(),
                threshold_log.to_string(),
            ));
        }
        Ok(Gate {
            threshold_log,
            smoothness,
        })
    }

    /// Gate on a threshold given in price units.
    pub fn from_price(threshold: f64, smoothness: f64, transform: TargetTransform) -> Result<Self, PriceboundError> {
        Gate::new(transform.forward(threshold), smoothness)
    }

    /// `sigmoid((mean_log - threshold_log) / tau)`, exactly 0.5 at the threshold.
    #[inline]
    pub fn weight(&self, mean_log: f64) -> f64 {
        sigmoid((mean_log - self.threshold_log) / self.smoothness)
    }

    pub fn weights(&self, mean_log: &[f64]) -> Vec<f64> {
        mean_log.iter().map(|m| self.weight(*m)).collect()
    }
}

/// `mean_log + w * residual`.
#[inline]
pub fn combine_mean(mean_log: f64, weight: f64, residual: f64) -> f64 {
    mean_log + weight * residual
}

/// `sigma * factor * (1 + beta * w)`, missing sigma stays missing.
#[inline]
pub fn adjust_sigma(sigma_log: Option<f64>, factor: f64, beta: f64, weight: f64) -> Option<f64> {
    sigma_log.map(|s| s * factor * (1.0 + beta * weight))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_half_at_threshold() {
        let gate = Gate::from_price(800_000.0, 0.2, TargetTransform::Log1p).unwrap();
        assert_eq!(gate.weight(800_000f64.ln_1p()), 0.5);
        let gate = Gate::new(13.0, 0.05).unwrap();
        assert_eq!(gate.weight(13.0), 0.5);
    }

    #[test]
    fn test_monotone_and_bounded() {
        let gate = Gate::new(13.5, 0.1).unwrap();
        let grid: Vec<f64> = (0..2000).map(|i| 10.0 + i as f64 * 0.004).collect();
        let w = gate.weights(&grid);
        assert!(w.windows(2).all(|p| p[0] <= p[1]));
        assert!(w.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(w[0] < 1e-10);
        assert!(w[w.len() - 1] > 1.0 - 1e-10);
    }

    #[test]
    fn test_extreme_arguments_do_not_overflow() {
        let gate = Gate::new(0.0, 1e-6).unwrap();
        assert_eq!(gate.weight(1e6), 1.0);
        let w = gate.weight(-1e6);
        assert!(w.is_finite() && w >= 0.0 && w < 1e-200);
    }

    #[test]
    fn test_combination_is_continuous_at_threshold() {
        let gate = Gate::new(13.0, 0.1).unwrap();
        let residual = 0.3;
        let eps = 1e-9;
        let below = combine_mean(13.0 - eps, gate.weight(13.0 - eps), residual);
        let above = combine_mean(13.0 + eps, gate.weight(13.0 + eps), residual);
        assert!((above - below).abs() < 1e-7);
        assert_eq!(combine_mean(11.0, 0.0, residual), 11.0);
    }

    #[test]
    fn test_adjusted_sigma() {
        assert_relative_eq!(adjust_sigma(Some(0.3), 1.2, 0.4, 1.0).unwrap(), 0.504, epsilon = 1e-12);
        assert_relative_eq!(adjust_sigma(Some(0.3), 1.2, 0.4, 0.0).unwrap(), 0.36, epsilon = 1e-12);
        assert_eq!(adjust_sigma(None, 1.2, 0.4, 1.0), None);
    }

    #[test]
    fn test_invalid_gate() {
        assert!(Gate::new(13.0, 0.0).is_err());
        assert!(Gate::new(f64::NAN, 0.1).is_err());
    }
}
