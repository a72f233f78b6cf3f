//! Target Transform
//!
//! Maps prices into the log space the models are trained in and back, with the
//! log-normal bias correction for expected values.
use crate::errors::PriceboundError;
use crate::utils::items_to_strings;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TargetTransform {
    /// `ln(x)`, inverse `exp`.
    Log,
    /// `ln(1 + x)`, inverse `exp(x) - 1`.
    #[default]
    Log1p,
}

impl FromStr for TargetTransform {
    type Err = PriceboundError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Log" => Ok(TargetTransform::Log),
            "Log1p" => Ok(TargetTransform::Log1p),
            _ => Err(PriceboundError::ParseString(
                s.to_string(),
                "TargetTransform".to_string(),
                items_to_strings(vec!["Log", "Log1p"]),
            )),
        }
    }
}

impl TargetTransform {
    #[inline]
    pub fn forward(&self, x: f64) -> f64 {
        match self {
            TargetTransform::Log => x.ln(),
            TargetTransform::Log1p => x.ln_1p(),
        }
    }

    #[inline]
    pub fn inverse(&self, x: f64) -> f64 {
        match self {
            TargetTransform::Log => x.exp(),
            TargetTransform::Log1p => x.exp_m1(),
        }
    }

    /// Median of the back transformed distribution.
    #[inline]
    pub fn median(&self, mean_log: f64) -> f64 {
        self.inverse(mean_log)
    }

    /// Expected value under a log-normal assumption, `inverse(mean + sigma² / 2)`.
    ///
    /// A missing sigma gives the median.
    #[inline]
    pub fn expected_value(&self, mean_log: f64, sigma_log: Option<f64>) -> f64 {
        match sigma_log {
            Some(s) if s.is_finite() => self.inverse(mean_log + 0.5 * s * s),
            _ => self.inverse(mean_log),
        }
    }

    /// Central interval `inverse(mean ± z * sigma)`, clamped at zero after the
    /// inverse. `None` when sigma is missing.
    pub fn interval(&self, mean_log: f64, sigma_log: Option<f64>, z: f64) -> Option<(f64, f64)> {
        let s = sigma_log.filter(|s| s.is_finite())?;
        let lower = self.inverse(mean_log - z * s).max(0.0);
        let upper = self.inverse(mean_log + z * s).max(0.0);
        Some((lower, upper))
    }

    /// Back transform a slice of log values.
    pub fn inverse_all(&self, v: &[f64]) -> Vec<f64> {
        v.iter().map(|x| self.inverse(*x)).collect()
    }
}
