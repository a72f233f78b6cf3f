//! Sigma Calibration
//!
//! Finds one multiplier for the predicted log-space sigma so that the central
//! interval at the target confidence covers the requested share of rows.
//! Coverage is a step function of the multiplier, so the search never uses
//! derivatives.
use crate::constants::{
    DEFAULT_CALIBRATION_TOLERANCE, DEFAULT_SEARCH_BOUNDS, DEFAULT_TARGET_COVERAGE, GOLDEN_MAX_ITER, REFERENCE_LEVELS,
    SCALE_XTOL,
};
use crate::coverage::{n_valid, scaled_coverage, z_score};
use crate::errors::PriceboundError;
use crate::persistence::{parse_missing, JsonIO};
use crate::utils::{items_to_strings, minimize_bounded, validate_float_parameter};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Plateaus narrower than this share of their width are not moved inward.
const PLATEAU_MARGIN: f64 = 1e-6;
/// Objective values closer than this are treated as a tie.
const OBJECTIVE_TIE: f64 = 1e-12;

/// How the bounded scale search is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SearchMethod {
    /// Enumerate every plateau of the coverage step function.
    #[default]
    Plateau,
    /// Golden section search on `|coverage - target|`.
    GoldenSection,
}

impl FromStr for SearchMethod {
    type Err = PriceboundError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Plateau" => Ok(SearchMethod::Plateau),
            "GoldenSection" => Ok(SearchMethod::GoldenSection),
            _ => Err(PriceboundError::ParseString(
                s.to_string(),
                "SearchMethod".to_string(),
                items_to_strings(vec!["Plateau", "GoldenSection"]),
            )),
        }
    }
}

fn default_target_coverage() -> f64 {
    DEFAULT_TARGET_COVERAGE
}
fn default_search_bounds() -> (f64, f64) {
    DEFAULT_SEARCH_BOUNDS
}
fn default_tolerance() -> f64 {
    DEFAULT_CALIBRATION_TOLERANCE
}

/// Configuration of the sigma calibration search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Coverage the central interval should reach.
    #[serde(default = "default_target_coverage")]
    pub target_coverage: f64,
    /// Closed range the multiplier is searched in.
    #[serde(default = "default_search_bounds")]
    pub search_bounds: (f64, f64),
    /// Largest |achieved - target| still considered a confident calibration.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default)]
    pub method: SearchMethod,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            target_coverage: default_target_coverage(),
            search_bounds: default_search_bounds(),
            tolerance: default_tolerance(),
            method: SearchMethod::default(),
        }
    }
}

impl CalibrationConfig {
    pub fn set_target_coverage(mut self, target_coverage: f64) -> Self {
        self.target_coverage = target_coverage;
        self
    }

    pub fn set_search_bounds(mut self, search_bounds: (f64, f64)) -> Self {
        self.search_bounds = search_bounds;
        self
    }

    pub fn set_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn set_method(mut self, method: SearchMethod) -> Self {
        self.method = method;
        self
    }

    pub fn validate(&self) -> Result<(), PriceboundError> {
        if !(self.target_coverage > 0.0 && self.target_coverage < 1.0) {
            return Err(PriceboundError::InvalidConfidence(self.target_coverage));
        }
        let (lo, hi) = self.search_bounds;
        if !(lo > 0.0 && lo.is_finite() && hi.is_finite() && lo < hi) {
            return Err(PriceboundError::InvalidParameter(
                "search_bounds".to_string(),
                "0 < lower < upper".to_string(),
                format!("({}, {})", lo, hi),
            ));
        }
        validate_float_parameter(self.tolerance, 0.0, 1.0, "tolerance")
    }
}

impl JsonIO for CalibrationConfig {}

/// Coverage at one reference level before and after scaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelCoverage {
    pub label: String,
    pub confidence: f64,
    pub z: f64,
    pub before: Option<f64>,
    pub after: Option<f64>,
}

/// Outcome of a calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    /// Multiplier to apply to every sigma.
    pub factor: f64,
    pub target_coverage: f64,
    /// Coverage at the target level with unscaled sigma.
    pub raw_coverage: Option<f64>,
    /// Coverage at the target level after scaling by `factor`.
    pub achieved_coverage: Option<f64>,
    /// `|achieved_coverage - target_coverage|`.
    #[serde(deserialize_with = "parse_missing")]
    pub error: f64,
    /// Every multiplier in the search range gives the same coverage.
    pub flat: bool,
    /// The target could not be reached within `tolerance`.
    pub low_confidence: bool,
    /// Rows that took part in the calibration.
    pub n_valid: usize,
    pub levels: Vec<LevelCoverage>,
}

impl CalibrationReport {
    /// Log the before / after table at the reference levels.
    pub fn log_summary(&self) {
        info!(
            "Calibration factor {:.4} on {} rows, coverage at {:.0}%: {} -> {}",
            self.factor,
            self.n_valid,
            self.target_coverage * 100.0,
            fmt_coverage(self.raw_coverage),
            fmt_coverage(self.achieved_coverage)
        );
        for level in &self.levels {
            info!(
                "  {} (z={:.3}): before {}, after {}",
                level.label,
                level.z,
                fmt_coverage(level.before),
                fmt_coverage(level.after)
            );
        }
    }
}

fn fmt_coverage(c: Option<f64>) -> String {
    match c {
        Some(v) => format!("{:.1}%", v * 100.0),
        None => "undefined".to_string(),
    }
}

/// Calibrate sigma so that `mean ± z * factor * sigma` reaches the target coverage.
///
/// * `y` - True values in log space.
/// * `mean` - Predicted log-space means.
/// * `sigma` - Predicted log-space sigma, `None` where missing.
/// * `cfg` - Target coverage, bounds and search method.
///
/// When every multiplier in the search range yields the same coverage, the
/// bound closest to 1.0 is returned and the report is flagged `flat`. Among
/// equally good multipliers the one closest to 1.0 wins.
pub fn calibrate_sigma(
    y: &[f64],
    mean: &[f64],
    sigma: &[Option<f64>],
    cfg: &CalibrationConfig,
) -> Result<CalibrationReport, PriceboundError> {
    cfg.validate()?;
    if mean.len() != y.len() {
        return Err(PriceboundError::ShapeMismatch("mean".to_string(), y.len(), mean.len()));
    }
    if sigma.len() != y.len() {
        return Err(PriceboundError::ShapeMismatch("sigma".to_string(), y.len(), sigma.len()));
    }
    let valid = n_valid(y, mean, sigma);
    if valid == 0 {
        return Err(PriceboundError::EmptyData("sigma calibration".to_string()));
    }

    let z = z_score(cfg.target_coverage)?;
    let (lo, hi) = cfg.search_bounds;
    let target = cfg.target_coverage;
    let objective = |scale: f64| match scaled_coverage(y, mean, sigma, z, scale) {
        Some(c) => (c - target).abs(),
        None => f64::INFINITY,
    };

    let cov_lo = scaled_coverage(y, mean, sigma, z, lo);
    let cov_hi = scaled_coverage(y, mean, sigma, z, hi);
    let flat = cov_lo == cov_hi;
    let factor = if flat {
        if (lo - 1.0).abs() <= (hi - 1.0).abs() {
            lo
        } else {
            hi
        }
    } else {
        match cfg.method {
            SearchMethod::Plateau => plateau_search(y, mean, sigma, z, target, lo, hi),
            SearchMethod::GoldenSection => minimize_bounded(objective, lo, hi, SCALE_XTOL, GOLDEN_MAX_ITER).0,
        }
    };

    let raw_coverage = scaled_coverage(y, mean, sigma, z, 1.0);
    let achieved_coverage = scaled_coverage(y, mean, sigma, z, factor);
    let error = achieved_coverage.map(|c| (c - target).abs()).unwrap_or(f64::INFINITY);
    let low_confidence = error > cfg.tolerance;

    let levels = REFERENCE_LEVELS
        .iter()
        .map(|(label, confidence, z_ref)| LevelCoverage {
            label: label.to_string(),
            confidence: *confidence,
            z: *z_ref,
            before: scaled_coverage(y, mean, sigma, *z_ref, 1.0),
            after: scaled_coverage(y, mean, sigma, *z_ref, factor),
        })
        .collect();

    if flat {
        warn!(
            "Coverage is constant on [{}, {}], using scale {} without calibration effect.",
            lo, hi, factor
        );
    }
    if low_confidence {
        warn!(
            "Low confidence calibration, best coverage {} is {:.4} away from target {:.2}.",
            fmt_coverage(achieved_coverage),
            error,
            target
        );
    }

    Ok(CalibrationReport {
        factor,
        target_coverage: target,
        raw_coverage,
        achieved_coverage,
        error,
        flat,
        low_confidence,
        n_valid: valid,
        levels,
    })
}

/// Exact search over the plateaus of the coverage step function.
///
/// A row with residual `r` and sigma `s` is covered once the multiplier reaches
/// `|r| / (z * s)`. Those breakpoints split `[lo, hi]` into plateaus of constant
/// coverage; each plateau is represented by its point closest to 1.0, kept off
/// the breakpoints themselves.
fn plateau_search(y: &[f64], mean: &[f64], sigma: &[Option<f64>], z: f64, target: f64, lo: f64, hi: f64) -> f64 {
    let mut always = 0usize;
    let mut valid = 0usize;
    let mut breaks = Vec::new();
    for ((y_, m_), s_) in y.iter().zip(mean).zip(sigma) {
        let s_ = match s_ {
            Some(s) if s.is_finite() && m_.is_finite() && y_.is_finite() => *s,
            _ => continue,
        };
        valid += 1;
        let r = (y_ - m_).abs();
        if s_ == 0.0 {
            if r == 0.0 {
                always += 1;
            }
            continue;
        }
        breaks.push(r / (z * s_));
    }
    breaks.sort_unstable_by(|a, b| a.total_cmp(b));

    let mut points = vec![lo];
    points.extend(breaks.iter().copied().filter(|b| *b > lo && *b < hi));
    points.push(hi);
    points.dedup();

    let coverage_at = |scale: f64| {
        let covered = always + breaks.partition_point(|b| *b <= scale);
        covered as f64 / valid as f64
    };

    let mut best = (f64::INFINITY, f64::INFINITY, lo);
    for window in points.windows(2) {
        let (start, end) = (window[0], window[1]);
        let margin = (end - start) * PLATEAU_MARGIN;
        // The plateau owns its left breakpoint; the range end is included on the last one.
        let rep = if start == lo && 1.0 <= lo {
            lo
        } else if end == hi && 1.0 >= hi {
            hi
        } else {
            1.0_f64.clamp(start + margin, end - margin)
        };
        let err = (coverage_at(rep) - target).abs();
        let dist = (rep - 1.0).abs();
        if err < best.0 - OBJECTIVE_TIE || ((err - best.0).abs() <= OBJECTIVE_TIE && dist < best.1) {
            best = (err, dist, rep);
        }
    }
    best.2
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn scenario() -> (Vec<f64>, Vec<f64>, Vec<Option<f64>>) {
        (vec![9.0, 10.0, 11.0, 12.0], vec![10.0; 4], vec![Some(1.0); 4])
    }

    #[test]
    fn test_small_sample_step_function() {
        let (y, m, s) = scenario();
        let cfg = CalibrationConfig::default().set_target_coverage(0.5);
        let report = calibrate_sigma(&y, &m, &s, &cfg).unwrap();
        // Rows 9 and 11 sit at the same distance, so only 25%, 75% and 100% are
        // reachable; 25% and 75% tie and the plateau closer to 1.0 is kept.
        assert_relative_eq!(report.raw_coverage.unwrap(), 0.25);
        assert_relative_eq!(report.achieved_coverage.unwrap(), 0.25);
        assert_relative_eq!(report.error, 0.25);
        assert_relative_eq!(report.factor, 1.0);
        assert!(report.low_confidence);
        assert!(!report.flat);
        assert_eq!(report.levels.len(), 5);
    }

    #[test]
    fn test_reaches_reachable_target() {
        let y = vec![9.0, 10.0, 11.5, 12.0];
        let (_, m, s) = scenario();
        let cfg = CalibrationConfig::default().set_target_coverage(0.5);
        let report = calibrate_sigma(&y, &m, &s, &cfg).unwrap();
        assert_relative_eq!(report.achieved_coverage.unwrap(), 0.5);
        // Row 9 is covered, row 11.5 is not.
        let z = z_score(0.5).unwrap();
        assert!(report.factor * z >= 1.0 && report.factor * z < 1.5);
        assert!(!report.low_confidence);
    }

    #[test]
    fn test_flat_objective_returns_bound_closest_to_one() {
        let y = vec![1.0, 2.0, 3.0];
        let m = vec![1.0, 2.0, 3.0];
        let s = vec![Some(0.0); 3];
        let report = calibrate_sigma(&y, &m, &s, &CalibrationConfig::default()).unwrap();
        assert!(report.flat);
        assert_eq!(report.factor, 0.5);

        let cfg = CalibrationConfig::default().set_search_bounds((0.2, 1.5));
        let report = calibrate_sigma(&y, &m, &s, &cfg).unwrap();
        assert_eq!(report.factor, 1.5);
    }

    #[test]
    fn test_idempotent_on_calibrated_sigma() {
        let n = 400;
        let m: Vec<f64> = (0..n).map(|i| 11.0 + (i % 7) as f64 * 0.1).collect();
        let y: Vec<f64> = (0..n)
            .map(|i| m[i] + 0.5 * (((i * 37) % 101) as f64 / 50.0 - 1.0))
            .collect();
        let s: Vec<Option<f64>> = vec![Some(0.2); n];
        let cfg = CalibrationConfig::default();
        let first = calibrate_sigma(&y, &m, &s, &cfg).unwrap();
        assert!(first.factor != 1.0);
        let scaled: Vec<Option<f64>> = s.iter().map(|v| v.map(|x| x * first.factor)).collect();
        let second = calibrate_sigma(&y, &m, &scaled, &cfg).unwrap();
        assert_relative_eq!(second.factor, 1.0, epsilon = 1e-9);
        assert_relative_eq!(second.achieved_coverage.unwrap(), first.achieved_coverage.unwrap());
    }

    #[test]
    fn test_golden_section_matches_plateau_error() {
        let n = 300;
        let m = vec![0.0; n];
        let y: Vec<f64> = (0..n).map(|i| (i as f64 / n as f64 - 0.5) * 4.0).collect();
        let s = vec![Some(1.0); n];
        let plateau = calibrate_sigma(&y, &m, &s, &CalibrationConfig::default()).unwrap();
        let golden = calibrate_sigma(
            &y,
            &m,
            &s,
            &CalibrationConfig::default().set_method(SearchMethod::GoldenSection),
        )
        .unwrap();
        assert!(plateau.error <= golden.error + 1e-12);
        assert!(golden.error < 0.02);
    }

    #[test]
    fn test_missing_sigma_rows_are_ignored() {
        let (y, m, mut s) = scenario();
        s[3] = None;
        let report = calibrate_sigma(&y, &m, &s, &CalibrationConfig::default().set_target_coverage(0.5)).unwrap();
        assert_eq!(report.n_valid, 3);
    }

    #[test]
    fn test_errors() {
        let (y, m, _) = scenario();
        let none = vec![None; 4];
        assert!(matches!(
            calibrate_sigma(&y, &m, &none, &CalibrationConfig::default()),
            Err(PriceboundError::EmptyData(_))
        ));
        assert!(matches!(
            calibrate_sigma(&y, &m[..2], &none, &CalibrationConfig::default()),
            Err(PriceboundError::ShapeMismatch(..))
        ));
        let bad = CalibrationConfig::default().set_search_bounds((2.0, 1.0));
        assert!(bad.validate().is_err());
        assert!("Bisection".parse::<SearchMethod>().is_err());
        assert_eq!("GoldenSection".parse::<SearchMethod>().unwrap(), SearchMethod::GoldenSection);
    }
}
