//! Distributional Predictor
//!
//! Capability traits for anything that predicts a log-space mean, and optionally
//! a variance, for a batch of feature rows. A model that cannot estimate a
//! variance still satisfies [`PointPredictor`]; its sigma is reported as missing.
use crate::data::Matrix;
use crate::errors::PriceboundError;
use log::warn;
use serde::{Deserialize, Serialize};

/// A regressor that predicts a point mean per row.
pub trait PointPredictor {
    fn predict_mean(&self, data: &Matrix<f64>) -> Vec<f64>;
}

/// A regressor that may also expose a per-row variance estimate.
pub trait DistributionalPredictor: PointPredictor {
    /// Raw variance estimate per row, `None` when the model has no uncertainty output.
    fn predict_variance(&self, _data: &Matrix<f64>) -> Option<Vec<f64>> {
        None
    }

    /// Number of training rounds chosen by early stopping, if any.
    fn training_length(&self) -> Option<usize> {
        None
    }
}

/// Something that trains a [`DistributionalPredictor`] from a feature matrix and a target.
pub trait Learner: Sync {
    type Model: DistributionalPredictor + Send;

    /// Train a model, optionally early stopping on `eval`.
    fn fit(
        &self,
        data: &Matrix<f64>,
        y: &[f64],
        eval: Option<(&Matrix<f64>, &[f64])>,
    ) -> Result<Self::Model, PriceboundError>;

    /// The same learner with a fixed training length and no early stopping,
    /// used for a final fit without a held out set.
    fn with_training_length(&self, rounds: usize) -> Self
    where
        Self: Sized;
}

/// Mean and standard deviation in log-target space for a batch of rows.
///
/// `sigma_log[i]` is `None` when no uncertainty estimate exists for row `i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DistributionalPrediction {
    pub mean_log: Vec<f64>,
    pub sigma_log: Vec<Option<f64>>,
}

impl DistributionalPrediction {
    pub fn len(&self) -> usize {
        self.mean_log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean_log.is_empty()
    }

    /// True when at least one row carries a sigma.
    pub fn has_sigma(&self) -> bool {
        self.sigma_log.iter().any(|s| s.is_some())
    }

    /// Append another batch, keeping row order.
    pub fn extend(&mut self, other: DistributionalPrediction) {
        self.mean_log.extend(other.mean_log);
        self.sigma_log.extend(other.sigma_log);
    }

    /// Sigma as plain floats, NaN where missing.
    pub fn sigma_or_nan(&self) -> Vec<f64> {
        self.sigma_log.iter().map(|s| s.unwrap_or(f64::NAN)).collect()
    }
}

/// Turn a raw variance into a standard deviation.
///
/// Negative estimates are clamped to zero before the square root; NaN stays
/// missing instead of becoming a made-up number.
#[inline]
pub fn variance_to_sigma(variance: f64) -> Option<f64> {
    if variance.is_nan() {
        None
    } else {
        Some(variance.max(0.0).sqrt())
    }
}

/// Predict mean and sigma for a batch of rows.
///
/// When the model has no variance output, every sigma is `None` and the mean is
/// still returned.
pub fn predict_distribution<P>(model: &P, data: &Matrix<f64>) -> DistributionalPrediction
where
    P: DistributionalPredictor + ?Sized,
{
    let mean_log = model.predict_mean(data);
    let sigma_log = match model.predict_variance(data) {
        Some(var) if var.len() == mean_log.len() => var.into_iter().map(variance_to_sigma).collect(),
        Some(var) => {
            warn!(
                "Variance output has {} rows for {} predictions, reporting sigma as missing.",
                var.len(),
                mean_log.len()
            );
            vec![None; mean_log.len()]
        }
        None => vec![None; mean_log.len()],
    };
    DistributionalPrediction { mean_log, sigma_log }
}
