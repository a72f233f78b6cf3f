//! Objective functions
//!
//! Losses minimised by the two heads of the gradient booster.
use crate::constants::{HESSIAN_EPS, LOG_VARIANCE_CLIP};
use serde::{Deserialize, Serialize};

/// Trait defining an objective function.
///
/// Only [`loss`](ObjectiveFunction::loss) and [`gradient`](ObjectiveFunction::gradient)
/// are required; `initial_value` defaults to the mean of `y`.
pub trait ObjectiveFunction: Send + Sync {
    /// Per-sample loss.
    ///
    /// # Arguments
    /// * `y` – target values.
    /// * `yhat` – current raw predictions.
    fn loss(&self, y: &[f64], yhat: &[f64]) -> Vec<f64>;

    /// Per-sample gradient and hessian of the loss w.r.t. `yhat`.
    fn gradient(&self, y: &[f64], yhat: &[f64]) -> (Vec<f64>, Vec<f64>);

    /// Initial prediction before any trees are added.
    fn initial_value(&self, y: &[f64]) -> f64 {
        if y.is_empty() {
            0.0
        } else {
            y.iter().sum::<f64>() / y.len() as f64
        }
    }
}

/// The objectives available to a booster head.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Default)]
pub enum Objective {
    /// Squared error for the mean head, minimises `(y - ŷ)²`.
    #[default]
    SquaredLoss,
    /// Gaussian negative log likelihood of residuals for the log-variance head.
    ///
    /// Here `y` holds residuals `r` of the mean head and `ŷ` is `s = log σ²`;
    /// the loss is `0.5 * (s + r² e^{-s})`.
    GaussianLogVariance,
}

impl Objective {
    pub fn function(&self) -> Box<dyn ObjectiveFunction> {
        match self {
            Objective::SquaredLoss => Box::new(SquaredLoss::default()),
            Objective::GaussianLogVariance => Box::new(GaussianLogVariance::default()),
        }
    }
}

#[derive(Default, Debug, Deserialize, Serialize, Clone)]
pub struct SquaredLoss {}

impl ObjectiveFunction for SquaredLoss {
    #[inline]
    fn loss(&self, y: &[f64], yhat: &[f64]) -> Vec<f64> {
        y.iter()
            .zip(yhat)
            .map(|(y_, yhat_)| {
                let s = *y_ - *yhat_;
                s * s
            })
            .collect()
    }

    #[inline]
    fn gradient(&self, y: &[f64], yhat: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let g = y.iter().zip(yhat).map(|(y_, yhat_)| yhat_ - y_).collect();
        (g, vec![1.0; y.len()])
    }
}

#[derive(Default, Debug, Deserialize, Serialize, Clone)]
pub struct GaussianLogVariance {}

impl ObjectiveFunction for GaussianLogVariance {
    fn loss(&self, y: &[f64], yhat: &[f64]) -> Vec<f64> {
        y.iter()
            .zip(yhat)
            .map(|(r, s)| {
                let s = s.clamp(-LOG_VARIANCE_CLIP, LOG_VARIANCE_CLIP);
                0.5 * (s + r * r * (-s).exp())
            })
            .collect()
    }

    // Fisher scoring: the expected hessian is a constant 0.5, which keeps the
    // Newton steps stable where r² e^{-s} is tiny.
    fn gradient(&self, y: &[f64], yhat: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let g = y
            .iter()
            .zip(yhat)
            .map(|(r, s)| {
                let s = s.clamp(-LOG_VARIANCE_CLIP, LOG_VARIANCE_CLIP);
                0.5 * (1.0 - r * r * (-s).exp())
            })
            .collect();
        (g, vec![0.5; y.len()])
    }

    /// Log of the mean squared residual.
    fn initial_value(&self, y: &[f64]) -> f64 {
        if y.is_empty() {
            return 0.0;
        }
        let ms = y.iter().map(|r| r * r).sum::<f64>() / y.len() as f64;
        ms.max(HESSIAN_EPS).ln()
    }
}
