//! Gated Residual Corrector
//!
//! Stage 2 learns the log-space residual of the base model on luxury rows and
//! is blended back in through a sigmoid gate on the base model's own estimate.
//! The gate smoothness is tuned on folds grouped by an identity key, so near
//! duplicate listings never sit on both sides of a split.
use crate::booster::BoosterConfig;
use crate::constants::{DEFAULT_GATE_SMOOTHNESS, DEFAULT_INFLATION_BETA, DEFAULT_LUXURY_THRESHOLD, DEFAULT_MIN_STAGE2_ROWS, DEFAULT_N_FOLDS, DEFAULT_SEED};
use crate::cv::{make_folds, CvConfig, FoldStrategy};
use crate::data::Matrix;
use crate::errors::PriceboundError;
use crate::gate::{combine_mean, Gate};
use crate::metrics::{is_comparison_better, mean_absolute_error, median_absolute_percentage_error};
use crate::persistence::parse_missing;
use crate::predictor::{DistributionalPrediction, DistributionalPredictor, Learner, PointPredictor};
use crate::transform::TargetTransform;
use crate::utils::{fmt_vec_output, median_usize, validate_count_parameter, validate_float_parameter, validate_positive_float_parameter};
use hashbrown::HashSet;
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

fn default_luxury_threshold() -> f64 {
    DEFAULT_LUXURY_THRESHOLD
}
fn default_gate_smoothness() -> Vec<f64> {
    DEFAULT_GATE_SMOOTHNESS.to_vec()
}
fn default_inflation_beta() -> f64 {
    DEFAULT_INFLATION_BETA
}
fn default_n_folds() -> usize {
    DEFAULT_N_FOLDS
}
fn default_min_rows() -> usize {
    DEFAULT_MIN_STAGE2_ROWS
}
fn default_seed() -> u64 {
    DEFAULT_SEED
}
fn default_enabled() -> bool {
    true
}
fn default_booster() -> BoosterConfig {
    BoosterConfig::default().set_uncertainty(false)
}

/// Configuration of the Stage-2 corrector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage2Config {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Price above which a row counts as luxury.
    #[serde(default = "default_luxury_threshold")]
    pub luxury_threshold: f64,
    /// Candidate gate smoothness values in log units.
    #[serde(default = "default_gate_smoothness")]
    pub gate_smoothness: Vec<f64>,
    /// Sigma inflation per unit of gate weight.
    #[serde(default = "default_inflation_beta")]
    pub inflation_beta: f64,
    /// Grouped folds used to tune the gate.
    #[serde(default = "default_n_folds")]
    pub n_folds: usize,
    /// Fewest luxury rows Stage 2 is trained on.
    #[serde(default = "default_min_rows")]
    pub min_rows: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Residual regressor settings.
    #[serde(default = "default_booster")]
    pub booster: BoosterConfig,
}

impl Default for Stage2Config {
    fn default() -> Self {
        Stage2Config {
            enabled: default_enabled(),
            luxury_threshold: default_luxury_threshold(),
            gate_smoothness: default_gate_smoothness(),
            inflation_beta: default_inflation_beta(),
            n_folds: default_n_folds(),
            min_rows: default_min_rows(),
            seed: default_seed(),
            booster: default_booster(),
        }
    }
}

impl Stage2Config {
    pub fn set_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn set_luxury_threshold(mut self, luxury_threshold: f64) -> Self {
        self.luxury_threshold = luxury_threshold;
        self
    }

    pub fn set_gate_smoothness(mut self, gate_smoothness: Vec<f64>) -> Self {
        self.gate_smoothness = gate_smoothness;
        self
    }

    pub fn set_inflation_beta(mut self, inflation_beta: f64) -> Self {
        self.inflation_beta = inflation_beta;
        self
    }

    pub fn set_n_folds(mut self, n_folds: usize) -> Self {
        self.n_folds = n_folds;
        self
    }

    pub fn set_min_rows(mut self, min_rows: usize) -> Self {
        self.min_rows = min_rows;
        self
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn set_booster(mut self, booster: BoosterConfig) -> Self {
        self.booster = booster;
        self
    }

    pub fn validate(&self) -> Result<(), PriceboundError> {
        validate_positive_float_parameter(self.luxury_threshold, "luxury_threshold")?;
        if self.gate_smoothness.is_empty() {
            return Err(PriceboundError::InvalidParameter(
                "gate_smoothness".to_string(),
                "at least one candidate".to_string(),
                "[]".to_string(),
            ));
        }
        for tau in &self.gate_smoothness {
            validate_positive_float_parameter(*tau, "gate_smoothness")?;
        }
        validate_float_parameter(self.inflation_beta, 0.0, f64::MAX, "inflation_beta")?;
        validate_count_parameter(self.n_folds, 2, "n_folds")?;
        validate_count_parameter(self.min_rows, 1, "min_rows")?;
        self.booster.validate()
    }
}

/// Held out error of one gate smoothness candidate, averaged across folds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothnessTrial {
    pub smoothness: f64,
    #[serde(deserialize_with = "parse_missing")]
    pub medape: f64,
    #[serde(deserialize_with = "parse_missing")]
    pub mae: f64,
}

/// A trained Stage-2 residual model with its gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualCorrector<M> {
    pub model: M,
    pub gate: Gate,
    pub inflation_beta: f64,
    /// Luxury rows the final model was trained on.
    pub n_rows: usize,
    /// Training length reused from the tuning folds.
    pub training_length: Option<usize>,
    pub trials: Vec<SmoothnessTrial>,
}

/// Result of trying to train Stage 2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stage2Outcome<M> {
    Trained(ResidualCorrector<M>),
    /// Too little luxury data, predictions fall back to the base model.
    Skipped { reason: String },
}

/// Base features with the base model's mean and sigma appended as two columns.
pub fn stage2_features(data: &Matrix<f64>, stage1: &DistributionalPrediction) -> Vec<f64> {
    let sigma = stage1.sigma_or_nan();
    data.with_columns(&[stage1.mean_log.as_slice(), sigma.as_slice()])
}

impl<M: PointPredictor> ResidualCorrector<M> {
    /// Residual prediction for rows described by `data` and the base prediction.
    pub fn predict_residual(&self, data: &Matrix<f64>, stage1: &DistributionalPrediction) -> Vec<f64> {
        let features = stage2_features(data, stage1);
        let matrix = Matrix::new(&features, data.rows, data.cols + 2);
        self.model.predict_mean(&matrix)
    }

    /// Gate weights and corrected log means.
    pub fn correct(&self, data: &Matrix<f64>, stage1: &DistributionalPrediction) -> (Vec<f64>, Vec<f64>) {
        let residual = self.predict_residual(data, stage1);
        let weights = self.gate.weights(&stage1.mean_log);
        let corrected = stage1
            .mean_log
            .iter()
            .zip(&weights)
            .zip(&residual)
            .map(|((m, w), r)| combine_mean(*m, *w, *r))
            .collect();
        (weights, corrected)
    }
}

struct TuningFold {
    errors: Vec<(f64, f64)>,
    best_iteration: Option<usize>,
}

#[allow(clippy::too_many_arguments)]
fn tune_fold<L: Learner>(
    learner: &L,
    features: &Matrix<f64>,
    y: &[f64],
    mean_log: &[f64],
    train: &[usize],
    valid: &[usize],
    candidates: &[f64],
    threshold_log: f64,
    transform: TargetTransform,
) -> Result<TuningFold, PriceboundError> {
    let x_train = features.take_rows(train);
    let x_valid = features.take_rows(valid);
    let m_train = Matrix::new(&x_train, train.len(), features.cols);
    let m_valid = Matrix::new(&x_valid, valid.len(), features.cols);
    let r_train: Vec<f64> = train.iter().map(|i| y[*i] - mean_log[*i]).collect();
    let r_valid: Vec<f64> = valid.iter().map(|i| y[*i] - mean_log[*i]).collect();

    let model = learner.fit(&m_train, &r_train, Some((&m_valid, &r_valid)))?;
    let residual = model.predict_mean(&m_valid);
    let y_price: Vec<f64> = valid.iter().map(|i| transform.inverse(y[*i])).collect();

    // Only the gate changes between candidates.
    let mut errors = Vec::with_capacity(candidates.len());
    for tau in candidates {
        let gate = Gate::new(threshold_log, *tau)?;
        let yhat_price: Vec<f64> = valid
            .iter()
            .zip(&residual)
            .map(|(i, r)| transform.inverse(combine_mean(mean_log[*i], gate.weight(mean_log[*i]), *r)))
            .collect();
        errors.push((
            median_absolute_percentage_error(&y_price, &yhat_price),
            mean_absolute_error(&y_price, &yhat_price),
        ));
    }
    Ok(TuningFold {
        errors,
        best_iteration: model.training_length(),
    })
}

/// Index of the trial with the lowest MedAPE, ties broken by MAE.
fn select_trial(trials: &[SmoothnessTrial]) -> usize {
    let mut best = 0;
    for (i, t) in trials.iter().enumerate().skip(1) {
        let b = &trials[best];
        let better = if t.medape == b.medape {
            is_comparison_better(b.mae, t.mae)
        } else {
            is_comparison_better(b.medape, t.medape)
        };
        if better {
            best = i;
        }
    }
    best
}

/// Train the Stage-2 corrector on out-of-fold base predictions.
///
/// * `learner` - Residual regressor.
/// * `data` - Base features of every training row.
/// * `y` - Log-space target of every training row.
/// * `stage1` - Out-of-fold base predictions for the same rows.
/// * `groups` - Identity key per row used for the grouped tuning folds.
/// * `transform` - Target transform, used for the threshold and price errors.
/// * `cfg` - Stage-2 settings.
/// * `parallel` - Tune folds concurrently.
///
/// Returns [`Stage2Outcome::Skipped`] when the luxury subset is too small or
/// has fewer groups than tuning folds.
#[allow(clippy::too_many_arguments)]
pub fn fit_corrector<L: Learner>(
    learner: &L,
    data: &Matrix<f64>,
    y: &[f64],
    stage1: &DistributionalPrediction,
    groups: &[String],
    transform: TargetTransform,
    cfg: &Stage2Config,
    parallel: bool,
) -> Result<Stage2Outcome<L::Model>, PriceboundError> {
    cfg.validate()?;
    for (name, len) in [("target", y.len()), ("stage 1 prediction", stage1.len()), ("groups", groups.len())] {
        if len != data.rows {
            return Err(PriceboundError::ShapeMismatch(name.to_string(), data.rows, len));
        }
    }
    if !cfg.enabled {
        return Ok(Stage2Outcome::Skipped {
            reason: "disabled".to_string(),
        });
    }

    let luxury: Vec<usize> = (0..data.rows)
        .filter(|i| transform.inverse(y[*i]) > cfg.luxury_threshold && stage1.mean_log[*i].is_finite())
        .collect();
    let n_groups = luxury.iter().map(|i| groups[*i].as_str()).collect::<HashSet<_>>().len();
    if luxury.len() < cfg.min_rows || n_groups < cfg.n_folds {
        let reason = format!(
            "{} luxury rows in {} groups, need {} rows and {} groups",
            luxury.len(),
            n_groups,
            cfg.min_rows,
            cfg.n_folds
        );
        warn!("Skipping Stage 2, predictions use the base model only: {}.", reason);
        return Ok(Stage2Outcome::Skipped { reason });
    }

    let base = data.take_rows(&luxury);
    let base = Matrix::new(&base, luxury.len(), data.cols);
    let lux_stage1 = DistributionalPrediction {
        mean_log: luxury.iter().map(|i| stage1.mean_log[*i]).collect(),
        sigma_log: luxury.iter().map(|i| stage1.sigma_log[*i]).collect(),
    };
    let lux_y: Vec<f64> = luxury.iter().map(|i| y[*i]).collect();
    let lux_groups: Vec<String> = luxury.iter().map(|i| groups[*i].clone()).collect();
    let features = stage2_features(&base, &lux_stage1);
    let features = Matrix::new(&features, luxury.len(), data.cols + 2);
    let threshold_log = transform.forward(cfg.luxury_threshold);

    let cv = CvConfig::default()
        .set_n_folds(cfg.n_folds)
        .set_strategy(FoldStrategy::Grouped)
        .set_seed(cfg.seed);
    let folds = make_folds(&cv, &lux_y, Some(&lux_groups))?;

    info!(
        "Tuning gate smoothness over [{}] on {} luxury rows in {} groups.",
        fmt_vec_output(&cfg.gate_smoothness),
        luxury.len(),
        n_groups
    );
    let run = |k: usize| {
        tune_fold(
            learner,
            &features,
            &lux_y,
            &lux_stage1.mean_log,
            &folds.train_indices(k),
            &folds.validation_indices(k),
            &cfg.gate_smoothness,
            threshold_log,
            transform,
        )
        .map_err(|e| PriceboundError::FoldTraining {
            fold: k,
            source: Box::new(e),
        })
    };
    let tuned: Vec<TuningFold> = if parallel {
        (0..folds.n_folds).into_par_iter().map(run).collect::<Result<_, _>>()?
    } else {
        (0..folds.n_folds).map(run).collect::<Result<_, _>>()?
    };

    let n_folds = tuned.len() as f64;
    let trials: Vec<SmoothnessTrial> = cfg
        .gate_smoothness
        .iter()
        .enumerate()
        .map(|(j, tau)| SmoothnessTrial {
            smoothness: *tau,
            medape: tuned.iter().map(|f| f.errors[j].0).sum::<f64>() / n_folds,
            mae: tuned.iter().map(|f| f.errors[j].1).sum::<f64>() / n_folds,
        })
        .collect();
    for t in &trials {
        info!("Gate smoothness {}: MedAPE {:.3}%, MAE {:.0}", t.smoothness, t.medape, t.mae);
    }
    let best = &trials[select_trial(&trials)];

    let iterations: Vec<usize> = tuned.iter().filter_map(|f| f.best_iteration).collect();
    let training_length = median_usize(&iterations);
    let residual: Vec<f64> = lux_y.iter().zip(&lux_stage1.mean_log).map(|(y_, m_)| y_ - m_).collect();
    let model = match training_length {
        Some(rounds) => learner.with_training_length(rounds).fit(&features, &residual, None)?,
        None => learner.fit(&features, &residual, None)?,
    };
    info!(
        "Stage 2 trained on {} luxury rows, gate smoothness {}, training length {:?}",
        luxury.len(),
        best.smoothness,
        training_length
    );

    Ok(Stage2Outcome::Trained(ResidualCorrector {
        model,
        gate: Gate::new(threshold_log, best.smoothness)?,
        inflation_beta: cfg.inflation_beta,
        n_rows: luxury.len(),
        training_length,
        trials,
    }))
}
