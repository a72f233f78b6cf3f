use crate::binning::bin_matrix;
use crate::booster::config::BoosterConfig;
use crate::data::Matrix;
use crate::errors::PriceboundError;
use crate::metrics::root_mean_squared_error;
use crate::objective::Objective;
use crate::persistence::{parse_missing, JsonIO};
use crate::tree::{Tree, TreeParams};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Gradient boosted trees with a mean head and an optional log-variance head.
///
/// The mean head minimises squared error. The variance head, fitted when
/// `cfg.uncertainty` is set, minimises the Gaussian negative log likelihood of
/// the mean head's running residuals, so together they describe a per-row
/// normal distribution `N(mean, exp(log_var))`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GradientBooster {
    pub cfg: BoosterConfig,
    #[serde(deserialize_with = "parse_missing")]
    pub base_score: f64,
    pub trees: Vec<Tree>,
    #[serde(deserialize_with = "parse_missing")]
    pub log_variance_base: f64,
    pub variance_trees: Vec<Tree>,
    /// Number of rounds kept after early stopping, set only when an evaluation set was used.
    pub best_iteration: Option<usize>,
    pub n_features: usize,
}

impl Default for GradientBooster {
    fn default() -> Self {
        GradientBooster::new(BoosterConfig::default())
    }
}

impl GradientBooster {
    pub fn new(cfg: BoosterConfig) -> Self {
        GradientBooster {
            cfg,
            base_score: f64::NAN,
            log_variance_base: f64::NAN,
            trees: Vec::new(),
            variance_trees: Vec::new(),
            best_iteration: None,
            n_features: 0,
        }
    }

    pub fn reset(&mut self) {
        self.trees.clear();
        self.variance_trees.clear();
        self.best_iteration = None;
    }

    fn tree_params(&self) -> TreeParams {
        TreeParams {
            max_depth: self.cfg.max_depth,
            min_leaf_size: self.cfg.min_leaf_size,
            lambda: self.cfg.lambda,
            min_split_gain: self.cfg.min_split_gain,
            eta: self.cfg.learning_rate,
        }
    }

    fn validate_data(data: &Matrix<f64>, y: &[f64], what: &str) -> Result<(), PriceboundError> {
        if data.rows != y.len() {
            return Err(PriceboundError::ShapeMismatch(
                format!("{} rows", what),
                data.rows,
                y.len(),
            ));
        }
        if data.rows == 0 {
            return Err(PriceboundError::EmptyData(what.to_string()));
        }
        if let Some((i, v)) = y.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(PriceboundError::NonFiniteTarget(i, *v));
        }
        Ok(())
    }

    /// Fit the booster on a provided dataset.
    ///
    /// * `data` - Column major feature matrix, NaN marks missing values.
    /// * `y` - Target values.
    /// * `eval` - Optional evaluation set used for early stopping. The booster
    ///   is truncated to the round with the lowest evaluation RMSE.
    pub fn fit(
        &mut self,
        data: &Matrix<f64>,
        y: &[f64],
        eval: Option<(&Matrix<f64>, &[f64])>,
    ) -> Result<(), PriceboundError> {
        self.cfg.validate()?;
        Self::validate_data(data, y, "training")?;
        if let Some((x_eval, y_eval)) = eval {
            Self::validate_data(x_eval, y_eval, "evaluation")?;
            if x_eval.cols != data.cols {
                return Err(PriceboundError::ShapeMismatch(
                    "evaluation columns".to_string(),
                    data.cols,
                    x_eval.cols,
                ));
            }
        }

        let binned = bin_matrix(data, None, self.cfg.max_bin);
        if binned.nunique.iter().all(|n| *n <= 1) {
            return Err(PriceboundError::NoVariance(data.cols));
        }

        self.reset();
        self.n_features = data.cols;
        let n = data.rows;
        let params = self.tree_params();
        let mut rng = StdRng::seed_from_u64(self.cfg.seed);

        let mean_obj = Objective::SquaredLoss.function();
        let var_obj = Objective::GaussianLogVariance.function();

        self.base_score = mean_obj.initial_value(y);
        let mut yhat = vec![self.base_score; n];

        let mut resid: Vec<f64> = y.iter().map(|v| v - self.base_score).collect();
        let mut log_var = Vec::new();
        if self.cfg.uncertainty {
            self.log_variance_base = var_obj.initial_value(&resid);
            log_var = vec![self.log_variance_base; n];
        }

        let mut eval_yhat = eval.map(|(x, _)| vec![self.base_score; x.rows]);
        let mut best_eval = f64::INFINITY;
        let mut best_round = 0;
        let mut rounds_without_improvement = 0;

        for iteration in 0..self.cfg.iterations {
            let index: Vec<usize> = if self.cfg.subsample < 1.0 {
                (0..n).filter(|_| rng.gen::<f64>() < self.cfg.subsample).collect()
            } else {
                (0..n).collect()
            };
            if index.is_empty() {
                continue;
            }

            let (g, h) = mean_obj.gradient(y, &yhat);
            let mut tree = Tree::new();
            tree.fit(&binned, n, index.clone(), &g, &h, &params);
            for (r, p) in yhat.iter_mut().enumerate() {
                *p += tree.predict_binned_row(&binned, n, r);
            }

            if self.cfg.uncertainty {
                for ((r, y_), p) in resid.iter_mut().zip(y).zip(&yhat) {
                    *r = y_ - p;
                }
                let (gv, hv) = var_obj.gradient(&resid, &log_var);
                let mut vtree = Tree::new();
                vtree.fit(&binned, n, index, &gv, &hv, &params);
                for (r, s) in log_var.iter_mut().enumerate() {
                    *s += vtree.predict_binned_row(&binned, n, r);
                }
                self.variance_trees.push(vtree);
            }

            let mut eval_rmse = f64::NAN;
            if let (Some((x_eval, y_eval)), Some(ey)) = (eval, eval_yhat.as_mut()) {
                for (p, t) in ey.iter_mut().zip(tree.predict(x_eval, self.cfg.parallel)) {
                    *p += t;
                }
                eval_rmse = root_mean_squared_error(y_eval, ey);
                if eval_rmse < best_eval {
                    best_eval = eval_rmse;
                    best_round = self.trees.len() + 1;
                    rounds_without_improvement = 0;
                } else {
                    rounds_without_improvement += 1;
                }
            }
            self.trees.push(tree);

            if self.cfg.log_iterations > 0 && (iteration + 1) % self.cfg.log_iterations == 0 {
                info!(
                    "round {}, train rmse {:.5}, eval rmse {:.5}, leaves {}",
                    iteration + 1,
                    root_mean_squared_error(y, &yhat),
                    eval_rmse,
                    self.trees.last().map_or(0, |t| t.n_leaves),
                );
            }

            if let Some(stop) = self.cfg.early_stopping_rounds {
                if eval.is_some() && rounds_without_improvement >= stop {
                    info!(
                        "Auto stopping at round {} since eval rmse did not improve for {} rounds, best round {}.",
                        iteration + 1,
                        stop,
                        best_round
                    );
                    break;
                }
            }
        }

        if eval.is_some() {
            let keep = best_round.max(1).min(self.trees.len());
            self.trees.truncate(keep);
            self.variance_trees.truncate(keep);
            self.best_iteration = Some(keep);
            debug!("Kept {} rounds, best eval rmse {:.5}.", keep, best_eval);
        }
        Ok(())
    }

    /// Number of boosting rounds in the fitted model.
    pub fn n_rounds(&self) -> usize {
        self.trees.len()
    }
}

impl JsonIO for GradientBooster {}
