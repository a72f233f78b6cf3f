//! Cross Validation
//!
//! Fold assignment and the out-of-fold training harness. Every row is held out
//! exactly once, so the concatenated out-of-fold predictions cover the training
//! set with no duplicates and no gaps.
use crate::constants::{DEFAULT_N_FOLDS, DEFAULT_SEED, DEFAULT_STRATIFICATION_BINS, FOLD_COVERAGE_SIGMAS};
use crate::coverage::coverage;
use crate::data::Matrix;
use crate::errors::PriceboundError;
use crate::metrics::{mean_absolute_error, median_absolute_percentage_error, r2_score, root_mean_squared_error};
use crate::persistence::parse_missing;
use crate::predictor::{predict_distribution, DistributionalPrediction, DistributionalPredictor, Learner};
use crate::transform::TargetTransform;
use crate::utils::{items_to_strings, median_usize, nan_mean, nan_median, validate_count_parameter};
use hashbrown::HashMap;
use log::info;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FoldStrategy {
    /// Shuffle once and deal rows round robin.
    Random,
    /// Bucket the target into quantile bins and deal each bin round robin.
    #[default]
    Stratified,
    /// Keep every group key inside a single fold.
    Grouped,
}

impl FromStr for FoldStrategy {
    type Err = PriceboundError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Random" => Ok(FoldStrategy::Random),
            "Stratified" => Ok(FoldStrategy::Stratified),
            "Grouped" => Ok(FoldStrategy::Grouped),
            _ => Err(PriceboundError::ParseString(
                s.to_string(),
                "FoldStrategy".to_string(),
                items_to_strings(vec!["Random", "Stratified", "Grouped"]),
            )),
        }
    }
}

fn default_n_folds() -> usize {
    DEFAULT_N_FOLDS
}
fn default_stratification_bins() -> usize {
    DEFAULT_STRATIFICATION_BINS
}
fn default_seed() -> u64 {
    DEFAULT_SEED
}
fn default_parallel() -> bool {
    true
}

/// Configuration of the out-of-fold harness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvConfig {
    #[serde(default = "default_n_folds")]
    pub n_folds: usize,
    #[serde(default)]
    pub strategy: FoldStrategy,
    /// Number of target quantile bins for `Stratified`.
    #[serde(default = "default_stratification_bins")]
    pub stratification_bins: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Train folds concurrently.
    #[serde(default = "default_parallel")]
    pub parallel: bool,
}

impl Default for CvConfig {
    fn default() -> Self {
        CvConfig {
            n_folds: default_n_folds(),
            strategy: FoldStrategy::default(),
            stratification_bins: default_stratification_bins(),
            seed: default_seed(),
            parallel: default_parallel(),
        }
    }
}

impl CvConfig {
    pub fn set_n_folds(mut self, n_folds: usize) -> Self {
        self.n_folds = n_folds;
        self
    }

    pub fn set_strategy(mut self, strategy: FoldStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn set_stratification_bins(mut self, stratification_bins: usize) -> Self {
        self.stratification_bins = stratification_bins;
        self
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn set_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn validate(&self) -> Result<(), PriceboundError> {
        validate_count_parameter(self.n_folds, 2, "n_folds")?;
        validate_count_parameter(self.stratification_bins, 1, "stratification_bins")
    }
}

/// Fold index of every row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldAssignment {
    pub n_folds: usize,
    pub fold_of: Vec<usize>,
}

impl FoldAssignment {
    pub fn n_rows(&self) -> usize {
        self.fold_of.len()
    }

    /// Rows held out in fold `k`, in ascending order.
    pub fn validation_indices(&self, k: usize) -> Vec<usize> {
        self.fold_of
            .iter()
            .enumerate()
            .filter_map(|(i, f)| (*f == k).then_some(i))
            .collect()
    }

    /// Rows used for training in fold `k`, in ascending order.
    pub fn train_indices(&self, k: usize) -> Vec<usize> {
        self.fold_of
            .iter()
            .enumerate()
            .filter_map(|(i, f)| (*f != k).then_some(i))
            .collect()
    }

    pub fn fold_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.n_folds];
        for f in &self.fold_of {
            sizes[*f] += 1;
        }
        sizes
    }
}

/// Assign `n` rows to `cfg.n_folds` folds.
///
/// * `y` - Target, used by `Stratified`. Must have `n` entries.
/// * `groups` - Group key per row, required by `Grouped`.
pub fn make_folds(cfg: &CvConfig, y: &[f64], groups: Option<&[String]>) -> Result<FoldAssignment, PriceboundError> {
    cfg.validate()?;
    let n = y.len();
    let k = cfg.n_folds;
    if n < k {
        return Err(PriceboundError::InvalidParameter(
            "n_folds".to_string(),
            format!("at most the number of rows ({})", n),
            k.to_string(),
        ));
    }
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut fold_of = vec![0; n];
    match cfg.strategy {
        FoldStrategy::Random => {
            let mut idx: Vec<usize> = (0..n).collect();
            idx.shuffle(&mut rng);
            for (pos, i) in idx.into_iter().enumerate() {
                fold_of[i] = pos % k;
            }
        }
        FoldStrategy::Stratified => {
            let bins = cfg.stratification_bins.min(n);
            let mut order: Vec<usize> = (0..n).collect();
            order.sort_by(|a, b| y[*a].total_cmp(&y[*b]));
            let mut members: Vec<Vec<usize>> = vec![Vec::new(); bins];
            for (rank, i) in order.into_iter().enumerate() {
                members[rank * bins / n].push(i);
            }
            // The deal continues across bins so fold sizes differ by at most one.
            let mut next = 0;
            for mut bin in members {
                bin.shuffle(&mut rng);
                for i in bin {
                    fold_of[i] = next % k;
                    next += 1;
                }
            }
        }
        FoldStrategy::Grouped => {
            let groups = groups.ok_or_else(|| {
                PriceboundError::InvalidParameter(
                    "groups".to_string(),
                    "a group key per row for Grouped folds".to_string(),
                    "None".to_string(),
                )
            })?;
            if groups.len() != n {
                return Err(PriceboundError::ShapeMismatch("groups".to_string(), n, groups.len()));
            }
            let mut rows_of: HashMap<&str, Vec<usize>> = HashMap::new();
            for (i, g) in groups.iter().enumerate() {
                rows_of.entry(g.as_str()).or_default().push(i);
            }
            if rows_of.len() < k {
                return Err(PriceboundError::InvalidParameter(
                    "n_folds".to_string(),
                    format!("at most the number of groups ({})", rows_of.len()),
                    k.to_string(),
                ));
            }
            let mut keys: Vec<&str> = rows_of.keys().copied().collect();
            keys.sort_unstable();
            keys.shuffle(&mut rng);
            let mut sizes = vec![0usize; k];
            for key in keys {
                let f = (0..k).min_by_key(|f| (sizes[*f], *f)).unwrap_or(0);
                for i in &rows_of[key] {
                    fold_of[*i] = f;
                }
                sizes[f] += rows_of[key].len();
            }
        }
    }
    Ok(FoldAssignment { n_folds: k, fold_of })
}

/// Diagnostics for one trained fold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldMetrics {
    pub fold: usize,
    pub n_train: usize,
    pub n_valid: usize,
    #[serde(deserialize_with = "parse_missing")]
    pub rmse_log: f64,
    #[serde(deserialize_with = "parse_missing")]
    pub r2_log: f64,
    #[serde(deserialize_with = "parse_missing")]
    pub mae_price: f64,
    #[serde(deserialize_with = "parse_missing")]
    pub medape: f64,
    pub mean_sigma: Option<f64>,
    pub median_sigma: Option<f64>,
    /// Share of held out rows inside `mean ± 2 sigma`.
    pub coverage_2sigma: Option<f64>,
    pub best_iteration: Option<usize>,
}

impl FoldMetrics {
    fn compute(
        fold: usize,
        n_train: usize,
        y: &[f64],
        pred: &DistributionalPrediction,
        transform: TargetTransform,
        best_iteration: Option<usize>,
    ) -> Self {
        let sigma = pred.sigma_or_nan();
        let y_price = transform.inverse_all(y);
        let yhat_price = transform.inverse_all(&pred.mean_log);
        FoldMetrics {
            fold,
            n_train,
            n_valid: y.len(),
            rmse_log: root_mean_squared_error(y, &pred.mean_log),
            r2_log: r2_score(y, &pred.mean_log),
            mae_price: mean_absolute_error(&y_price, &yhat_price),
            medape: median_absolute_percentage_error(&y_price, &yhat_price),
            mean_sigma: nan_mean(&sigma),
            median_sigma: nan_median(&sigma),
            coverage_2sigma: coverage(y, &pred.mean_log, &pred.sigma_log, FOLD_COVERAGE_SIGMAS),
            best_iteration,
        }
    }
}

/// Fold metrics averaged across folds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvSummary {
    #[serde(deserialize_with = "parse_missing")]
    pub rmse_log: f64,
    #[serde(deserialize_with = "parse_missing")]
    pub r2_log: f64,
    #[serde(deserialize_with = "parse_missing")]
    pub mae_price: f64,
    #[serde(deserialize_with = "parse_missing")]
    pub medape: f64,
    pub mean_sigma: Option<f64>,
    pub coverage_2sigma: Option<f64>,
    pub median_best_iteration: Option<usize>,
}

/// Out-of-fold predictions for every training row, in the original row order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutOfFold {
    pub y: Vec<f64>,
    pub prediction: DistributionalPrediction,
    pub folds: FoldAssignment,
    pub fold_metrics: Vec<FoldMetrics>,
}

impl OutOfFold {
    /// Median of the per-fold best iterations, `None` if no fold used early stopping.
    pub fn median_best_iteration(&self) -> Option<usize> {
        let its: Vec<usize> = self.fold_metrics.iter().filter_map(|m| m.best_iteration).collect();
        median_usize(&its)
    }

    pub fn summary(&self) -> CvSummary {
        let m = &self.fold_metrics;
        CvSummary {
            rmse_log: fold_mean(m, |f| f.rmse_log).unwrap_or(f64::NAN),
            r2_log: fold_mean(m, |f| f.r2_log).unwrap_or(f64::NAN),
            mae_price: fold_mean(m, |f| f.mae_price).unwrap_or(f64::NAN),
            medape: fold_mean(m, |f| f.medape).unwrap_or(f64::NAN),
            mean_sigma: fold_mean(m, |f| f.mean_sigma.unwrap_or(f64::NAN)),
            coverage_2sigma: fold_mean(m, |f| f.coverage_2sigma.unwrap_or(f64::NAN)),
            median_best_iteration: self.median_best_iteration(),
        }
    }
}

fn fold_mean<F: Fn(&FoldMetrics) -> f64>(metrics: &[FoldMetrics], f: F) -> Option<f64> {
    let v: Vec<f64> = metrics.iter().map(f).collect();
    nan_mean(&v)
}

struct FoldResult {
    rows: Vec<usize>,
    prediction: DistributionalPrediction,
    metrics: FoldMetrics,
}

fn run_fold<L: Learner>(
    learner: &L,
    data: &Matrix<f64>,
    y: &[f64],
    folds: &FoldAssignment,
    k: usize,
    transform: TargetTransform,
) -> Result<FoldResult, PriceboundError> {
    let train = folds.train_indices(k);
    let valid = folds.validation_indices(k);
    let x_train = data.take_rows(&train);
    let x_valid = data.take_rows(&valid);
    let m_train = Matrix::new(&x_train, train.len(), data.cols);
    let m_valid = Matrix::new(&x_valid, valid.len(), data.cols);
    let y_train: Vec<f64> = train.iter().map(|i| y[*i]).collect();
    let y_valid: Vec<f64> = valid.iter().map(|i| y[*i]).collect();

    let model = learner.fit(&m_train, &y_train, Some((&m_valid, &y_valid)))?;
    let prediction = predict_distribution(&model, &m_valid);
    let metrics = FoldMetrics::compute(k, train.len(), &y_valid, &prediction, transform, model.training_length());
    info!(
        "Fold {}: RMSE(log) {:.4}, R2(log) {:.4}, MAE {:.0}, MedAPE {:.2}%, best iteration {:?}",
        k, metrics.rmse_log, metrics.r2_log, metrics.mae_price, metrics.medape, metrics.best_iteration
    );
    Ok(FoldResult {
        rows: valid,
        prediction,
        metrics,
    })
}

/// Train one model per fold on the other folds and predict the held out rows.
///
/// A failing fold aborts the run with [`PriceboundError::FoldTraining`].
pub fn cross_validate<L: Learner>(
    learner: &L,
    data: &Matrix<f64>,
    y: &[f64],
    folds: &FoldAssignment,
    transform: TargetTransform,
    parallel: bool,
) -> Result<OutOfFold, PriceboundError> {
    if data.rows != y.len() {
        return Err(PriceboundError::ShapeMismatch("target".to_string(), data.rows, y.len()));
    }
    if folds.n_rows() != y.len() {
        return Err(PriceboundError::ShapeMismatch("fold assignment".to_string(), y.len(), folds.n_rows()));
    }
    let results: Vec<Result<FoldResult, PriceboundError>> = if parallel {
        (0..folds.n_folds)
            .into_par_iter()
            .map(|k| run_fold(learner, data, y, folds, k, transform))
            .collect()
    } else {
        (0..folds.n_folds)
            .map(|k| run_fold(learner, data, y, folds, k, transform))
            .collect()
    };

    let n = y.len();
    let mut mean_log = vec![f64::NAN; n];
    let mut sigma_log = vec![None; n];
    let mut fold_metrics = Vec::with_capacity(folds.n_folds);
    for (k, result) in results.into_iter().enumerate() {
        let result = result.map_err(|e| PriceboundError::FoldTraining {
            fold: k,
            source: Box::new(e),
        })?;
        for (j, i) in result.rows.iter().enumerate() {
            mean_log[*i] = result.prediction.mean_log[j];
            sigma_log[*i] = result.prediction.sigma_log[j];
        }
        fold_metrics.push(result.metrics);
    }

    let oof = OutOfFold {
        y: y.to_vec(),
        prediction: DistributionalPrediction { mean_log, sigma_log },
        folds: folds.clone(),
        fold_metrics,
    };
    let s = oof.summary();
    info!(
        "CV over {} folds: RMSE(log) {:.4}, R2(log) {:.4}, MAE {:.0}, MedAPE {:.2}%, 2-sigma coverage {:?}",
        folds.n_folds, s.rmse_log, s.r2_log, s.mae_price, s.medape, s.coverage_2sigma
    );
    Ok(oof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booster::BoosterConfig;
    use crate::predictor::PointPredictor;

    fn check_partition(folds: &FoldAssignment) {
        let mut seen = vec![0; folds.n_rows()];
        for k in 0..folds.n_folds {
            for i in folds.validation_indices(k) {
                seen[i] += 1;
            }
            assert_eq!(
                folds.train_indices(k).len() + folds.validation_indices(k).len(),
                folds.n_rows()
            );
        }
        assert!(seen.iter().all(|c| *c == 1));
    }

    #[test]
    fn test_every_row_held_out_once() {
        for strategy in [FoldStrategy::Random, FoldStrategy::Stratified] {
            for (n, k) in [(2, 2), (10, 3), (101, 5), (57, 10)] {
                let y: Vec<f64> = (0..n).map(|i| ((i * 7) % 13) as f64).collect();
                let cfg = CvConfig::default().set_n_folds(k).set_strategy(strategy);
                let folds = make_folds(&cfg, &y, None).unwrap();
                check_partition(&folds);
                let sizes = folds.fold_sizes();
                assert!(sizes.iter().max().unwrap() - sizes.iter().min().unwrap() <= 1);
            }
        }
    }

    #[test]
    fn test_folds_are_deterministic() {
        let y: Vec<f64> = (0..50).map(|i| i as f64).collect();
        let cfg = CvConfig::default().set_strategy(FoldStrategy::Random);
        let a = make_folds(&cfg, &y, None).unwrap();
        let b = make_folds(&cfg, &y, None).unwrap();
        assert_eq!(a, b);
        let c = make_folds(&cfg.clone().set_seed(7), &y, None).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_stratified_balances_quantile_bins() {
        let n = 1000;
        let y: Vec<f64> = (0..n).map(|i| ((i * 7919) % n) as f64).collect();
        let cfg = CvConfig::default();
        let folds = make_folds(&cfg, &y, None).unwrap();
        check_partition(&folds);
        // Each tenth of the target range holds 100 rows, 20 per fold.
        for b in 0..10 {
            let mut per_fold = vec![0; 5];
            for (i, f) in folds.fold_of.iter().enumerate() {
                if (y[i] as usize) * 10 / n == b {
                    per_fold[*f] += 1;
                }
            }
            assert!(per_fold.iter().all(|c| *c == 20), "bin {} {:?}", b, per_fold);
        }
    }

    #[test]
    fn test_grouped_keeps_groups_together() {
        let groups: Vec<String> = (0..60).map(|i| format!("brand{}", i % 8)).collect();
        let y = vec![0.0; 60];
        let cfg = CvConfig::default().set_strategy(FoldStrategy::Grouped).set_n_folds(4);
        let folds = make_folds(&cfg, &y, Some(&groups)).unwrap();
        check_partition(&folds);
        let mut fold_of_group: HashMap<&str, usize> = HashMap::new();
        for (i, g) in groups.iter().enumerate() {
            let f = *fold_of_group.entry(g.as_str()).or_insert(folds.fold_of[i]);
            assert_eq!(f, folds.fold_of[i]);
        }
        assert!(folds.fold_sizes().iter().all(|s| *s > 0));
    }

    #[test]
    fn test_fold_errors() {
        let y = vec![1.0, 2.0, 3.0];
        assert!(make_folds(&CvConfig::default(), &y, None).is_err());
        assert!(make_folds(&CvConfig::default().set_n_folds(1), &y, None).is_err());
        let cfg = CvConfig::default().set_strategy(FoldStrategy::Grouped).set_n_folds(2);
        assert!(make_folds(&cfg, &y, None).is_err());
        let one_group = vec!["a".to_string(); 3];
        assert!(make_folds(&cfg, &y, Some(&one_group)).is_err());
        assert!("Kfold".parse::<FoldStrategy>().is_err());
    }

    #[test]
    fn test_cross_validate_out_of_fold() {
        let n = 200;
        let x: Vec<f64> = (0..n).map(|i| (i % 20) as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 11.0 + 0.1 * v).collect();
        let data = Matrix::new(&x, n, 1);
        let learner = BoosterConfig::default().set_iterations(30).set_early_stopping_rounds(Some(5));
        let folds = make_folds(&CvConfig::default(), &y, None).unwrap();
        let oof = cross_validate(&learner, &data, &y, &folds, TargetTransform::Log1p, true).unwrap();
        assert_eq!(oof.prediction.len(), n);
        assert!(oof.prediction.mean_log.iter().all(|m| m.is_finite()));
        assert!(oof.prediction.has_sigma());
        assert_eq!(oof.fold_metrics.len(), 5);
        assert!(oof.fold_metrics.iter().all(|m| m.best_iteration.is_some()));
        assert!(oof.median_best_iteration().is_some());

        let sequential = cross_validate(&learner, &data, &y, &folds, TargetTransform::Log1p, false).unwrap();
        assert_eq!(oof, sequential);
    }

    struct Failing;
    struct Never;
    impl PointPredictor for Never {
        fn predict_mean(&self, data: &Matrix<f64>) -> Vec<f64> {
            vec![0.0; data.rows]
        }
    }
    impl DistributionalPredictor for Never {}
    impl Learner for Failing {
        type Model = Never;
        fn fit(&self, data: &Matrix<f64>, _y: &[f64], _eval: Option<(&Matrix<f64>, &[f64])>) -> Result<Never, PriceboundError> {
            if data.get(0, 0) == &0.0 {
                Err(PriceboundError::NoVariance(data.cols))
            } else {
                Ok(Never)
            }
        }
        fn with_training_length(&self, _rounds: usize) -> Self {
            Failing
        }
    }

    #[test]
    fn test_failing_fold_aborts() {
        // Row 0 holds the only zero, so every fold that trains on it fails and
        // the first of those is reported.
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y: Vec<f64> = x.clone();
        let data = Matrix::new(&x, 10, 1);
        let cfg = CvConfig::default().set_strategy(FoldStrategy::Random).set_n_folds(2);
        let folds = make_folds(&cfg, &y, None).unwrap();
        let expected = 1 - folds.fold_of[0];
        match cross_validate(&Failing, &data, &y, &folds, TargetTransform::Log, false) {
            Err(PriceboundError::FoldTraining { fold, .. }) => assert_eq!(fold, expected),
            other => panic!("unexpected {:?}", other.map(|o| o.y)),
        }
    }
}
