//! Pipeline
//!
//! One parameterised two-stage pipeline: out-of-fold base predictions, sigma
//! calibration, the gated Stage-2 corrector, the final base fit and the back
//! transform into price intervals.
use crate::booster::{BoosterConfig, GradientBooster};
use crate::calibration::{calibrate_sigma, CalibrationConfig, CalibrationReport};
use crate::constants::{CALIBRATION_RECORD_VERSION, DEFAULT_SIGMA_THRESHOLDS, DEFAULT_TARGET_COVERAGE, PIPELINE_CONFIG_VERSION};
use crate::corrector::{fit_corrector, ResidualCorrector, SmoothnessTrial, Stage2Config, Stage2Outcome};
use crate::coverage::{coverage, z_score};
use crate::cv::{cross_validate, make_folds, CvConfig, CvSummary, FoldMetrics};
use crate::data::Matrix;
use crate::dataset::{as_matrix, rows_to_columns, ColumnSpec, Dataset, FeatureEncoder, FeatureRecord};
use crate::errors::PriceboundError;
use crate::gate::adjust_sigma;
use crate::metrics::{mean_absolute_error, median_absolute_percentage_error, r2_score, root_mean_squared_error};
use crate::persistence::{write_atomic, JsonIO};
use crate::predictor::{predict_distribution, DistributionalPrediction, DistributionalPredictor, Learner};
use crate::transform::TargetTransform;
use crate::utils::{nan_mean, nan_median, validate_positive_float_parameter};
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

const CONFIG_FILE: &str = "config.json";
const ENCODER_FILE: &str = "encoder.json";
const STAGE1_FILE: &str = "stage1.json";
const STAGE2_FILE: &str = "stage2.json";
const RECORD_FILE: &str = "calibration.json";
const DIAGNOSTICS_FILE: &str = "diagnostics.json";

fn default_version() -> u32 {
    PIPELINE_CONFIG_VERSION
}
fn default_confidence() -> f64 {
    DEFAULT_TARGET_COVERAGE
}
fn default_sigma_thresholds() -> Vec<f64> {
    DEFAULT_SIGMA_THRESHOLDS.to_vec()
}
fn default_parallel() -> bool {
    true
}

/// Every setting of a pipeline run, carried explicitly through each stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub columns: ColumnSpec,
    #[serde(default)]
    pub transform: TargetTransform,
    /// Confidence of the interval written to the output table.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Base distributional model.
    #[serde(default)]
    pub booster: BoosterConfig,
    #[serde(default)]
    pub cv: CvConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub stage2: Stage2Config,
    /// Sigma cut offs for the threshold analysis of the evaluation report.
    #[serde(default = "default_sigma_thresholds")]
    pub sigma_thresholds: Vec<f64>,
    /// Size of the worker pool, rayon's default when `None`.
    #[serde(default)]
    pub num_threads: Option<usize>,
    #[serde(default = "default_parallel")]
    pub parallel: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            version: default_version(),
            columns: ColumnSpec::default(),
            transform: TargetTransform::default(),
            confidence: default_confidence(),
            booster: BoosterConfig::default(),
            cv: CvConfig::default(),
            calibration: CalibrationConfig::default(),
            stage2: Stage2Config::default(),
            sigma_thresholds: default_sigma_thresholds(),
            num_threads: None,
            parallel: default_parallel(),
        }
    }
}

impl PipelineConfig {
    pub fn set_columns(mut self, columns: ColumnSpec) -> Self {
        self.columns = columns;
        self
    }

    pub fn set_transform(mut self, transform: TargetTransform) -> Self {
        self.transform = transform;
        self
    }

    pub fn set_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn set_booster(mut self, booster: BoosterConfig) -> Self {
        self.booster = booster;
        self
    }

    pub fn set_cv(mut self, cv: CvConfig) -> Self {
        self.cv = cv;
        self
    }

    pub fn set_calibration(mut self, calibration: CalibrationConfig) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn set_stage2(mut self, stage2: Stage2Config) -> Self {
        self.stage2 = stage2;
        self
    }

    pub fn set_sigma_thresholds(mut self, sigma_thresholds: Vec<f64>) -> Self {
        self.sigma_thresholds = sigma_thresholds;
        self
    }

    pub fn set_num_threads(mut self, num_threads: Option<usize>) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn set_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn validate(&self) -> Result<(), PriceboundError> {
        if self.version != PIPELINE_CONFIG_VERSION {
            return Err(PriceboundError::InvalidParameter(
                "version".to_string(),
                PIPELINE_CONFIG_VERSION.to_string(),
                self.version.to_string(),
            ));
        }
        z_score(self.confidence)?;
        for t in &self.sigma_thresholds {
            validate_positive_float_parameter(*t, "sigma_thresholds")?;
        }
        if self.num_threads == Some(0) {
            return Err(PriceboundError::InvalidParameter(
                "num_threads".to_string(),
                "at least 1".to_string(),
                "0".to_string(),
            ));
        }
        self.booster.validate()?;
        self.cv.validate()?;
        self.calibration.validate()?;
        self.stage2.validate()
    }
}

impl JsonIO for PipelineConfig {}

/// The small record of everything needed to turn model outputs into intervals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub version: u32,
    pub calibration_factor: f64,
    pub target_coverage: f64,
    pub confidence: f64,
    pub transform: TargetTransform,
    pub luxury_threshold: f64,
    /// Selected gate smoothness, `None` when Stage 2 was skipped.
    pub gate_smoothness: Option<f64>,
    pub inflation_beta: f64,
    pub search_bounds: (f64, f64),
    pub low_confidence: bool,
    pub stage1_training_length: Option<usize>,
    pub stage2_training_length: Option<usize>,
}

impl JsonIO for CalibrationRecord {}

/// Training time diagnostics, never used at prediction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingDiagnostics {
    pub cv: CvSummary,
    pub fold_metrics: Vec<FoldMetrics>,
    pub calibration: Option<CalibrationReport>,
    pub stage2_trials: Vec<SmoothnessTrial>,
    pub stage2_skipped: Option<String>,
}

impl JsonIO for TrainingDiagnostics {}

impl<M: Serialize + DeserializeOwned> JsonIO for ResidualCorrector<M> {}

/// Log-space outputs of both stages for a batch of rows.
#[derive(Debug, Clone, PartialEq)]
pub struct TwoStagePrediction {
    pub stage1: DistributionalPrediction,
    pub gate_weight: Vec<f64>,
    pub final_mean_log: Vec<f64>,
    pub sigma_calibrated: Vec<Option<f64>>,
    pub sigma_adjusted: Vec<Option<f64>>,
}

impl TwoStagePrediction {
    pub fn len(&self) -> usize {
        self.final_mean_log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.final_mean_log.is_empty()
    }
}

/// One row of the output table, prices in currency units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub y_true: Option<f64>,
    pub stage1_mean_log: f64,
    pub final_mean_log: f64,
    /// Expected price of the base model alone.
    pub stage1_price: f64,
    /// Expected price after the Stage-2 correction.
    pub final_price: f64,
    pub median_price: f64,
    pub sigma_raw: Option<f64>,
    pub sigma_calibrated: Option<f64>,
    pub sigma_adjusted: Option<f64>,
    pub gate_weight: f64,
    pub confidence: f64,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

/// Errors of the rows whose sigma is at most `threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigmaThresholdRow {
    pub threshold: f64,
    pub share_kept: f64,
    pub n_kept: usize,
    pub mae: f64,
    pub medape: f64,
}

/// MAE and MedAPE restricted to confident rows, for each sigma threshold.
/// Thresholds that keep no row are left out.
pub fn sigma_threshold_analysis(
    y_price: &[f64],
    yhat_price: &[f64],
    sigma: &[Option<f64>],
    thresholds: &[f64],
) -> Vec<SigmaThresholdRow> {
    let total = y_price.len();
    let mut out = Vec::new();
    for t in thresholds {
        let kept: Vec<usize> = (0..total)
            .filter(|i| matches!(sigma[*i], Some(s) if s <= *t))
            .collect();
        if kept.is_empty() {
            continue;
        }
        let y: Vec<f64> = kept.iter().map(|i| y_price[*i]).collect();
        let yhat: Vec<f64> = kept.iter().map(|i| yhat_price[*i]).collect();
        out.push(SigmaThresholdRow {
            threshold: *t,
            share_kept: kept.len() as f64 / total as f64,
            n_kept: kept.len(),
            mae: mean_absolute_error(&y, &yhat),
            medape: median_absolute_percentage_error(&y, &yhat),
        });
    }
    out
}

/// Held out evaluation of a trained pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub n_rows: usize,
    pub rmse_log: f64,
    pub mae_log: f64,
    pub r2_log: f64,
    pub mae_price: f64,
    pub rmse_price: f64,
    pub r2_price: f64,
    pub medape: f64,
    pub stage1_medape: f64,
    pub mean_sigma: Option<f64>,
    pub median_sigma: Option<f64>,
    pub confidence: f64,
    pub coverage_raw: Option<f64>,
    pub coverage_calibrated: Option<f64>,
    pub coverage_adjusted: Option<f64>,
    /// Calibration fitted on the test rows themselves, reported only.
    pub test_calibration: Option<CalibrationReport>,
    pub sigma_thresholds: Vec<SigmaThresholdRow>,
}

/// A fitted two-stage pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainedPipeline<M> {
    pub config: PipelineConfig,
    pub encoder: FeatureEncoder,
    pub stage1: M,
    pub stage2: Option<ResidualCorrector<M>>,
    pub record: CalibrationRecord,
    pub diagnostics: TrainingDiagnostics,
}

fn with_pool<T, F>(cfg: &PipelineConfig, f: F) -> Result<T, PriceboundError>
where
    T: Send,
    F: FnOnce() -> Result<T, PriceboundError> + Send,
{
    match cfg.num_threads {
        Some(n) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .map_err(|e| PriceboundError::InvalidParameter("num_threads".to_string(), n.to_string(), e.to_string()))?;
            pool.install(f)
        }
        None => f(),
    }
}

impl TrainedPipeline<GradientBooster> {
    /// Fit with the boosters named in the configuration.
    pub fn fit(train: &Dataset, cfg: &PipelineConfig) -> Result<Self, PriceboundError> {
        fit_pipeline(&cfg.booster, &cfg.stage2.booster, train, cfg)
    }
}

/// Fit the full pipeline with any base and residual learners.
///
/// * `stage1` - Learner of the base distributional model.
/// * `stage2` - Learner of the residual corrector.
/// * `train` - Labelled training rows.
/// * `cfg` - Pipeline settings.
pub fn fit_pipeline<L: Learner>(
    stage1: &L,
    stage2: &L,
    train: &Dataset,
    cfg: &PipelineConfig,
) -> Result<TrainedPipeline<L::Model>, PriceboundError> {
    cfg.validate()?;
    if train.n_rows() == 0 {
        return Err(PriceboundError::EmptyData("training".to_string()));
    }
    if train.spec != cfg.columns {
        warn!("Dataset columns differ from the configured column spec, using the dataset's.");
    }
    with_pool(cfg, || fit_stages(stage1, stage2, train, cfg))
}

fn fit_stages<L: Learner>(
    stage1: &L,
    stage2: &L,
    train: &Dataset,
    cfg: &PipelineConfig,
) -> Result<TrainedPipeline<L::Model>, PriceboundError> {
    let encoder = FeatureEncoder::fit(train);
    let x = encoder.transform(train);
    let data = as_matrix(&x, encoder.n_features());
    let y = train.labels()?;

    let folds = make_folds(&cfg.cv, y, Some(train.groups.as_slice()))?;
    info!(
        "Starting {}-fold CV on {} training rows.",
        cfg.cv.n_folds,
        train.n_rows()
    );
    let oof = cross_validate(stage1, &data, y, &folds, cfg.transform, cfg.parallel && cfg.cv.parallel)?;

    let calibration = if oof.prediction.has_sigma() {
        let report = calibrate_sigma(y, &oof.prediction.mean_log, &oof.prediction.sigma_log, &cfg.calibration)?;
        report.log_summary();
        Some(report)
    } else {
        warn!("The base model reports no sigma, intervals will be missing.");
        None
    };
    let factor = calibration.as_ref().map_or(1.0, |r| r.factor);

    let outcome = fit_corrector(
        stage2,
        &data,
        y,
        &oof.prediction,
        &train.groups,
        cfg.transform,
        &cfg.stage2,
        cfg.parallel,
    )?;
    let (corrector, stage2_skipped) = match outcome {
        Stage2Outcome::Trained(c) => (Some(c), None),
        Stage2Outcome::Skipped { reason } => (None, Some(reason)),
    };

    let stage1_training_length = oof.median_best_iteration();
    let model = match stage1_training_length {
        Some(rounds) => stage1.with_training_length(rounds).fit(&data, y, None)?,
        None => stage1.fit(&data, y, None)?,
    };
    info!("Final base model trained on {} rows, training length {:?}.", train.n_rows(), stage1_training_length);

    let record = CalibrationRecord {
        version: CALIBRATION_RECORD_VERSION,
        calibration_factor: factor,
        target_coverage: cfg.calibration.target_coverage,
        confidence: cfg.confidence,
        transform: cfg.transform,
        luxury_threshold: cfg.stage2.luxury_threshold,
        gate_smoothness: corrector.as_ref().map(|c| c.gate.smoothness),
        inflation_beta: cfg.stage2.inflation_beta,
        search_bounds: cfg.calibration.search_bounds,
        low_confidence: calibration.as_ref().map_or(true, |r| r.low_confidence),
        stage1_training_length,
        stage2_training_length: corrector.as_ref().and_then(|c| c.training_length),
    };
    let diagnostics = TrainingDiagnostics {
        cv: oof.summary(),
        fold_metrics: oof.fold_metrics,
        calibration,
        stage2_trials: corrector.as_ref().map(|c| c.trials.clone()).unwrap_or_default(),
        stage2_skipped,
    };
    Ok(TrainedPipeline {
        config: cfg.clone(),
        encoder,
        stage1: model,
        stage2: corrector,
        record,
        diagnostics,
    })
}

impl<M> TrainedPipeline<M>
where
    M: DistributionalPredictor,
{
    /// Whether the Stage-2 corrector is active, `false` in reduced mode.
    pub fn has_stage2(&self) -> bool {
        self.stage2.is_some()
    }

    /// Both stages in log space for an encoded feature matrix.
    pub fn predict_log(&self, data: &Matrix<f64>) -> TwoStagePrediction {
        let stage1 = predict_distribution(&self.stage1, data);
        let (gate_weight, final_mean_log) = match &self.stage2 {
            Some(c) => c.correct(data, &stage1),
            None => (vec![0.0; stage1.len()], stage1.mean_log.clone()),
        };
        let factor = self.record.calibration_factor;
        let beta = self.record.inflation_beta;
        let sigma_calibrated = stage1.sigma_log.iter().map(|s| s.map(|v| v * factor)).collect();
        let sigma_adjusted = stage1
            .sigma_log
            .iter()
            .zip(&gate_weight)
            .map(|(s, w)| adjust_sigma(*s, factor, beta, *w))
            .collect();
        TwoStagePrediction {
            stage1,
            gate_weight,
            final_mean_log,
            sigma_calibrated,
            sigma_adjusted,
        }
    }

    /// Price intervals at any confidence from the adjusted sigma.
    pub fn intervals(&self, pred: &TwoStagePrediction, confidence: f64) -> Result<Vec<Option<(f64, f64)>>, PriceboundError> {
        let z = z_score(confidence)?;
        Ok(pred
            .final_mean_log
            .iter()
            .zip(&pred.sigma_adjusted)
            .map(|(m, s)| self.record.transform.interval(*m, *s, z))
            .collect())
    }

    fn rows(&self, pred: &TwoStagePrediction, y: Option<&[f64]>) -> Result<Vec<PredictionRow>, PriceboundError> {
        let t = self.record.transform;
        let confidence = self.record.confidence;
        let bounds = self.intervals(pred, confidence)?;
        Ok((0..pred.len())
            .map(|i| PredictionRow {
                y_true: y.map(|v| v[i]).filter(|v| v.is_finite()).map(|v| t.inverse(v)),
                stage1_mean_log: pred.stage1.mean_log[i],
                final_mean_log: pred.final_mean_log[i],
                stage1_price: t.expected_value(pred.stage1.mean_log[i], pred.sigma_calibrated[i]),
                final_price: t.expected_value(pred.final_mean_log[i], pred.sigma_adjusted[i]),
                median_price: t.median(pred.final_mean_log[i]),
                sigma_raw: pred.stage1.sigma_log[i],
                sigma_calibrated: pred.sigma_calibrated[i],
                sigma_adjusted: pred.sigma_adjusted[i],
                gate_weight: pred.gate_weight[i],
                confidence,
                lower: bounds[i].map(|b| b.0),
                upper: bounds[i].map(|b| b.1),
            })
            .collect())
    }

    /// Output table for a labelled or unlabelled dataset. `y_true` is set
    /// only where the target is known.
    pub fn predict(&self, data: &Dataset) -> Result<Vec<PredictionRow>, PriceboundError> {
        let x = self.encoder.transform(data);
        let pred = self.predict_log(&as_matrix(&x, self.encoder.n_features()));
        self.rows(&pred, data.target.as_deref())
    }

    /// Predict independent records. A record missing a required feature fails
    /// on its own, the rest of the batch is still predicted.
    pub fn predict_records(
        &self,
        records: &[FeatureRecord],
    ) -> Result<Vec<Result<PredictionRow, PriceboundError>>, PriceboundError> {
        let encoded: Vec<Result<Vec<f64>, PriceboundError>> = records
            .iter()
            .enumerate()
            .map(|(i, r)| self.encoder.encode_record(i, r))
            .collect();
        let ok_rows: Vec<Vec<f64>> = encoded.iter().filter_map(|r| r.as_ref().ok().cloned()).collect();
        let mut predicted = if ok_rows.is_empty() {
            Vec::new().into_iter()
        } else {
            let x = rows_to_columns(&ok_rows, self.encoder.n_features());
            let pred = self.predict_log(&Matrix::new(&x, ok_rows.len(), self.encoder.n_features()));
            self.rows(&pred, None)?.into_iter()
        };
        Ok(encoded
            .into_iter()
            .map(|r| {
                r.and_then(|_| {
                    predicted
                        .next()
                        .ok_or_else(|| PriceboundError::EmptyData("record prediction".to_string()))
                })
            })
            .collect())
    }

    /// Score a labelled held out dataset.
    pub fn evaluate(&self, test: &Dataset) -> Result<EvaluationReport, PriceboundError> {
        if test.n_rows() == 0 {
            return Err(PriceboundError::EmptyData("evaluation".to_string()));
        }
        let t = self.record.transform;
        let y = test.labels()?;
        let x = self.encoder.transform(test);
        let pred = self.predict_log(&as_matrix(&x, self.encoder.n_features()));
        let rows = self.rows(&pred, Some(y))?;
        let y_price = t.inverse_all(y);
        let yhat_price: Vec<f64> = rows.iter().map(|r| r.final_price).collect();
        let stage1_price: Vec<f64> = rows.iter().map(|r| r.stage1_price).collect();
        let z = z_score(self.record.confidence)?;
        let sigma_raw = pred.stage1.sigma_or_nan();

        let cfg = self.config.calibration.clone().set_target_coverage(self.record.confidence);
        let test_calibration = diagnostic_calibration(y, &pred.stage1, &cfg);

        let report = EvaluationReport {
            n_rows: test.n_rows(),
            rmse_log: root_mean_squared_error(y, &pred.final_mean_log),
            mae_log: mean_absolute_error(y, &pred.final_mean_log),
            r2_log: r2_score(y, &pred.final_mean_log),
            mae_price: mean_absolute_error(&y_price, &yhat_price),
            rmse_price: root_mean_squared_error(&y_price, &yhat_price),
            r2_price: r2_score(&y_price, &yhat_price),
            medape: median_absolute_percentage_error(&y_price, &yhat_price),
            stage1_medape: median_absolute_percentage_error(&y_price, &stage1_price),
            mean_sigma: nan_mean(&sigma_raw),
            median_sigma: nan_median(&sigma_raw),
            confidence: self.record.confidence,
            coverage_raw: coverage(y, &pred.final_mean_log, &pred.stage1.sigma_log, z),
            coverage_calibrated: coverage(y, &pred.final_mean_log, &pred.sigma_calibrated, z),
            coverage_adjusted: coverage(y, &pred.final_mean_log, &pred.sigma_adjusted, z),
            test_calibration,
            sigma_thresholds: sigma_threshold_analysis(&y_price, &yhat_price, &pred.stage1.sigma_log, &self.config.sigma_thresholds),
        };
        info!(
            "Test: RMSE(log) {:.4}, R2(log) {:.4}, MAE {:.0}, MedAPE {:.2}% (base {:.2}%), coverage raw {:?} calibrated {:?} adjusted {:?}",
            report.rmse_log,
            report.r2_log,
            report.mae_price,
            report.medape,
            report.stage1_medape,
            report.coverage_raw,
            report.coverage_calibrated,
            report.coverage_adjusted
        );
        if let Some(tc) = &report.test_calibration {
            info!(
                "Diagnostic test set calibration factor {:.4} (applied factor {:.4}).",
                tc.factor, self.record.calibration_factor
            );
        }
        Ok(report)
    }
}

/// Calibration fitted on held out rows, reported next to the applied factor
/// and never used for intervals.
fn diagnostic_calibration(
    y: &[f64],
    pred: &DistributionalPrediction,
    cfg: &CalibrationConfig,
) -> Option<CalibrationReport> {
    if !pred.has_sigma() {
        return None;
    }
    match calibrate_sigma(y, &pred.mean_log, &pred.sigma_log, cfg) {
        Ok(report) => Some(report),
        Err(e) => {
            warn!("Diagnostic test set calibration failed: {}", e);
            None
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<(), PriceboundError> {
    if path.exists() {
        std::fs::remove_file(path).map_err(|e| PriceboundError::UnableToWrite(format!("{}: {}", path.display(), e)))?;
    }
    Ok(())
}

impl<M: JsonIO> TrainedPipeline<M> {
    /// Save every part into `dir`, one JSON file each.
    ///
    /// A previous record is removed before anything else is written and the
    /// new one is written last, so `load` never pairs a record with the
    /// model files of another run.
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<(), PriceboundError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| PriceboundError::UnableToWrite(format!("{}: {}", dir.display(), e)))?;
        remove_if_exists(&dir.join(RECORD_FILE))?;
        self.config.save_json(dir.join(CONFIG_FILE))?;
        self.encoder.save_json(dir.join(ENCODER_FILE))?;
        self.stage1.save_json(dir.join(STAGE1_FILE))?;
        match &self.stage2 {
            Some(c) => c.save_json(dir.join(STAGE2_FILE))?,
            None => remove_if_exists(&dir.join(STAGE2_FILE))?,
        }
        self.diagnostics.save_json(dir.join(DIAGNOSTICS_FILE))?;
        self.record.save_json(dir.join(RECORD_FILE))
    }

    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self, PriceboundError> {
        let dir = dir.as_ref();
        let record = CalibrationRecord::load_json(dir.join(RECORD_FILE))?;
        let stage2 = if record.gate_smoothness.is_some() {
            Some(ResidualCorrector::<M>::load_json(dir.join(STAGE2_FILE))?)
        } else {
            None
        };
        Ok(TrainedPipeline {
            config: PipelineConfig::load_json(dir.join(CONFIG_FILE))?,
            encoder: FeatureEncoder::load_json(dir.join(ENCODER_FILE))?,
            stage1: M::load_json(dir.join(STAGE1_FILE))?,
            stage2,
            record,
            diagnostics: TrainingDiagnostics::load_json(dir.join(DIAGNOSTICS_FILE))?,
        })
    }
}

/// Write the output table as CSV, replacing `path` atomically.
pub fn write_predictions_csv<P: AsRef<Path>>(path: P, rows: &[PredictionRow]) -> Result<(), PriceboundError> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    for row in rows {
        wtr.serialize(row)
            .map_err(|e| PriceboundError::UnableToWrite(e.to_string()))?;
    }
    let bytes = wtr
        .into_inner()
        .map_err(|e| PriceboundError::UnableToWrite(e.to_string()))?;
    write_atomic(path, &bytes)
}
