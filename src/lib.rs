mod constants;

// Modules
pub mod binning;
pub mod booster;
pub mod calibration;
pub mod corrector;
pub mod coverage;
pub mod cv;
pub mod data;
pub mod dataset;
pub mod errors;
pub mod gate;
pub mod metrics;
pub mod objective;
pub mod persistence;
pub mod pipeline;
pub mod predictor;
pub mod transform;
pub mod tree;
pub mod utils;

// Individual classes, and functions
pub use booster::{BoosterConfig, GradientBooster};
pub use calibration::{calibrate_sigma, CalibrationConfig, CalibrationReport, SearchMethod};
pub use corrector::{fit_corrector, ResidualCorrector, Stage2Config, Stage2Outcome};
pub use coverage::{coverage, z_score};
pub use cv::{cross_validate, make_folds, CvConfig, FoldStrategy, OutOfFold};
pub use data::Matrix;
pub use dataset::{ColumnSpec, Dataset, FeatureEncoder, FeatureRecord, FeatureValue};
pub use errors::PriceboundError;
pub use gate::Gate;
pub use persistence::JsonIO;
pub use pipeline::{
    fit_pipeline, write_predictions_csv, CalibrationRecord, EvaluationReport, PipelineConfig, PredictionRow,
    TrainedPipeline,
};
pub use predictor::{DistributionalPrediction, DistributionalPredictor, Learner, PointPredictor};
pub use transform::TargetTransform;
