//! Errors
//!
//! Custom error types used throughout the `pricebound` crate.
use thiserror::Error;

/// Errors that can occur while training, calibrating or applying a price model.
#[derive(Debug, Error)]
pub enum PriceboundError {
    /// No feature has any variance once missing values are excluded.
    #[error("None of the {0} features has any variance, when missing values are excluded.")]
    NoVariance(usize),
    /// A dataset with no usable rows was passed in.
    #[error("No rows available for {0}.")]
    EmptyData(String),
    /// Lengths of two inputs that must line up disagree.
    #[error("Shape mismatch for {0}: expected {1}, found {2}.")]
    ShapeMismatch(String, usize, usize),
    /// The training target contains NaN or infinite values.
    #[error("Target value at row {0} is not finite ({1}).")]
    NonFiniteTarget(usize, f64),
    /// Training one of the cross-validation folds failed, the whole run is aborted.
    #[error("Training failed on fold {fold}: {source}")]
    FoldTraining {
        fold: usize,
        #[source]
        source: Box<PriceboundError>,
    },
    /// Training or evaluation was asked of a dataset without a target.
    #[error("Dataset has no target column {0}.")]
    MissingTarget(String),
    /// A record handed to inference does not carry a required feature.
    #[error("Row {0} is missing required feature {1}.")]
    MissingFeature(usize, String),
    /// A record carries a value of the wrong kind for a feature.
    #[error("Row {0} has a non numeric value {2:?} for numeric feature {1}.")]
    InvalidFeatureValue(usize, String, String),
    /// A column named in the column contract is not present in the file.
    #[error("Column {0} was not found, available columns are {1}.")]
    UnknownColumn(String, String),
    /// A confidence level outside of (0, 1).
    #[error("Confidence level {0} is outside of the open interval (0, 1).")]
    InvalidConfidence(f64),
    /// A tabular file could not be parsed.
    #[error("Unable to parse CSV: {0}")]
    Csv(String),
    /// Unable to write a model, record or table to file.
    #[error("Unable to write to file: {0}")]
    UnableToWrite(String),
    /// Unable to read a model, record or table from file.
    #[error("Unable to read from file: {0}")]
    UnableToRead(String),
    /// Invalid value parsing.
    #[error("Invalid value {0} passed for {1}, expected one of {2}.")]
    ParseString(String, String, String),
    /// First value is the name of the parameter, second is expected, third is what was passed.
    #[error("Invalid parameter value passed for {0}, expected {1} but {2} provided.")]
    InvalidParameter(String, String, String),
}

impl From<csv::Error> for PriceboundError {
    fn from(e: csv::Error) -> Self {
        PriceboundError::Csv(e.to_string())
    }
}
