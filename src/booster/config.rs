//! Booster Configuration
//!
//! Defines the configuration of the gradient booster used as the base
//! distributional predictor and as the Stage-2 residual regressor.
use crate::constants::MAX_BIN_LIMIT;
use crate::errors::PriceboundError;
use crate::persistence::JsonIO;
use crate::utils::{validate_count_parameter, validate_float_parameter, validate_positive_float_parameter};
use serde::{Deserialize, Serialize};

fn default_iterations() -> usize {
    1000
}
fn default_learning_rate() -> f64 {
    0.05
}
fn default_max_depth() -> usize {
    6
}
fn default_min_leaf_size() -> usize {
    5
}
fn default_lambda() -> f64 {
    1.0
}
fn default_max_bin() -> u16 {
    64
}
fn default_subsample() -> f64 {
    1.0
}
fn default_early_stopping_rounds() -> Option<usize> {
    Some(100)
}
fn default_uncertainty() -> bool {
    true
}
fn default_parallel() -> bool {
    true
}

/// Configuration for the `GradientBooster`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BoosterConfig {
    /// Maximum number of boosting rounds.
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    /// Shrinkage applied to every leaf weight.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Maximum depth of each tree.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Minimum number of rows in a leaf.
    #[serde(default = "default_min_leaf_size")]
    pub min_leaf_size: usize,
    /// L2 regularization on leaf weights.
    #[serde(default = "default_lambda")]
    pub lambda: f64,
    /// Minimum gain required to split a node.
    #[serde(default)]
    pub min_split_gain: f64,
    /// Maximum number of bins for discretization.
    #[serde(default = "default_max_bin")]
    pub max_bin: u16,
    /// Fraction of rows sampled for each tree.
    #[serde(default = "default_subsample")]
    pub subsample: f64,
    /// Seed for random number generation.
    #[serde(default)]
    pub seed: u64,
    /// Rounds without improvement on the evaluation set before stopping.
    #[serde(default = "default_early_stopping_rounds")]
    pub early_stopping_rounds: Option<usize>,
    /// Logging frequency (every N iterations), 0 disables it.
    #[serde(default)]
    pub log_iterations: usize,
    /// Whether to fit the log-variance head next to the mean head.
    #[serde(default = "default_uncertainty")]
    pub uncertainty: bool,
    /// Whether to predict rows in parallel.
    #[serde(default = "default_parallel")]
    pub parallel: bool,
}

impl Default for BoosterConfig {
    fn default() -> Self {
        BoosterConfig {
            iterations: default_iterations(),
            learning_rate: default_learning_rate(),
            max_depth: default_max_depth(),
            min_leaf_size: default_min_leaf_size(),
            lambda: default_lambda(),
            min_split_gain: 0.0,
            max_bin: default_max_bin(),
            subsample: default_subsample(),
            seed: 0,
            early_stopping_rounds: default_early_stopping_rounds(),
            log_iterations: 0,
            uncertainty: default_uncertainty(),
            parallel: default_parallel(),
        }
    }
}

impl BoosterConfig {
    pub fn validate(&self) -> Result<(), PriceboundError> {
        validate_count_parameter(self.iterations, 1, "iterations")?;
        validate_float_parameter(self.learning_rate, f64::MIN_POSITIVE, 1.0, "learning_rate")?;
        validate_count_parameter(self.max_depth, 1, "max_depth")?;
        validate_count_parameter(self.min_leaf_size, 1, "min_leaf_size")?;
        validate_float_parameter(self.lambda, 0.0, f64::MAX, "lambda")?;
        validate_float_parameter(self.min_split_gain, 0.0, f64::MAX, "min_split_gain")?;
        validate_count_parameter(self.max_bin as usize, 2, "max_bin")?;
        if self.max_bin > MAX_BIN_LIMIT {
            return Err(PriceboundError::InvalidParameter(
                "max_bin".to_string(),
                format!("at most {}", MAX_BIN_LIMIT),
                self.max_bin.to_string(),
            ));
        }
        validate_positive_float_parameter(self.subsample, "subsample")?;
        validate_float_parameter(self.subsample, 0.0, 1.0, "subsample")?;
        if let Some(r) = self.early_stopping_rounds {
            validate_count_parameter(r, 1, "early_stopping_rounds")?;
        }
        Ok(())
    }
}

impl JsonIO for BoosterConfig {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_booster_config_default() {
        let config = BoosterConfig::default();
        assert_eq!(config.iterations, 1000);
        assert_eq!(config.max_bin, 64);
        assert!(config.uncertainty);
        assert_eq!(config.early_stopping_rounds, Some(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_booster_config_partial_json() {
        let json = r#"{"iterations": 50, "uncertainty": false}"#;
        let config = BoosterConfig::from_json(json).unwrap();
        assert_eq!(config.iterations, 50);
        assert!(!config.uncertainty);
        assert_eq!(config.learning_rate, 0.05);
    }

    #[test]
    fn test_booster_config_file() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("booster.json");
        let config = BoosterConfig::default();
        config.save_json(&file_path).unwrap();
        let config2 = BoosterConfig::load_json(&file_path).unwrap();
        assert_eq!(config, config2);
    }

    #[test]
    fn test_invalid_config() {
        let config = BoosterConfig {
            subsample: 1.5,
            ..Default::default()
        };
        match config.validate() {
            Err(PriceboundError::InvalidParameter(name, _, _)) => assert_eq!(name, "subsample"),
            other => panic!("unexpected {:?}", other),
        }
        let config = BoosterConfig {
            max_bin: u16::MAX,
            ..Default::default()
        };
        match config.validate() {
            Err(PriceboundError::InvalidParameter(name, _, _)) => assert_eq!(name, "max_bin"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(BoosterConfig::default().set_max_bin(MAX_BIN_LIMIT).validate().is_ok());
    }
}
