//! Booster
//!
//! Gradient boosted regression trees with an optional log-variance head, used as
//! the Stage-1 distributional predictor and the Stage-2 residual regressor.
pub mod config;
pub mod core;
pub mod predict;
pub mod setters;

pub use self::config::BoosterConfig;
pub use self::core::GradientBooster;
