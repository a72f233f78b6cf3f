use crate::booster::config::BoosterConfig;
use crate::booster::core::GradientBooster;
use crate::constants::LOG_VARIANCE_CLIP;
use crate::data::Matrix;
use crate::errors::PriceboundError;
use crate::predictor::{DistributionalPredictor, Learner, PointPredictor};

impl GradientBooster {
    fn sum_trees(&self, base: f64, trees: &[crate::tree::Tree], data: &Matrix<f64>) -> Vec<f64> {
        let mut init = vec![base; data.rows];
        for tree in trees {
            for (p, t) in init.iter_mut().zip(tree.predict(data, self.cfg.parallel)) {
                *p += t;
            }
        }
        init
    }

    /// Predict the mean head.
    ///
    /// * `data` - Column major feature matrix with the training column layout.
    pub fn predict_mean(&self, data: &Matrix<f64>) -> Vec<f64> {
        self.sum_trees(self.base_score, &self.trees, data)
    }

    /// Predict the log-variance head, `None` when the booster was fit without it.
    pub fn predict_log_variance(&self, data: &Matrix<f64>) -> Option<Vec<f64>> {
        if !self.cfg.uncertainty || self.log_variance_base.is_nan() {
            return None;
        }
        Some(self.sum_trees(self.log_variance_base, &self.variance_trees, data))
    }

    /// Predict the variance, `exp` of the log-variance head.
    pub fn predict_variance(&self, data: &Matrix<f64>) -> Option<Vec<f64>> {
        self.predict_log_variance(data).map(|lv| {
            lv.into_iter()
                .map(|s| s.clamp(-LOG_VARIANCE_CLIP, LOG_VARIANCE_CLIP).exp())
                .collect()
        })
    }
}

impl PointPredictor for GradientBooster {
    fn predict_mean(&self, data: &Matrix<f64>) -> Vec<f64> {
        GradientBooster::predict_mean(self, data)
    }
}

impl DistributionalPredictor for GradientBooster {
    fn predict_variance(&self, data: &Matrix<f64>) -> Option<Vec<f64>> {
        GradientBooster::predict_variance(self, data)
    }

    fn training_length(&self) -> Option<usize> {
        self.best_iteration
    }
}

impl Learner for BoosterConfig {
    type Model = GradientBooster;

    fn fit(
        &self,
        data: &Matrix<f64>,
        y: &[f64],
        eval: Option<(&Matrix<f64>, &[f64])>,
    ) -> Result<GradientBooster, PriceboundError> {
        let mut booster = GradientBooster::new(self.clone());
        booster.fit(data, y, eval)?;
        Ok(booster)
    }

    fn with_training_length(&self, rounds: usize) -> Self {
        BoosterConfig {
            iterations: rounds.max(1),
            early_stopping_rounds: None,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::predict_distribution;

    fn line_data() -> (Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..200).map(|i| i as f64 / 10.0).collect();
        let y: Vec<f64> = x.iter().map(|v| 0.5 * v).collect();
        (x, y)
    }

    #[test]
    fn test_point_only_booster() {
        let (x, y) = line_data();
        let data = Matrix::new(&x, 200, 1);
        let cfg = BoosterConfig {
            iterations: 20,
            uncertainty: false,
            ..Default::default()
        };
        let model = Learner::fit(&cfg, &data, &y, None).unwrap();
        assert!(model.predict_variance(&data).is_none());
        let p = predict_distribution(&model, &data);
        assert_eq!(p.len(), 200);
        assert!(p.sigma_log.iter().all(|s| s.is_none()));
        assert!(p.mean_log.iter().all(|m| m.is_finite()));
    }

    #[test]
    fn test_distributional_booster() {
        let (x, y) = line_data();
        let data = Matrix::new(&x, 200, 1);
        let cfg = BoosterConfig {
            iterations: 20,
            ..Default::default()
        };
        let model = Learner::fit(&cfg, &data, &y, None).unwrap();
        let p = predict_distribution(&model, &data);
        assert!(p.sigma_log.iter().all(|s| matches!(s, Some(v) if *v >= 0.0)));
        assert_eq!(model.training_length(), None);
    }

    #[test]
    fn test_with_training_length() {
        let cfg = BoosterConfig::default().with_training_length(37);
        assert_eq!(cfg.iterations, 37);
        assert_eq!(cfg.early_stopping_rounds, None);
        assert_eq!(BoosterConfig::default().with_training_length(0).iterations, 1);
    }
}
