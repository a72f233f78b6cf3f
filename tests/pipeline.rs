use pricebound::booster::BoosterConfig;
use pricebound::corrector::Stage2Config;
use pricebound::cv::CvConfig;
use pricebound::dataset::{ColumnSpec, Dataset, FeatureRecord, FeatureValue};
use pricebound::errors::PriceboundError;
use pricebound::pipeline::{write_predictions_csv, PipelineConfig, TrainedPipeline};
use pricebound::GradientBooster;
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::Normal;
use tempfile::tempdir;

const BRANDS: [(&str, f64, [&str; 3]); 6] = [
    ("Toyota", 11.3, ["Corolla", "Camry", "Land Cruiser"]),
    ("Nissan", 11.1, ["Sunny", "Altima", "Patrol"]),
    ("BMW", 12.2, ["X3", "X5", "M5"]),
    ("Ferrari", 13.6, ["Roma", "296", "SF90"]),
    ("Lamborghini", 13.9, ["Huracan", "Urus", "Revuelto"]),
    ("Rolls Royce", 14.0, ["Ghost", "Cullinan", "Spectre"]),
];

fn spec() -> ColumnSpec {
    ColumnSpec::new(&["brand", "model", "fuel_type"], &["kms", "vehicle_age"], "log_price", &["brand", "model"])
}

fn synthetic_listings(n: usize, seed: u64) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut brand = Vec::with_capacity(n);
    let mut model = Vec::with_capacity(n);
    let mut fuel = Vec::with_capacity(n);
    let mut kms = Vec::with_capacity(n);
    let mut age = Vec::with_capacity(n);
    let mut target = Vec::with_capacity(n);
    for _ in 0..n {
        let b = rng.gen_range(0..BRANDS.len());
        let m = rng.gen_range(0..3);
        let (name, base, models) = BRANDS[b];
        let a = rng.gen_range(0..12) as f64;
        let k = a * 15_000.0 * (0.5 + rng.gen::<f64>());
        let noise = Normal::new(0.0, if b >= 3 { 0.12 } else { 0.06 }).unwrap();
        brand.push(name.to_string());
        model.push(models[m].to_string());
        fuel.push(if rng.gen_bool(0.2) { "Hybrid" } else { "Petrol" }.to_string());
        // Older luxury cars hold their value, cheap ones do not.
        let depreciation = if b >= 3 { 0.03 } else { 0.07 };
        target.push(base + 0.15 * m as f64 - depreciation * a - 1e-7 * k + noise.sample(&mut rng));
        kms.push(k);
        age.push(a);
    }
    Dataset::from_columns(spec(), vec![brand, model, fuel], vec![kms, age], target).unwrap()
}

fn small_config() -> PipelineConfig {
    let booster = BoosterConfig::default()
        .set_iterations(60)
        .set_learning_rate(0.1)
        .set_max_depth(4)
        .set_early_stopping_rounds(Some(10));
    PipelineConfig::default()
        .set_columns(spec())
        .set_booster(booster.clone())
        .set_cv(CvConfig::default().set_n_folds(3))
        .set_stage2(
            Stage2Config::default()
                .set_n_folds(3)
                .set_min_rows(30)
                .set_booster(booster.set_uncertainty(false)),
        )
}

#[test]
fn test_two_stage_pipeline_end_to_end() {
    let train = synthetic_listings(600, 0);
    let test = synthetic_listings(200, 1);
    let cfg = small_config();
    let pipeline = TrainedPipeline::<GradientBooster>::fit(&train, &cfg).unwrap();

    assert_eq!(pipeline.diagnostics.fold_metrics.len(), 3);
    let factor = pipeline.record.calibration_factor;
    assert!((0.5..=3.0).contains(&factor));
    assert!(pipeline.has_stage2());
    let tau = pipeline.record.gate_smoothness.unwrap();
    assert!(cfg.stage2.gate_smoothness.contains(&tau));

    let calibration = pipeline.diagnostics.calibration.as_ref().unwrap();
    let raw_error = (calibration.raw_coverage.unwrap() - calibration.target_coverage).abs();
    assert!(calibration.error <= raw_error);

    let rows = pipeline.predict(&test).unwrap();
    assert_eq!(rows.len(), test.n_rows());
    for row in &rows {
        let (lower, upper) = (row.lower.unwrap(), row.upper.unwrap());
        assert!(lower >= 0.0);
        assert!(lower <= row.median_price && row.median_price <= upper);
        assert!(row.final_price >= row.median_price);
        assert!((0.0..=1.0).contains(&row.gate_weight));
        assert!(row.sigma_adjusted.unwrap() >= row.sigma_calibrated.unwrap());
        assert!(row.y_true.is_some());
    }

    let report = pipeline.evaluate(&test).unwrap();
    assert_eq!(report.n_rows, 200);
    assert!(report.r2_log > 0.5, "r2 {}", report.r2_log);
    assert!(report.coverage_calibrated.is_some());
    assert!(report.test_calibration.is_some());
    for t in &report.sigma_thresholds {
        assert!(t.n_kept > 0 && t.share_kept <= 1.0);
    }

    let dir = tempdir().unwrap();
    let path = dir.path().join("predictions.csv");
    write_predictions_csv(&path, &rows).unwrap();
    let written = std::fs::read_to_string(&path).unwrap();
    assert_eq!(written.lines().count(), rows.len() + 1);
}

#[test]
fn test_stage2_skipped_falls_back_to_base_model() {
    let train = synthetic_listings(300, 2);
    let cfg = small_config();
    let cfg = cfg.clone().set_stage2(cfg.stage2.clone().set_luxury_threshold(1e12));
    let pipeline = TrainedPipeline::<GradientBooster>::fit(&train, &cfg).unwrap();
    assert!(!pipeline.has_stage2());
    assert!(pipeline.diagnostics.stage2_skipped.is_some());
    assert_eq!(pipeline.record.gate_smoothness, None);

    let rows = pipeline.predict(&train).unwrap();
    for row in rows {
        assert_eq!(row.gate_weight, 0.0);
        assert_eq!(row.final_mean_log, row.stage1_mean_log);
        assert_eq!(row.sigma_adjusted, row.sigma_calibrated);
    }
}

#[test]
fn test_point_only_model_reports_missing_sigma() {
    let train = synthetic_listings(300, 3);
    let cfg = small_config();
    let cfg = cfg.clone().set_booster(cfg.booster.clone().set_uncertainty(false));
    let pipeline = TrainedPipeline::<GradientBooster>::fit(&train, &cfg).unwrap();
    assert!(pipeline.diagnostics.calibration.is_none());
    assert_eq!(pipeline.record.calibration_factor, 1.0);
    assert!(pipeline.record.low_confidence);

    let rows = pipeline.predict(&train).unwrap();
    assert!(rows.iter().all(|r| r.sigma_raw.is_none() && r.lower.is_none() && r.upper.is_none()));
    assert!(rows.iter().all(|r| r.final_price.is_finite()));
    assert!(pipeline.diagnostics.fold_metrics.iter().all(|m| m.coverage_2sigma.is_none()));
}

#[test]
fn test_record_batch_with_a_bad_row() {
    let train = synthetic_listings(300, 4);
    let pipeline = TrainedPipeline::<GradientBooster>::fit(&train, &small_config()).unwrap();

    let mut good = FeatureRecord::new();
    good.insert("brand".to_string(), "Ferrari".into());
    good.insert("model".to_string(), "Roma".into());
    good.insert("fuel_type".to_string(), FeatureValue::Missing);
    good.insert("kms".to_string(), 20_000.0.into());
    good.insert("vehicle_age".to_string(), "2".into());
    let mut bad = good.clone();
    bad.remove("vehicle_age");
    let mut unseen = good.clone();
    unseen.insert("brand".to_string(), "Bugatti".into());

    let results = pipeline.predict_records(&[good, bad, unseen]).unwrap();
    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    match &results[1] {
        Err(PriceboundError::MissingFeature(row, col)) => {
            assert_eq!(*row, 1);
            assert_eq!(col, "vehicle_age");
        }
        other => panic!("unexpected {:?}", other),
    }
    let row = results[2].as_ref().unwrap();
    assert!(row.final_price.is_finite());
    assert!(row.y_true.is_none());
}

#[test]
fn test_predict_table_without_target() {
    let train = synthetic_listings(300, 6);
    let pipeline = TrainedPipeline::<GradientBooster>::fit(&train, &small_config()).unwrap();

    let csv = "brand,model,fuel_type,kms,vehicle_age\n\
        Toyota,Camry,Petrol,45000,3\n\
        Rolls Royce,Ghost,,inf,1\n\
        Bugatti,Chiron,Petrol,,2\n";
    let listings = Dataset::from_reader_inference(csv.as_bytes(), &spec()).unwrap();
    assert_eq!(listings.n_rows(), 3);
    assert!(!listings.is_labelled());

    let rows = pipeline.predict(&listings).unwrap();
    assert_eq!(rows.len(), 3);
    for row in &rows {
        assert!(row.y_true.is_none());
        assert!(row.final_price.is_finite() && row.final_price > 0.0);
    }
    assert!(rows[1].median_price > rows[0].median_price);
    assert!(matches!(
        pipeline.evaluate(&listings),
        Err(PriceboundError::MissingTarget(_))
    ));
    assert!(matches!(
        TrainedPipeline::<GradientBooster>::fit(&listings, &small_config()),
        Err(PriceboundError::MissingTarget(_))
    ));
}

#[test]
fn test_save_and_load_give_identical_predictions() {
    let train = synthetic_listings(300, 5);
    let pipeline = TrainedPipeline::<GradientBooster>::fit(&train, &small_config()).unwrap();
    let dir = tempdir().unwrap();
    pipeline.save(dir.path()).unwrap();
    let loaded = TrainedPipeline::<GradientBooster>::load(dir.path()).unwrap();
    assert_eq!(loaded.record, pipeline.record);
    assert_eq!(loaded.config, pipeline.config);
    assert_eq!(loaded.encoder, pipeline.encoder);
    assert_eq!(loaded.has_stage2(), pipeline.has_stage2());
    assert_eq!(loaded.predict(&train).unwrap(), pipeline.predict(&train).unwrap());
}

#[test]
fn test_degenerate_fold_aborts_the_run() {
    let n = 60;
    let constant = || vec!["Same".to_string(); n];
    let spec = spec();
    let target: Vec<f64> = (0..n).map(|i| 11.0 + (i % 7) as f64 * 0.1).collect();
    let data = Dataset::from_columns(
        spec.clone(),
        vec![constant(), constant(), constant()],
        vec![vec![1.0; n], vec![3.0; n]],
        target,
    )
    .unwrap();
    let cfg = small_config().set_cv(CvConfig::default().set_n_folds(3).set_strategy(pricebound::FoldStrategy::Random));
    match TrainedPipeline::<GradientBooster>::fit(&data, &cfg) {
        Err(PriceboundError::FoldTraining { fold, source }) => {
            assert_eq!(fold, 0);
            assert!(matches!(*source, PriceboundError::NoVariance(_)));
        }
        other => panic!("unexpected {:?}", other.map(|p| p.record)),
    }
}
