//! Fit the two-stage pipeline on synthetic listings and print calibrated price intervals.
//!
//! `cargo run --release --example price_intervals`
use pricebound::booster::BoosterConfig;
use pricebound::corrector::Stage2Config;
use pricebound::cv::CvConfig;
use pricebound::dataset::{ColumnSpec, Dataset};
use pricebound::pipeline::{write_predictions_csv, PipelineConfig, TrainedPipeline};
use pricebound::{GradientBooster, PriceboundError};
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::Normal;
use std::error::Error;

const BRANDS: [(&str, f64); 6] = [
    ("Toyota", 11.3),
    ("Kia", 10.9),
    ("Mercedes", 12.4),
    ("Bentley", 13.5),
    ("Ferrari", 13.7),
    ("Rolls Royce", 14.0),
];

fn listings(n: usize, seed: u64) -> Result<Dataset, PriceboundError> {
    let spec = ColumnSpec::new(&["brand", "trim"], &["kms", "vehicle_age"], "log_price", &["brand", "trim"]);
    let mut rng = StdRng::seed_from_u64(seed);
    let (mut brand, mut trim, mut kms, mut age, mut y) = (vec![], vec![], vec![], vec![], vec![]);
    for _ in 0..n {
        let (name, base) = BRANDS[rng.gen_range(0..BRANDS.len())];
        let t = rng.gen_range(0..4);
        let a = rng.gen_range(0..15) as f64;
        let noise = Normal::new(0.0, if base > 13.0 { 0.15 } else { 0.07 }).map_err(|e| {
            PriceboundError::InvalidParameter("noise".to_string(), "a valid normal".to_string(), e.to_string())
        })?;
        brand.push(name.to_string());
        trim.push(format!("T{}", t));
        kms.push(a * 12_000.0 * rng.gen_range(0.5..1.5));
        age.push(a);
        y.push(base + 0.1 * t as f64 - 0.06 * a + noise.sample(&mut rng));
    }
    Dataset::from_columns(spec, vec![brand, trim], vec![kms, age], y)
}

fn main() -> Result<(), Box<dyn Error>> {
    let train = listings(2000, 0)?;
    let test = listings(500, 1)?;

    let booster = BoosterConfig::default()
        .set_iterations(300)
        .set_learning_rate(0.05)
        .set_early_stopping_rounds(Some(30));
    let cfg = PipelineConfig::default()
        .set_columns(train.spec.clone())
        .set_booster(booster.clone())
        .set_cv(CvConfig::default().set_n_folds(5))
        .set_stage2(Stage2Config::default().set_booster(booster.set_uncertainty(false)));

    let pipeline = TrainedPipeline::<GradientBooster>::fit(&train, &cfg)?;
    println!(
        "calibration factor {:.3}, smoothness {:?}, stage 2 {}",
        pipeline.record.calibration_factor,
        pipeline.record.gate_smoothness,
        if pipeline.has_stage2() { "trained" } else { "skipped" }
    );

    let report = pipeline.evaluate(&test)?;
    println!(
        "test MedAPE {:.2}% (base {:.2}%), R2 log {:.3}, coverage raw {:?} calibrated {:?} adjusted {:?}",
        report.medape,
        report.stage1_medape,
        report.r2_log,
        report.coverage_raw,
        report.coverage_calibrated,
        report.coverage_adjusted
    );

    let rows = pipeline.predict(&test)?;
    for row in rows.iter().take(5) {
        println!(
            "true {:>12.0}  predicted {:>12.0}  interval [{:>12.0}, {:>12.0}]  gate {:.3}",
            row.y_true.unwrap_or(f64::NAN),
            row.final_price,
            row.lower.unwrap_or(f64::NAN),
            row.upper.unwrap_or(f64::NAN),
            row.gate_weight
        );
    }

    let out = std::env::temp_dir().join("pricebound_demo");
    pipeline.save(&out)?;
    write_predictions_csv(out.join("predictions.csv"), &rows)?;
    println!("artifacts written to {}", out.display());
    Ok(())
}
