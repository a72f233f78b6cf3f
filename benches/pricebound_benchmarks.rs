use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pricebound::booster::{BoosterConfig, GradientBooster};
use pricebound::calibration::{calibrate_sigma, CalibrationConfig, SearchMethod};
use pricebound::coverage::coverage;
use pricebound::data::Matrix;
use pricebound::gate::Gate;
use pricebound::transform::TargetTransform;
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::Normal;
use std::time::Duration;

// Log prices with a heteroscedastic noise and the matching sigma estimates.
fn create_predictions(n: usize) -> (Vec<f64>, Vec<f64>, Vec<Option<f64>>) {
    let mut rng = StdRng::seed_from_u64(1903);
    let standard = Normal::new(0.0, 1.0).unwrap();
    let mut y = Vec::with_capacity(n);
    let mut mean = Vec::with_capacity(n);
    let mut sigma = Vec::with_capacity(n);
    for _ in 0..n {
        let m = rng.gen_range(10.0..15.0);
        let s = rng.gen_range(0.05..0.4);
        y.push(m + 1.3 * s * standard.sample(&mut rng));
        mean.push(m);
        sigma.push(Some(s));
    }
    (y, mean, sigma)
}

fn create_features(n: usize, cols: usize) -> (Vec<f64>, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(0);
    let x: Vec<f64> = (0..n * cols).map(|_| rng.gen::<f64>()).collect();
    let y: Vec<f64> = (0..n).map(|i| 12.0 + x[i] * 2.0 - x[n + i] + 0.1 * rng.gen::<f64>()).collect();
    (x, y)
}

pub fn calibration_benchmarks(c: &mut Criterion) {
    let (y, mean, sigma) = create_predictions(100_000);

    c.bench_function("coverage 100k", |b| {
        b.iter(|| coverage(black_box(&y), black_box(&mean), black_box(&sigma), black_box(1.645)))
    });

    let plateau = CalibrationConfig::default();
    c.bench_function("calibrate_sigma plateau 100k", |b| {
        b.iter(|| calibrate_sigma(black_box(&y), black_box(&mean), black_box(&sigma), &plateau))
    });
    let golden = CalibrationConfig::default().set_method(SearchMethod::GoldenSection);
    c.bench_function("calibrate_sigma golden 100k", |b| {
        b.iter(|| calibrate_sigma(black_box(&y), black_box(&mean), black_box(&sigma), &golden))
    });

    let gate = Gate::from_price(800_000.0, 0.15, TargetTransform::Log1p).unwrap();
    c.bench_function("gate weights 100k", |b| b.iter(|| gate.weights(black_box(&mean))));
}

pub fn booster_benchmarks(c: &mut Criterion) {
    let (x, y) = create_features(10_000, 5);
    let data = Matrix::new(&x, y.len(), 5);
    let cfg = BoosterConfig::default()
        .set_iterations(50)
        .set_learning_rate(0.1)
        .set_early_stopping_rounds(None);

    let mut booster_train = c.benchmark_group("booster_train");
    booster_train.sample_size(10);
    booster_train.measurement_time(Duration::from_secs(20));
    booster_train.bench_function("fit mean and variance 10k", |b| {
        b.iter(|| {
            let mut booster = GradientBooster::new(cfg.clone());
            booster.fit(black_box(&data), black_box(&y), None).unwrap();
        })
    });
    let point_cfg = cfg.clone().set_uncertainty(false);
    booster_train.bench_function("fit mean only 10k", |b| {
        b.iter(|| {
            let mut booster = GradientBooster::new(point_cfg.clone());
            booster.fit(black_box(&data), black_box(&y), None).unwrap();
        })
    });
    booster_train.finish();
}

criterion_group!(benches, calibration_benchmarks, booster_benchmarks);
criterion_main!(benches);
