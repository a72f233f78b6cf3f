pub const DEFAULT_TARGET_COVERAGE: f64 = 0.90;
pub const DEFAULT_SEARCH_BOUNDS: (f64, f64) = (0.5, 3.0);
pub const DEFAULT_CALIBRATION_TOLERANCE: f64 = 0.02;
pub const DEFAULT_N_FOLDS: usize = 5;
pub const DEFAULT_STRATIFICATION_BINS: usize = 10;
pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_LUXURY_THRESHOLD: f64 = 800_000.0;
pub const DEFAULT_GATE_SMOOTHNESS: [f64; 5] = [0.05, 0.1, 0.2, 0.3, 0.5];
pub const DEFAULT_INFLATION_BETA: f64 = 0.4;
pub const DEFAULT_MIN_STAGE2_ROWS: usize = 50;
pub const DEFAULT_SIGMA_THRESHOLDS: [f64; 5] = [0.05, 0.10, 0.15, 0.20, 0.25];

/// The sigmoid argument is clipped to this range before exponentiation.
pub const SIGMOID_CLIP: f64 = 500.0;

/// Fixed reference levels reported before and after calibration: (label, confidence, z).
pub const REFERENCE_LEVELS: [(&str, f64, f64); 5] = [
    ("50%", 0.50, 0.674),
    ("68%", 0.68, 1.000),
    ("80%", 0.80, 1.282),
    ("90%", 0.90, 1.645),
    ("95%", 0.95, 1.960),
];

/// Width of the band used in per-fold coverage diagnostics.
pub const FOLD_COVERAGE_SIGMAS: f64 = 2.0;

/// Bisection stops once the bracket is narrower than this.
pub const SCALE_XTOL: f64 = 1e-9;
pub const GOLDEN_MAX_ITER: usize = 500;

/// Largest `max_bin`; bin codes also hold the missing bin and the f64::MAX sentinel bin.
pub const MAX_BIN_LIMIT: u16 = u16::MAX - 2;

pub const HESSIAN_EPS: f64 = 1e-12;
pub const LOG_VARIANCE_CLIP: f64 = 30.0;
pub const CATEGORY_UNKNOWN: &str = "Unknown";
pub const CALIBRATION_RECORD_VERSION: u32 = 1;
pub const PIPELINE_CONFIG_VERSION: u32 = 1;
