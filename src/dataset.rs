//! Dataset
//!
//! Column contract for the listing tables, CSV loading and the ordinal feature
//! encoder shared by training and inference.
use crate::constants::CATEGORY_UNKNOWN;
use crate::data::Matrix;
use crate::errors::PriceboundError;
use crate::persistence::JsonIO;
use hashbrown::HashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Cell contents treated as missing.
const MISSING_TOKENS: [&str; 7] = ["", "NA", "N/A", "NaN", "nan", "null", "None"];

fn is_missing(cell: &str) -> bool {
    MISSING_TOKENS.contains(&cell.trim())
}

fn strings(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

/// Which columns of a table are categorical features, numeric features, the
/// log-space target and the identity key used for grouped folds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub categorical: Vec<String>,
    pub numeric: Vec<String>,
    pub target: String,
    pub group_columns: Vec<String>,
}

impl Default for ColumnSpec {
    fn default() -> Self {
        ColumnSpec {
            categorical: strings(&[
                "brand",
                "model",
                "trim",
                "fuel_type",
                "body_type",
                "steering_side",
                "regional_specs",
                "doors",
                "seating_capacity",
                "cylinders",
                "age_bucket",
            ]),
            numeric: strings(&["kms", "vehicle_age", "kms_per_year", "horsepower_mid", "engine_cc_mid"]),
            target: "log_price".to_string(),
            group_columns: strings(&["brand", "model"]),
        }
    }
}

impl ColumnSpec {
    pub fn new(categorical: &[&str], numeric: &[&str], target: &str, group_columns: &[&str]) -> Self {
        ColumnSpec {
            categorical: strings(categorical),
            numeric: strings(numeric),
            target: target.to_string(),
            group_columns: strings(group_columns),
        }
    }

    pub fn n_features(&self) -> usize {
        self.categorical.len() + self.numeric.len()
    }

    /// Feature names in encoded column order, categorical first.
    pub fn feature_names(&self) -> Vec<String> {
        self.categorical.iter().chain(self.numeric.iter()).cloned().collect()
    }
}

/// A table held column by column, labelled for training and evaluation or
/// unlabelled for inference.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub spec: ColumnSpec,
    pub categorical: Vec<Vec<String>>,
    pub numeric: Vec<Vec<f64>>,
    /// Log-space target, `None` when the table has no target column. In a
    /// table read for inference an unknown target is NaN.
    pub target: Option<Vec<f64>>,
    /// Group key per row, the group columns joined with `|`.
    pub groups: Vec<String>,
}

impl Dataset {
    /// Build a labelled dataset from in-memory columns. Group columns must be categorical.
    pub fn from_columns(
        spec: ColumnSpec,
        categorical: Vec<Vec<String>>,
        numeric: Vec<Vec<f64>>,
        target: Vec<f64>,
    ) -> Result<Self, PriceboundError> {
        if let Some((i, v)) = target.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(PriceboundError::NonFiniteTarget(i, *v));
        }
        let n = target.len();
        Self::build(spec, categorical, numeric, Some(target), n)
    }

    /// Build a dataset without a target, for inference only.
    pub fn unlabelled(
        spec: ColumnSpec,
        categorical: Vec<Vec<String>>,
        numeric: Vec<Vec<f64>>,
    ) -> Result<Self, PriceboundError> {
        let n = categorical
            .first()
            .map(|c| c.len())
            .or_else(|| numeric.first().map(|c| c.len()))
            .unwrap_or(0);
        Self::build(spec, categorical, numeric, None, n)
    }

    fn build(
        spec: ColumnSpec,
        categorical: Vec<Vec<String>>,
        mut numeric: Vec<Vec<f64>>,
        target: Option<Vec<f64>>,
        n: usize,
    ) -> Result<Self, PriceboundError> {
        if categorical.len() != spec.categorical.len() {
            return Err(PriceboundError::ShapeMismatch(
                "categorical columns".to_string(),
                spec.categorical.len(),
                categorical.len(),
            ));
        }
        if numeric.len() != spec.numeric.len() {
            return Err(PriceboundError::ShapeMismatch(
                "numeric columns".to_string(),
                spec.numeric.len(),
                numeric.len(),
            ));
        }
        for (name, col) in spec.categorical.iter().zip(&categorical) {
            if col.len() != n {
                return Err(PriceboundError::ShapeMismatch(name.clone(), n, col.len()));
            }
        }
        for (name, col) in spec.numeric.iter().zip(numeric.iter_mut()) {
            if col.len() != n {
                return Err(PriceboundError::ShapeMismatch(name.clone(), n, col.len()));
            }
            let mut infinite = 0;
            for v in col.iter_mut().filter(|v| v.is_infinite()) {
                *v = f64::NAN;
                infinite += 1;
            }
            if infinite > 0 {
                warn!("{} infinite values of {} are treated as missing.", infinite, name);
            }
        }
        if let Some(t) = &target {
            if t.len() != n {
                return Err(PriceboundError::ShapeMismatch(spec.target.clone(), n, t.len()));
            }
        }
        let mut group_cols = Vec::with_capacity(spec.group_columns.len());
        for g in &spec.group_columns {
            let j = spec
                .categorical
                .iter()
                .position(|c| c == g)
                .ok_or_else(|| PriceboundError::UnknownColumn(g.clone(), spec.categorical.join(", ")))?;
            group_cols.push(&categorical[j]);
        }
        let groups = (0..n)
            .map(|i| {
                group_cols
                    .iter()
                    .map(|c| c[i].as_str())
                    .collect::<Vec<_>>()
                    .join("|")
            })
            .collect();
        Ok(Dataset {
            spec,
            categorical,
            numeric,
            target,
            groups,
        })
    }

    /// Load a labelled CSV file with a header row.
    pub fn from_csv<P: AsRef<Path>>(path: P, spec: &ColumnSpec) -> Result<Self, PriceboundError> {
        Self::read_table(open(path.as_ref())?, spec, false)
    }

    /// Load a CSV file for inference, see [`Dataset::from_reader_inference`].
    pub fn from_csv_inference<P: AsRef<Path>>(path: P, spec: &ColumnSpec) -> Result<Self, PriceboundError> {
        Self::read_table(open(path.as_ref())?, spec, true)
    }

    /// Read a labelled CSV table.
    ///
    /// Missing categorical cells become `"Unknown"`, numeric cells that do not
    /// parse to a finite number become NaN and rows without a finite target
    /// are dropped.
    pub fn from_reader<R: Read>(reader: R, spec: &ColumnSpec) -> Result<Self, PriceboundError> {
        Self::read_table(reader, spec, false)
    }

    /// Read a CSV table for inference. Every row is kept, the target column
    /// may be absent and an unknown target is NaN.
    pub fn from_reader_inference<R: Read>(reader: R, spec: &ColumnSpec) -> Result<Self, PriceboundError> {
        Self::read_table(reader, spec, true)
    }

    fn read_table<R: Read>(reader: R, spec: &ColumnSpec, inference: bool) -> Result<Self, PriceboundError> {
        let mut rdr = csv::Reader::from_reader(reader);
        let headers = rdr.headers()?.clone();
        let position = |name: &str| {
            headers.iter().position(|h| h.trim() == name).ok_or_else(|| {
                PriceboundError::UnknownColumn(name.to_string(), headers.iter().collect::<Vec<_>>().join(", "))
            })
        };
        let cat_idx = spec.categorical.iter().map(|c| position(c)).collect::<Result<Vec<_>, _>>()?;
        let num_idx = spec.numeric.iter().map(|c| position(c)).collect::<Result<Vec<_>, _>>()?;
        let target_idx = match position(&spec.target) {
            Ok(j) => Some(j),
            Err(e) if !inference => return Err(e),
            Err(_) => {
                info!("No {} column, reading an unlabelled table.", spec.target);
                None
            }
        };

        let mut categorical = vec![Vec::new(); cat_idx.len()];
        let mut numeric = vec![Vec::new(); num_idx.len()];
        let mut target = Vec::new();
        let mut n = 0;
        let mut dropped = 0;
        for record in rdr.records() {
            let record = record?;
            if let Some(j) = target_idx {
                let y = parse_number(record.get(j).unwrap_or(""));
                if !inference && y.is_nan() {
                    dropped += 1;
                    continue;
                }
                target.push(y);
            }
            for (col, j) in categorical.iter_mut().zip(&cat_idx) {
                col.push(parse_category(record.get(*j).unwrap_or("")));
            }
            for (col, j) in numeric.iter_mut().zip(&num_idx) {
                col.push(parse_number(record.get(*j).unwrap_or("")));
            }
            n += 1;
        }
        if dropped > 0 {
            warn!("Dropped {} rows without a finite {}.", dropped, spec.target);
        }
        info!("Loaded {} rows with {} features.", n, spec.n_features());
        Self::build(spec.clone(), categorical, numeric, target_idx.map(|_| target), n)
    }

    pub fn n_rows(&self) -> usize {
        self.groups.len()
    }

    pub fn is_labelled(&self) -> bool {
        self.target.is_some()
    }

    /// The target, which training and evaluation require to be present and finite.
    pub fn labels(&self) -> Result<&[f64], PriceboundError> {
        let target = self
            .target
            .as_deref()
            .ok_or_else(|| PriceboundError::MissingTarget(self.spec.target.clone()))?;
        if let Some((i, v)) = target.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(PriceboundError::NonFiniteTarget(i, *v));
        }
        Ok(target)
    }

    /// The rows at `rows`, in that order.
    pub fn subset(&self, rows: &[usize]) -> Dataset {
        Dataset {
            spec: self.spec.clone(),
            categorical: self
                .categorical
                .iter()
                .map(|c| rows.iter().map(|i| c[*i].clone()).collect())
                .collect(),
            numeric: self.numeric.iter().map(|c| rows.iter().map(|i| c[*i]).collect()).collect(),
            target: self.target.as_ref().map(|t| rows.iter().map(|i| t[*i]).collect()),
            groups: rows.iter().map(|i| self.groups[*i].clone()).collect(),
        }
    }
}

fn open(path: &Path) -> Result<File, PriceboundError> {
    File::open(path).map_err(|e| PriceboundError::UnableToRead(format!("{}: {}", path.display(), e)))
}

fn parse_category(cell: &str) -> String {
    if is_missing(cell) {
        CATEGORY_UNKNOWN.to_string()
    } else {
        cell.trim().to_string()
    }
}

// `inf` and `infinity` parse as floats but are missing values here.
#[inline]
fn finite_or_missing(x: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        f64::NAN
    }
}

fn parse_number(cell: &str) -> f64 {
    if is_missing(cell) {
        return f64::NAN;
    }
    cell.trim().parse::<f64>().map_or(f64::NAN, finite_or_missing)
}

/// A single feature value handed to inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeatureValue {
    Text(String),
    Number(f64),
    /// Known to be missing, as opposed to the column being absent.
    Missing,
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self {
        FeatureValue::Text(v.to_string())
    }
}

impl From<String> for FeatureValue {
    fn from(v: String) -> Self {
        FeatureValue::Text(v)
    }
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        FeatureValue::Number(v)
    }
}

/// One row for inference, keyed by column name.
pub type FeatureRecord = HashMap<String, FeatureValue>;

/// Maps categories to ordinal codes in sorted order and lays features out in
/// column major order, categorical columns first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureEncoder {
    pub spec: ColumnSpec,
    /// Sorted distinct categories per categorical column.
    pub categories: Vec<Vec<String>>,
}

impl FeatureEncoder {
    pub fn fit(data: &Dataset) -> Self {
        let categories = data
            .categorical
            .iter()
            .map(|col| {
                let mut c = col.clone();
                c.sort_unstable();
                c.dedup();
                c
            })
            .collect();
        FeatureEncoder {
            spec: data.spec.clone(),
            categories,
        }
    }

    pub fn n_features(&self) -> usize {
        self.spec.n_features()
    }

    fn lookup(&self, col: usize, value: &str) -> Option<f64> {
        self.categories[col]
            .binary_search_by(|c| c.as_str().cmp(value))
            .ok()
            .map(|i| i as f64)
    }

    fn fallback(&self, col: usize) -> f64 {
        self.lookup(col, CATEGORY_UNKNOWN).unwrap_or(f64::NAN)
    }

    /// Code of a category; unseen values fall back to `"Unknown"` when it was
    /// seen in training, otherwise they are missing.
    pub fn code(&self, col: usize, value: &str) -> f64 {
        self.lookup(col, value).unwrap_or_else(|| self.fallback(col))
    }

    /// Number of values per categorical column that were not seen in training.
    pub fn unseen_counts(&self, data: &Dataset) -> Vec<usize> {
        data.categorical
            .iter()
            .enumerate()
            .map(|(j, col)| col.iter().filter(|v| self.lookup(j, v).is_none()).count())
            .collect()
    }

    /// Encode a whole dataset into a column major feature matrix buffer.
    pub fn transform(&self, data: &Dataset) -> Vec<f64> {
        for (j, unseen) in self.unseen_counts(data).into_iter().enumerate() {
            if unseen > 0 {
                warn!(
                    "{} of {} values of {} were not seen in training and are encoded as {}.",
                    unseen,
                    data.n_rows(),
                    self.spec.categorical[j],
                    if self.fallback(j).is_nan() { "missing" } else { CATEGORY_UNKNOWN }
                );
            }
        }
        let mut out = Vec::with_capacity(self.n_features() * data.n_rows());
        for (j, col) in data.categorical.iter().enumerate() {
            out.extend(col.iter().map(|v| self.code(j, v)));
        }
        for col in &data.numeric {
            out.extend_from_slice(col);
        }
        out
    }

    fn record_code(&self, row: usize, col: usize, value: &str) -> f64 {
        self.lookup(col, value).unwrap_or_else(|| {
            debug!(
                "Row {} has unseen {} value {:?}, encoded as {}.",
                row,
                self.spec.categorical[col],
                value,
                if self.fallback(col).is_nan() { "missing" } else { CATEGORY_UNKNOWN }
            );
            self.fallback(col)
        })
    }

    /// Encode one record into a feature row.
    ///
    /// * `row` - Position of the record in its batch, used in errors.
    pub fn encode_record(&self, row: usize, record: &FeatureRecord) -> Result<Vec<f64>, PriceboundError> {
        let mut out = Vec::with_capacity(self.n_features());
        for (j, name) in self.spec.categorical.iter().enumerate() {
            let v = match record.get(name) {
                None => return Err(PriceboundError::MissingFeature(row, name.clone())),
                Some(FeatureValue::Missing) => self.code(j, CATEGORY_UNKNOWN),
                Some(FeatureValue::Text(s)) => self.record_code(row, j, &parse_category(s)),
                Some(FeatureValue::Number(x)) => self.record_code(row, j, &number_category(*x)),
            };
            out.push(v);
        }
        for name in &self.spec.numeric {
            let v = match record.get(name) {
                None => return Err(PriceboundError::MissingFeature(row, name.clone())),
                Some(FeatureValue::Missing) => f64::NAN,
                Some(FeatureValue::Number(x)) => finite_or_missing(*x),
                Some(FeatureValue::Text(s)) if is_missing(s) => f64::NAN,
                Some(FeatureValue::Text(s)) => s
                    .trim()
                    .parse::<f64>()
                    .map(finite_or_missing)
                    .map_err(|_| PriceboundError::InvalidFeatureValue(row, name.clone(), s.clone()))?,
            };
            out.push(v);
        }
        Ok(out)
    }
}

impl JsonIO for FeatureEncoder {}

// Whole numbers are written without a fraction, as they appear in the tables.
fn number_category(x: f64) -> String {
    if x.is_nan() {
        CATEGORY_UNKNOWN.to_string()
    } else if x.fract() == 0.0 && x.abs() < 1e15 {
        format!("{}", x as i64)
    } else {
        x.to_string()
    }
}

/// Stack feature rows into a column major buffer.
pub fn rows_to_columns(rows: &[Vec<f64>], n_features: usize) -> Vec<f64> {
    let mut out = vec![0.0; rows.len() * n_features];
    for (i, row) in rows.iter().enumerate() {
        for (j, v) in row.iter().enumerate() {
            out[j * rows.len() + i] = *v;
        }
    }
    out
}

/// View an encoded buffer as a matrix.
pub fn as_matrix(buffer: &[f64], n_features: usize) -> Matrix<'_, f64> {
    let rows = if n_features == 0 { 0 } else { buffer.len() / n_features };
    Matrix::new(buffer, rows, n_features)
}
