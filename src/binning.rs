//! Binning
//!
//! Discretises raw feature columns into quantile bins so that trees can search
//! splits over histograms instead of sorted raw values.
use crate::data::Matrix;
use crate::utils::percentiles;

/// If there are fewer unique values than there are
/// percentiles, just return the unique values of the
/// vectors.
///
/// * `v` - A numeric slice to calculate percentiles for.
/// * `sample_weight` - Instance weights for each row in the data.
fn percentiles_or_value(v: &[f64], sample_weight: &[f64], pcts: &[f64]) -> Vec<f64> {
    let mut v_u = v.to_owned();
    v_u.sort_unstable_by(|a, b| a.total_cmp(b));
    v_u.dedup();
    if v_u.len() <= pcts.len() + 1 {
        v_u
    } else {
        percentiles(v, sample_weight, pcts)
    }
}

// Bin 0 is reserved for missing values. A value v lands in bin k (k >= 1)
// when cuts[k - 2] < v <= cuts[k - 1]; the last cut is always f64::MAX so
// every finite value has a bin.
#[derive(Debug)]
pub struct BinnedData {
    pub binned_data: Vec<u16>,
    pub cuts: Vec<Vec<f64>>,
    pub nunique: Vec<usize>,
}

impl BinnedData {
    /// Number of bins of a column, including the missing bin.
    pub fn n_bins(&self, col: usize) -> usize {
        self.cuts[col].len() + 1
    }
}

/// Return the bin of a raw value given the cut points of its column.
#[inline]
pub fn map_bin(cuts: &[f64], v: f64) -> u16 {
    if v.is_nan() {
        return 0;
    }
    // Values above the f64::MAX sentinel (+inf) share the top bin.
    (cuts.partition_point(|c| *c < v) + 1).min(cuts.len()) as u16
}

/// Bin a numeric matrix.
///
/// * `data` - A numeric matrix, of data to be binned. NaN is treated as missing.
/// * `sample_weight` - Instance weights for each row of the data.
/// * `nbins` - The number of bins each column should be binned into.
pub fn bin_matrix(data: &Matrix<f64>, sample_weight: Option<&[f64]>, nbins: u16) -> BinnedData {
    let nbins_ = f64::from(nbins.max(2));
    let pcts: Vec<f64> = (1..nbins.max(2)).map(|i| f64::from(i) / nbins_).collect();

    let s_w = vec![1.0; data.rows];
    let weight = sample_weight.unwrap_or(&s_w);

    let mut cuts = Vec::with_capacity(data.cols);
    let mut nunique = Vec::with_capacity(data.cols);
    for i in 0..data.cols {
        let (no_miss, w): (Vec<f64>, Vec<f64>) = data
            .get_col(i)
            .iter()
            .zip(weight.iter())
            .filter(|(v, _)| !v.is_nan())
            .unzip();
        let mut col_cuts = percentiles_or_value(&no_miss, &w, &pcts);
        col_cuts.push(f64::MAX);
        col_cuts.dedup();
        let mut u = no_miss.clone();
        u.sort_unstable_by(|a, b| a.total_cmp(b));
        u.dedup();
        nunique.push(u.len());
        cuts.push(col_cuts);
    }

    let binned_data = data
        .data
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let col = i / data.rows;
            map_bin(&cuts[col], *v)
        })
        .collect();

    BinnedData {
        binned_data,
        cuts,
        nunique,
    }
}
