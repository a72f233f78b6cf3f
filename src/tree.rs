use crate::binning::BinnedData;
use crate::data::Matrix;
use crate::persistence::parse_missing;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Node {
    pub num: usize,
    pub weight_value: f64,
    pub hessian_sum: f64,
    pub count: usize,
    pub depth: usize,
    pub split_feature: usize,
    pub split_bin: u16,
    #[serde(deserialize_with = "parse_missing")]
    pub split_value: f64,
    pub split_gain: f64,
    pub missing_left: bool,
    pub left_child: usize,
    pub right_child: usize,
    pub is_leaf: bool,
}

impl Node {
    fn leaf(num: usize, weight_value: f64, hessian_sum: f64, count: usize, depth: usize) -> Self {
        Node {
            num,
            weight_value,
            hessian_sum,
            count,
            depth,
            split_feature: 0,
            split_bin: 0,
            split_value: f64::NAN,
            split_gain: 0.0,
            missing_left: true,
            left_child: 0,
            right_child: 0,
            is_leaf: true,
        }
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_leaf {
            write!(f, "{}:leaf={},cover={}", self.num, self.weight_value, self.hessian_sum)
        } else {
            write!(
                f,
                "{}:[{} <= {}] yes={},no={},missing={},gain={},cover={}",
                self.num,
                self.split_feature,
                self.split_value,
                self.left_child,
                self.right_child,
                if self.missing_left { self.left_child } else { self.right_child },
                self.split_gain,
                self.hessian_sum
            )
        }
    }
}

/// Growth parameters shared by every tree of a booster head.
#[derive(Clone, Copy, Debug)]
pub struct TreeParams {
    pub max_depth: usize,
    pub min_leaf_size: usize,
    pub lambda: f64,
    pub min_split_gain: f64,
    pub eta: f64,
}

struct SplitCandidate {
    feature: usize,
    bin: u16,
    gain: f64,
    missing_left: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Tree {
    pub nodes: Vec<Node>,
    pub depth: usize,
    pub n_leaves: usize,
}

#[inline]
fn score(g: f64, h: f64, lambda: f64) -> f64 {
    g * g / (h + lambda)
}

impl Tree {
    pub fn new() -> Self {
        Tree::default()
    }

    /// Grow a tree depth first on the rows in `index`.
    ///
    /// * `binned` - Binned training matrix, column major with `rows` rows.
    /// * `grad` / `hess` - Per row gradient and hessian of the objective, indexed by row.
    pub fn fit(
        &mut self,
        binned: &BinnedData,
        rows: usize,
        index: Vec<usize>,
        grad: &[f64],
        hess: &[f64],
        params: &TreeParams,
    ) {
        self.nodes.clear();
        self.depth = 0;
        self.n_leaves = 0;

        let mut stack: Vec<(usize, Vec<usize>, usize)> = Vec::new();
        let (g, h) = sums(&index, grad, hess);
        self.nodes.push(Node::leaf(
            0,
            -g / (h + params.lambda) * params.eta,
            h,
            index.len(),
            0,
        ));
        stack.push((0, index, 0));

        while let Some((num, idx, depth)) = stack.pop() {
            self.depth = self.depth.max(depth);
            if depth >= params.max_depth || idx.len() < 2 * params.min_leaf_size.max(1) {
                self.n_leaves += 1;
                continue;
            }
            let Some(best) = best_split(binned, rows, &idx, grad, hess, params) else {
                self.n_leaves += 1;
                continue;
            };

            let col = &binned.binned_data[best.feature * rows..(best.feature + 1) * rows];
            let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = idx.iter().partition(|&&r| {
                let b = col[r];
                if b == 0 {
                    best.missing_left
                } else {
                    b <= best.bin
                }
            });

            let left_num = self.nodes.len();
            let right_num = left_num + 1;
            for (child_num, child_idx) in [(left_num, &left_idx), (right_num, &right_idx)] {
                let (cg, ch) = sums(child_idx, grad, hess);
                self.nodes.push(Node::leaf(
                    child_num,
                    -cg / (ch + params.lambda) * params.eta,
                    ch,
                    child_idx.len(),
                    depth + 1,
                ));
            }

            let node = &mut self.nodes[num];
            node.is_leaf = false;
            node.split_feature = best.feature;
            node.split_bin = best.bin;
            node.split_value = binned.cuts[best.feature][best.bin as usize - 1];
            node.split_gain = best.gain;
            node.missing_left = best.missing_left;
            node.left_child = left_num;
            node.right_child = right_num;

            stack.push((right_num, right_idx, depth + 1));
            stack.push((left_num, left_idx, depth + 1));
        }
    }

    /// Predict a single row of raw feature values, `value(j)` returns feature `j`.
    #[inline]
    pub fn predict_with<F: Fn(usize) -> f64>(&self, value: F) -> f64 {
        let mut n = 0;
        loop {
            let node = &self.nodes[n];
            if node.is_leaf {
                return node.weight_value;
            }
            let v = value(node.split_feature);
            let go_left = if v.is_nan() { node.missing_left } else { v <= node.split_value };
            n = if go_left { node.left_child } else { node.right_child };
        }
    }

    /// Predict a single row of the binned training matrix.
    #[inline]
    pub fn predict_binned_row(&self, binned: &BinnedData, rows: usize, row: usize) -> f64 {
        let mut n = 0;
        loop {
            let node = &self.nodes[n];
            if node.is_leaf {
                return node.weight_value;
            }
            let b = binned.binned_data[node.split_feature * rows + row];
            let go_left = if b == 0 { node.missing_left } else { b <= node.split_bin };
            n = if go_left { node.left_child } else { node.right_child };
        }
    }

    pub fn predict(&self, data: &Matrix<f64>, parallel: bool) -> Vec<f64> {
        if parallel {
            data.index
                .par_iter()
                .map(|&r| self.predict_with(|j| *data.get(r, j)))
                .collect()
        } else {
            data.index
                .iter()
                .map(|&r| self.predict_with(|j| *data.get(r, j)))
                .collect()
        }
    }
}

impl Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for node in &self.nodes {
            writeln!(f, "{}{}", "      ".repeat(node.depth), node)?;
        }
        Ok(())
    }
}

fn sums(index: &[usize], grad: &[f64], hess: &[f64]) -> (f64, f64) {
    index
        .iter()
        .fold((0.0, 0.0), |(g, h), &i| (g + grad[i], h + hess[i]))
}

fn best_split(
    binned: &BinnedData,
    rows: usize,
    index: &[usize],
    grad: &[f64],
    hess: &[f64],
    params: &TreeParams,
) -> Option<SplitCandidate> {
    let (g_total, h_total) = sums(index, grad, hess);
    let parent = score(g_total, h_total, params.lambda);
    let n_total = index.len();
    let min_leaf = params.min_leaf_size.max(1);

    let mut best: Option<SplitCandidate> = None;
    for feature in 0..binned.cuts.len() {
        let n_bins = binned.n_bins(feature);
        if n_bins < 3 {
            // Only the missing bin and a single value bin, nothing to split on.
            continue;
        }
        let col = &binned.binned_data[feature * rows..(feature + 1) * rows];
        let mut hist = vec![(0.0f64, 0.0f64, 0usize); n_bins];
        for &r in index {
            let e = &mut hist[col[r] as usize];
            e.0 += grad[r];
            e.1 += hess[r];
            e.2 += 1;
        }
        let (gm, hm, cm) = hist[0];

        let (mut gl, mut hl, mut cl) = (0.0, 0.0, 0usize);
        for bin in 1..n_bins - 1 {
            gl += hist[bin].0;
            hl += hist[bin].1;
            cl += hist[bin].2;
            for missing_left in [true, false] {
                if cm == 0 && !missing_left {
                    continue;
                }
                let (g_l, h_l, c_l) = if missing_left { (gl + gm, hl + hm, cl + cm) } else { (gl, hl, cl) };
                let c_r = n_total - c_l;
                if c_l < min_leaf || c_r < min_leaf {
                    continue;
                }
                let g_r = g_total - g_l;
                let h_r = h_total - h_l;
                let gain = score(g_l, h_l, params.lambda) + score(g_r, h_r, params.lambda) - parent;
                if gain > params.min_split_gain && best.as_ref().map_or(true, |b| gain > b.gain) {
                    best = Some(SplitCandidate {
                        feature,
                        bin: bin as u16,
                        gain,
                        missing_left,
                    });
                }
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binning::bin_matrix;
    use approx::assert_relative_eq;

    fn params() -> TreeParams {
        TreeParams {
            max_depth: 3,
            min_leaf_size: 1,
            lambda: 0.0,
            min_split_gain: 0.0,
            eta: 1.0,
        }
    }

    #[test]
    fn test_tree_fits_step_function() {
        let x: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| if *v < 10.0 { 1.0 } else { 5.0 }).collect();
        let data = Matrix::new(&x, 20, 1);
        let binned = bin_matrix(&data, None, 32);
        // Squared loss gradient at yhat = 0.
        let grad: Vec<f64> = y.iter().map(|v| -v).collect();
        let hess = vec![1.0; 20];

        let mut tree = Tree::new();
        tree.fit(&binned, 20, (0..20).collect(), &grad, &hess, &params());
        assert!(!tree.nodes[0].is_leaf);
        assert_relative_eq!(tree.nodes[0].split_value, 9.0);

        let preds = tree.predict(&data, false);
        for (p, t) in preds.iter().zip(&y) {
            assert_relative_eq!(p, t, epsilon = 1e-12);
        }
        // Binned and raw prediction agree.
        for r in 0..20 {
            assert_relative_eq!(tree.predict_binned_row(&binned, 20, r), preds[r]);
        }
    }

    #[test]
    fn test_tree_missing_direction() {
        // Missing rows behave like the high group.
        let x = vec![1.0, 2.0, 3.0, 10.0, 11.0, f64::NAN, f64::NAN];
        let y = vec![0.0, 0.0, 0.0, 4.0, 4.0, 4.0, 4.0];
        let data = Matrix::new(&x, 7, 1);
        let binned = bin_matrix(&data, None, 16);
        let grad: Vec<f64> = y.iter().map(|v| -v).collect();
        let hess = vec![1.0; 7];
        let mut tree = Tree::new();
        tree.fit(&binned, 7, (0..7).collect(), &grad, &hess, &params());
        let root = &tree.nodes[0];
        assert!(!root.missing_left);
        assert_relative_eq!(tree.predict_with(|_| f64::NAN), 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_constant_feature_is_a_leaf() {
        let x = vec![1.0; 10];
        let data = Matrix::new(&x, 10, 1);
        let binned = bin_matrix(&data, None, 16);
        let grad = vec![-1.0; 10];
        let hess = vec![1.0; 10];
        let mut tree = Tree::new();
        tree.fit(&binned, 10, (0..10).collect(), &grad, &hess, &params());
        assert_eq!(tree.nodes.len(), 1);
        assert_eq!(tree.n_leaves, 1);
        assert_relative_eq!(tree.nodes[0].weight_value, 1.0);
    }
}
