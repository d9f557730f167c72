//! Base learners behind one closed enum: `Learner::fit` produces a
//! `FittedRegressor`, and `FittedRegressor::predict` scores a dense row.
//!
//! All learners are deterministic so parallel fits reproduce serial results.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RidgeParams {
    pub l2: f64,
}

impl Default for RidgeParams {
    fn default() -> Self {
        Self { l2: 1.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoostParams {
    pub n_trees: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub min_leaf: usize,
}

impl Default for BoostParams {
    fn default() -> Self {
        Self {
            n_trees: 80,
            max_depth: 3,
            learning_rate: 0.1,
            min_leaf: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StackParams {
    pub ridge: RidgeParams,
    pub boosted: BoostParams,
    // Trailing share of the (chronological) train rows used to fit the blend.
    pub blend_fraction: f64,
}

impl Default for StackParams {
    fn default() -> Self {
        Self {
            ridge: RidgeParams::default(),
            boosted: BoostParams::default(),
            blend_fraction: 0.25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Learner {
    Ridge(RidgeParams),
    Boosted(BoostParams),
    Stacked(StackParams),
}

impl Learner {
    pub fn name(&self) -> &'static str {
        match self {
            Learner::Ridge(_) => "ridge",
            Learner::Boosted(_) => "boosted",
            Learner::Stacked(_) => "stacked",
        }
    }

    /// The blend weight of a stacked model is undefined on a constant target.
    pub fn requires_target_variance(&self) -> bool {
        matches!(self, Learner::Stacked(_))
    }

    pub fn min_rows(&self) -> usize {
        match self {
            Learner::Stacked(_) => 4,
            _ => 1,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: &str| Err(ForecastError::InvalidConfig(format!("{}: {msg}", self.name())));
        match self {
            Learner::Ridge(p) => {
                if !(p.l2 > 0.0 && p.l2.is_finite()) {
                    return bad("l2 must be positive");
                }
            }
            Learner::Boosted(p) => {
                if p.n_trees == 0 || p.max_depth == 0 || p.min_leaf == 0 {
                    return bad("n_trees, max_depth and min_leaf must be at least 1");
                }
                if !(p.learning_rate > 0.0 && p.learning_rate <= 1.0) {
                    return bad("learning_rate must be in (0, 1]");
                }
            }
            Learner::Stacked(p) => {
                Learner::Ridge(p.ridge).validate()?;
                Learner::Boosted(p.boosted).validate()?;
                if !(p.blend_fraction > 0.0 && p.blend_fraction < 1.0) {
                    return bad("blend_fraction must be in (0, 1)");
                }
            }
        }
        Ok(())
    }

    /// Rows of `x` must be in chronological order for the stacked learner.
    pub fn fit(&self, x: &[Vec<f64>], y: &[f64]) -> Result<FittedRegressor> {
        if x.is_empty() || x.len() != y.len() {
            return Err(self.fit_error(format!(
                "{} feature rows for {} targets",
                x.len(),
                y.len()
            )));
        }
        if y.iter().any(|v| !v.is_finite()) {
            return Err(self.fit_error("non-finite target".to_string()));
        }
        match self {
            Learner::Ridge(p) => Ok(FittedRegressor::Ridge(
                fit_ridge(x, y, p.l2).map_err(|e| self.fit_error(e))?,
            )),
            Learner::Boosted(p) => Ok(FittedRegressor::Boosted(fit_boosted(x, y, p))),
            Learner::Stacked(p) => Ok(FittedRegressor::Stacked(
                fit_stacked(x, y, p).map_err(|e| self.fit_error(e))?,
            )),
        }
    }

    fn fit_error(&self, reason: String) -> ForecastError {
        ForecastError::Regression {
            variant: self.name().to_string(),
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FittedRegressor {
    Ridge(RidgeModel),
    Boosted(BoostedTrees),
    Stacked(StackedModel),
}

impl FittedRegressor {
    pub fn predict(&self, row: &[f64]) -> f64 {
        match self {
            FittedRegressor::Ridge(m) => m.predict(row),
            FittedRegressor::Boosted(m) => m.predict(row),
            FittedRegressor::Stacked(m) => m.predict(row),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RidgeModel {
    pub feature_means: Vec<f64>,
    pub feature_stds: Vec<f64>,
    pub coeffs: Vec<f64>,
    pub intercept: f64,
}

impl RidgeModel {
    pub fn predict(&self, row: &[f64]) -> f64 {
        let mut out = self.intercept;
        for (j, c) in self.coeffs.iter().enumerate() {
            let x = row.get(j).copied().unwrap_or(self.feature_means[j]);
            out += c * standardized(x, self.feature_means[j], self.feature_stds[j]);
        }
        out
    }
}

fn standardized(x: f64, mean: f64, std: f64) -> f64 {
    (x - mean) / std.max(1e-9)
}

fn fit_ridge(x: &[Vec<f64>], y: &[f64], l2: f64) -> std::result::Result<RidgeModel, String> {
    let n = x.len();
    let p = x[0].len();
    if x.iter().any(|row| row.len() != p) {
        return Err("ragged feature matrix".to_string());
    }

    let (means, stds) = column_stats(x);
    let y_mean = y.iter().sum::<f64>() / n as f64;
    if p == 0 {
        return Ok(RidgeModel {
            feature_means: means,
            feature_stds: stds,
            coeffs: Vec::new(),
            intercept: y_mean,
        });
    }

    let z = DMatrix::from_fn(n, p, |i, j| standardized(x[i][j], means[j], stds[j]));
    let yc = DVector::from_iterator(n, y.iter().map(|v| v - y_mean));

    let zt = z.transpose();
    let mut gram = &zt * &z;
    for j in 0..p {
        gram[(j, j)] += l2;
    }
    let rhs = &zt * &yc;

    let beta = match gram.clone().cholesky() {
        Some(chol) => chol.solve(&rhs),
        None => gram
            .lu()
            .solve(&rhs)
            .ok_or_else(|| "singular normal equations".to_string())?,
    };
    if beta.iter().any(|b| !b.is_finite()) {
        return Err("non-finite coefficients".to_string());
    }

    Ok(RidgeModel {
        feature_means: means,
        feature_stds: stds,
        coeffs: beta.iter().copied().collect(),
        intercept: y_mean,
    })
}

/// Population mean and std per column; constant columns get std 1.0.
fn column_stats(x: &[Vec<f64>]) -> (Vec<f64>, Vec<f64>) {
    let n = x.len() as f64;
    let p = x.first().map(|r| r.len()).unwrap_or(0);
    let mut mean = vec![0.0; p];
    let mut var = vec![0.0; p];
    for row in x {
        for (j, v) in row.iter().enumerate() {
            mean[j] += v;
        }
    }
    for m in &mut mean {
        *m /= n;
    }
    for row in x {
        for (j, v) in row.iter().enumerate() {
            var[j] += (v - mean[j]).powi(2);
        }
    }
    let std = var
        .into_iter()
        .map(|v| {
            let s = (v / n).sqrt();
            if s > 1e-9 { s } else { 1.0 }
        })
        .collect();
    (mean, std)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum TreeNode {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    pub nodes: Vec<TreeNode>,
}

impl RegressionTree {
    pub fn predict(&self, row: &[f64]) -> f64 {
        let mut idx = 0usize;
        loop {
            match self.nodes.get(idx) {
                Some(TreeNode::Leaf { value }) => return *value,
                Some(TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let v = row.get(*feature).copied().unwrap_or(0.0);
                    idx = if v <= *threshold { *left } else { *right };
                }
                None => return 0.0,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostedTrees {
    pub base: f64,
    pub learning_rate: f64,
    pub trees: Vec<RegressionTree>,
}

impl BoostedTrees {
    pub fn predict(&self, row: &[f64]) -> f64 {
        self.base
            + self.learning_rate * self.trees.iter().map(|t| t.predict(row)).sum::<f64>()
    }
}

fn fit_boosted(x: &[Vec<f64>], y: &[f64], params: &BoostParams) -> BoostedTrees {
    let n = y.len();
    let base = y.iter().sum::<f64>() / n as f64;
    let mut pred = vec![base; n];
    let mut trees = Vec::with_capacity(params.n_trees);

    for _ in 0..params.n_trees {
        let residual: Vec<f64> = y.iter().zip(&pred).map(|(t, p)| t - p).collect();
        let sse: f64 = residual.iter().map(|r| r * r).sum();
        if sse < 1e-12 {
            break;
        }

        let mut nodes = Vec::new();
        grow_node(&mut nodes, x, &residual, (0..n).collect(), 0, params);
        let tree = RegressionTree { nodes };
        for (i, row) in x.iter().enumerate() {
            pred[i] += params.learning_rate * tree.predict(row);
        }
        trees.push(tree);
    }

    BoostedTrees {
        base,
        learning_rate: params.learning_rate,
        trees,
    }
}

fn grow_node(
    nodes: &mut Vec<TreeNode>,
    x: &[Vec<f64>],
    r: &[f64],
    idx: Vec<usize>,
    depth: usize,
    params: &BoostParams,
) -> usize {
    let value = idx.iter().map(|&i| r[i]).sum::<f64>() / idx.len().max(1) as f64;
    let at = nodes.len();
    nodes.push(TreeNode::Leaf { value });

    if depth >= params.max_depth || idx.len() < 2 * params.min_leaf {
        return at;
    }
    let Some((feature, threshold)) = best_split(x, r, &idx, params.min_leaf) else {
        return at;
    };

    let (left_idx, right_idx): (Vec<usize>, Vec<usize>) =
        idx.into_iter().partition(|&i| x[i][feature] <= threshold);
    let left = grow_node(nodes, x, r, left_idx, depth + 1, params);
    let right = grow_node(nodes, x, r, right_idx, depth + 1, params);
    nodes[at] = TreeNode::Split {
        feature,
        threshold,
        left,
        right,
    };
    at
}

/// Exhaustive squared-error split search. Ties keep the first candidate found.
fn best_split(x: &[Vec<f64>], r: &[f64], idx: &[usize], min_leaf: usize) -> Option<(usize, f64)> {
    let n = idx.len();
    let p = x[idx[0]].len();
    let total: f64 = idx.iter().map(|&i| r[i]).sum();
    let parent = total * total / n as f64;

    let mut best: Option<(usize, f64, f64)> = None;
    let mut order = idx.to_vec();
    for f in 0..p {
        order.sort_by(|&a, &b| x[a][f].total_cmp(&x[b][f]));
        let mut left_sum = 0.0;
        for k in 0..n - 1 {
            left_sum += r[order[k]];
            let nl = k + 1;
            let nr = n - nl;
            if nl < min_leaf || nr < min_leaf {
                continue;
            }
            let lo = x[order[k]][f];
            let hi = x[order[k + 1]][f];
            if hi <= lo {
                continue;
            }
            let right_sum = total - left_sum;
            let gain = left_sum * left_sum / nl as f64 + right_sum * right_sum / nr as f64 - parent;
            if gain > 1e-12 && best.is_none_or(|(_, _, g)| gain > g) {
                best = Some((f, (lo + hi) / 2.0, gain));
            }
        }
    }
    best.map(|(f, t, _)| (f, t))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackedModel {
    pub ridge: RidgeModel,
    pub boosted: BoostedTrees,
    pub ridge_weight: f64,
}

impl StackedModel {
    pub fn predict(&self, row: &[f64]) -> f64 {
        self.ridge_weight * self.ridge.predict(row)
            + (1.0 - self.ridge_weight) * self.boosted.predict(row)
    }
}

fn fit_stacked(
    x: &[Vec<f64>],
    y: &[f64],
    params: &StackParams,
) -> std::result::Result<StackedModel, String> {
    let n = y.len();
    let blend_rows = ((n as f64) * params.blend_fraction).round().max(1.0) as usize;
    let blend_start = n.saturating_sub(blend_rows);
    if blend_start < 2 {
        return Err(format!("{n} rows leave too few for a base fit before blending"));
    }

    let ridge_base = fit_ridge(&x[..blend_start], &y[..blend_start], params.ridge.l2)?;
    let boosted_base = fit_boosted(&x[..blend_start], &y[..blend_start], &params.boosted);
    let ridge_weight = fit_blend_weight(
        &x[blend_start..],
        &y[blend_start..],
        |row| ridge_base.predict(row),
        |row| boosted_base.predict(row),
    );

    Ok(StackedModel {
        ridge: fit_ridge(x, y, params.ridge.l2)?,
        boosted: fit_boosted(x, y, &params.boosted),
        ridge_weight,
    })
}

/// Grid search over the convex weight in 0.05 steps, lowest squared error wins.
fn fit_blend_weight(
    x: &[Vec<f64>],
    y: &[f64],
    first: impl Fn(&[f64]) -> f64,
    second: impl Fn(&[f64]) -> f64,
) -> f64 {
    let pairs: Vec<(f64, f64)> = x.iter().map(|row| (first(row), second(row))).collect();
    let mut best_w = 0.5;
    let mut best_sse = f64::INFINITY;
    for step in 0..=20 {
        let w = step as f64 / 20.0;
        let sse: f64 = pairs
            .iter()
            .zip(y)
            .map(|((a, b), t)| (w * a + (1.0 - w) * b - t).powi(2))
            .sum();
        if sse < best_sse {
            best_sse = sse;
            best_w = w;
        }
    }
    best_w
}
