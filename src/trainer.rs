//! Fits the margin and total regressors for one (window, variant) member and
//! scores its holdout partition.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calibration::{
    RegressionMetrics, WinMetrics, classify_margin, evaluate_regression, evaluate_win_probs,
};
use crate::design_matrix::GameDesignRow;
use crate::error::{ForecastError, Result};
use crate::regressor::{BoostParams, FittedRegressor, Learner, RidgeParams, StackParams};
use crate::rolling;
use crate::split::{FeatureMatrix, FillMap};
use crate::team_game::WeekKey;
use crate::win_prob::win_prob_from_margin;

/// Margin dispersion used when the training margins give no usable spread.
pub const SIGMA_MARGIN_FALLBACK: f64 = 14.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVariant {
    pub id: String,
    pub learner: Learner,
}

impl ModelVariant {
    pub fn ridge() -> Self {
        Self {
            id: "ridge".to_string(),
            learner: Learner::Ridge(RidgeParams::default()),
        }
    }

    pub fn boosted() -> Self {
        Self {
            id: "boosted".to_string(),
            learner: Learner::Boosted(BoostParams::default()),
        }
    }

    pub fn stacked() -> Self {
        Self {
            id: "stacked".to_string(),
            learner: Learner::Stacked(StackParams::default()),
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ridge" | "linear" => Ok(Self::ridge()),
            "boosted" | "gbt" | "trees" => Ok(Self::boosted()),
            "stacked" | "stack" => Ok(Self::stacked()),
            other => Err(ForecastError::InvalidConfig(format!(
                "unknown model variant '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub window_size: usize,
    pub variant_id: String,
    /// Raw stats the rolling columns were derived from.
    pub stats: Vec<String>,
    pub feature_names: Vec<String>,
    pub train_means: FillMap,
    pub margin_model: FittedRegressor,
    pub total_model: FittedRegressor,
    pub sigma_margin: f64,
    pub train_through_week: WeekKey,
    pub train_rows: usize,
}

impl ModelArtifact {
    pub fn rolling_columns(&self) -> Vec<String> {
        rolling::feature_columns(&self.stats, self.window_size)
    }

    /// (margin, total) for a sparse feature map; gaps take the train means.
    pub fn predict_features(&self, features: &BTreeMap<String, Option<f64>>) -> (f64, f64) {
        let x = self.train_means.apply(features, &self.feature_names);
        (self.margin_model.predict(&x), self.total_model.predict(&x))
    }
}

#[derive(Debug, Clone)]
pub struct ModelTrainer {
    pub window: usize,
    pub stats: Vec<String>,
    pub min_train_rows: usize,
}

impl ModelTrainer {
    pub fn new(window: usize, stats: Vec<String>, min_train_rows: usize) -> Result<Self> {
        if window == 0 {
            return Err(ForecastError::InvalidConfig(
                "rolling window must be at least 1".to_string(),
            ));
        }
        if min_train_rows == 0 {
            return Err(ForecastError::InvalidConfig(
                "min_train_rows must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            window,
            stats,
            min_train_rows,
        })
    }

    pub fn fit(
        &self,
        train: &[&GameDesignRow],
        feature_columns: &[String],
        variant: &ModelVariant,
    ) -> Result<ModelArtifact> {
        variant.learner.validate()?;

        let graded: Vec<&GameDesignRow> = train.iter().copied().filter(|r| r.is_graded()).collect();
        let through = graded
            .iter()
            .map(|r| r.week_key())
            .max()
            .unwrap_or(WeekKey::new(0, 0));
        let insufficient = |reason: String| ForecastError::InsufficientTrainingData {
            window: self.window,
            variant: variant.id.clone(),
            season: through.season,
            week: through.week,
            reason,
        };

        let needed = self.min_train_rows.max(variant.learner.min_rows());
        if graded.len() < needed {
            return Err(insufficient(format!(
                "{} graded rows, need {needed}",
                graded.len()
            )));
        }

        let fill = FillMap::from_train(&graded, feature_columns);
        let matrix = FeatureMatrix::from_rows(&graded, feature_columns, &fill);

        if variant.learner.requires_target_variance() {
            if is_constant(&matrix.margin) {
                return Err(insufficient("margin target is constant".to_string()));
            }
            if is_constant(&matrix.total) {
                return Err(insufficient("total target is constant".to_string()));
            }
        }

        let margin_model = variant.learner.fit(&matrix.x, &matrix.margin)?;
        let total_model = variant.learner.fit(&matrix.x, &matrix.total)?;
        let sigma_margin = margin_sigma(&matrix.margin);

        debug!(
            window = self.window,
            variant = %variant.id,
            rows = matrix.len(),
            features = feature_columns.len(),
            sigma_margin,
            through = %through,
            "fitted member"
        );

        Ok(ModelArtifact {
            window_size: self.window,
            variant_id: variant.id.clone(),
            stats: self.stats.clone(),
            feature_names: feature_columns.to_vec(),
            train_means: fill,
            margin_model,
            total_model,
            sigma_margin,
            train_through_week: through,
            train_rows: matrix.len(),
        })
    }
}

fn is_constant(values: &[f64]) -> bool {
    match values.first() {
        Some(first) => values.iter().all(|v| (v - first).abs() < 1e-12),
        None => true,
    }
}

/// Sample std (n-1) of the training margins, or the fallback when undefined.
pub fn margin_sigma(margins: &[f64]) -> f64 {
    let n = margins.len();
    if n < 2 {
        return SIGMA_MARGIN_FALLBACK;
    }
    let mean = margins.iter().sum::<f64>() / n as f64;
    let var = margins.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    let sigma = var.sqrt();
    if sigma.is_finite() && sigma > 0.0 {
        sigma
    } else {
        SIGMA_MARGIN_FALLBACK
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HoldoutReport {
    pub samples: usize,
    pub margin: RegressionMetrics,
    pub total: RegressionMetrics,
    pub win: WinMetrics,
    /// None when the holdout has no graded rows.
    pub margin_mae: Option<f64>,
}

pub fn evaluate_holdout(artifact: &ModelArtifact, holdout: &[&GameDesignRow]) -> HoldoutReport {
    let mut pred_margin = Vec::new();
    let mut pred_total = Vec::new();
    let mut act_margin = Vec::new();
    let mut act_total = Vec::new();
    let mut win_probs = Vec::new();
    let mut outcomes = Vec::new();

    for row in holdout {
        let (Some(m), Some(t)) = (row.margin_home, row.total_points) else {
            continue;
        };
        let (pm, pt) = artifact.predict_features(&row.features);
        pred_margin.push(pm);
        pred_total.push(pt);
        act_margin.push(m);
        act_total.push(t);
        win_probs.push(win_prob_from_margin(pm, artifact.sigma_margin));
        outcomes.push(classify_margin(m));
    }

    let margin = evaluate_regression(&pred_margin, &act_margin);
    HoldoutReport {
        samples: pred_margin.len(),
        margin,
        total: evaluate_regression(&pred_total, &act_total),
        win: evaluate_win_probs(&win_probs, &outcomes),
        margin_mae: (margin.samples > 0).then_some(margin.mae),
    }
}
