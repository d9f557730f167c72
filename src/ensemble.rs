//! Merges per-member predictions into one forecast with a spread band.

use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};
use crate::win_prob::win_prob_from_margin;

pub const Z_95: f64 = 1.96;
const MAE_FLOOR: f64 = 1e-6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineMode {
    #[default]
    InverseMae,
    Mean,
}

impl CombineMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "inverse_mae" | "inv_mae" | "weighted" => Some(Self::InverseMae),
            "mean" | "uniform" => Some(Self::Mean),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleMember {
    pub window_size: usize,
    pub variant_id: String,
    pub predicted_margin_home: f64,
    pub predicted_total: f64,
    pub holdout_mae: Option<f64>,
    pub sigma_margin: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsemblePrediction {
    pub game_id: String,
    pub predicted_margin_home: f64,
    pub predicted_total: f64,
    pub margin_std_dev: f64,
    pub total_std_dev: f64,
    pub margin_95ci: (f64, f64),
    pub total_95ci: (f64, f64),
    pub win_prob_home: f64,
    pub member_count: usize,
    pub ensemble_sigma: f64,
    pub weights: Vec<f64>,
}

/// Normalized member weights. Inverse-MAE needs a finite MAE on every member;
/// anything less falls back to uniform.
pub fn member_weights(members: &[EnsembleMember], mode: CombineMode) -> Vec<f64> {
    let n = members.len();
    if n == 0 {
        return Vec::new();
    }
    let uniform = vec![1.0 / n as f64; n];
    if mode == CombineMode::Mean {
        return uniform;
    }

    let maes: Option<Vec<f64>> = members
        .iter()
        .map(|m| m.holdout_mae.filter(|v| v.is_finite() && *v >= 0.0))
        .collect();
    let Some(maes) = maes else {
        return uniform;
    };

    let inv: Vec<f64> = maes.iter().map(|m| 1.0 / m.max(MAE_FLOOR)).collect();
    let total: f64 = inv.iter().sum();
    if !(total.is_finite() && total > 0.0) {
        return uniform;
    }
    inv.into_iter().map(|w| w / total).collect()
}

pub fn combine(game_id: &str, members: &[EnsembleMember], mode: CombineMode) -> Result<EnsemblePrediction> {
    if members.is_empty() {
        return Err(ForecastError::NoSurvivingMembers {
            game_id: game_id.to_string(),
        });
    }

    let weights = member_weights(members, mode);
    let margins: Vec<f64> = members.iter().map(|m| m.predicted_margin_home).collect();
    let totals: Vec<f64> = members.iter().map(|m| m.predicted_total).collect();

    let margin = weighted_sum(&weights, &margins);
    let total = weighted_sum(&weights, &totals);
    let sigma = weighted_sum(
        &weights,
        &members.iter().map(|m| m.sigma_margin).collect::<Vec<_>>(),
    );

    let margin_sd = sample_std(&margins);
    let total_sd = sample_std(&totals);

    Ok(EnsemblePrediction {
        game_id: game_id.to_string(),
        predicted_margin_home: margin,
        predicted_total: total,
        margin_std_dev: margin_sd,
        total_std_dev: total_sd,
        margin_95ci: (margin - Z_95 * margin_sd, margin + Z_95 * margin_sd),
        total_95ci: (total - Z_95 * total_sd, total + Z_95 * total_sd),
        win_prob_home: win_prob_from_margin(margin, sigma),
        member_count: members.len(),
        ensemble_sigma: sigma,
        weights,
    })
}

fn weighted_sum(weights: &[f64], values: &[f64]) -> f64 {
    weights.iter().zip(values).map(|(w, v)| w * v).sum()
}

// Unweighted, n-1. Zero for a single member.
fn sample_std(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    var.sqrt()
}

/// Output row for one forecast game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub game_id: String,
    pub predicted_margin_home: f64,
    pub predicted_spread_away: f64,
    pub predicted_total: f64,
    pub win_prob_home: f64,
    pub win_prob_away: f64,
    pub margin_95ci: (f64, f64),
    pub total_95ci: (f64, f64),
    pub member_count: usize,
    pub ensemble_sigma: f64,
}

impl PredictionRecord {
    pub fn from_ensemble(p: &EnsemblePrediction) -> Self {
        Self {
            game_id: p.game_id.clone(),
            predicted_margin_home: p.predicted_margin_home,
            predicted_spread_away: -p.predicted_margin_home,
            predicted_total: p.predicted_total,
            win_prob_home: p.win_prob_home,
            win_prob_away: 1.0 - p.win_prob_home,
            margin_95ci: p.margin_95ci,
            total_95ci: p.total_95ci,
            member_count: p.member_count,
            ensemble_sigma: p.ensemble_sigma,
        }
    }
}
