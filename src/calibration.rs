use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Home,
    Tie,
    Away,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub samples: usize,
    pub mae: f64,
    pub rmse: f64,
    // Mean of prediction minus actual.
    pub bias: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WinMetrics {
    pub samples: usize,
    pub brier: f64,
    pub log_loss: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBin {
    pub bucket_start: f64,
    pub bucket_end: f64,
    pub count: usize,
    pub avg_pred: f64,
    pub actual_rate: f64,
}

pub fn classify_margin(margin_home: f64) -> Outcome {
    if margin_home > 0.0 {
        Outcome::Home
    } else if margin_home < 0.0 {
        Outcome::Away
    } else {
        Outcome::Tie
    }
}

fn home_target(outcome: Outcome) -> f64 {
    match outcome {
        Outcome::Home => 1.0,
        Outcome::Tie => 0.5,
        Outcome::Away => 0.0,
    }
}

pub fn evaluate_regression(predictions: &[f64], actuals: &[f64]) -> RegressionMetrics {
    if predictions.is_empty() || predictions.len() != actuals.len() {
        return RegressionMetrics::default();
    }

    let mut abs_sum = 0.0_f64;
    let mut sq_sum = 0.0_f64;
    let mut bias_sum = 0.0_f64;
    for (p, a) in predictions.iter().zip(actuals) {
        let e = p - a;
        abs_sum += e.abs();
        sq_sum += e * e;
        bias_sum += e;
    }

    let n = predictions.len() as f64;
    RegressionMetrics {
        samples: predictions.len(),
        mae: abs_sum / n,
        rmse: (sq_sum / n).sqrt(),
        bias: bias_sum / n,
    }
}

/// Ties score as a half win in Brier and log loss and are left out of accuracy.
pub fn evaluate_win_probs(home_probs: &[f64], outcomes: &[Outcome]) -> WinMetrics {
    if home_probs.is_empty() || home_probs.len() != outcomes.len() {
        return WinMetrics::default();
    }

    let mut brier_sum = 0.0_f64;
    let mut log_loss_sum = 0.0_f64;
    let mut correct = 0usize;
    let mut decided = 0usize;

    for (p, outcome) in home_probs.iter().zip(outcomes) {
        let p = p.clamp(1e-12, 1.0 - 1e-12);
        let y = home_target(*outcome);
        brier_sum += (p - y).powi(2);
        log_loss_sum += -(y * p.ln() + (1.0 - y) * (1.0 - p).ln());

        if *outcome != Outcome::Tie {
            decided += 1;
            if (p >= 0.5) == (*outcome == Outcome::Home) {
                correct += 1;
            }
        }
    }

    let n = home_probs.len() as f64;
    WinMetrics {
        samples: home_probs.len(),
        brier: brier_sum / n,
        log_loss: log_loss_sum / n,
        accuracy: if decided > 0 {
            correct as f64 / decided as f64
        } else {
            0.0
        },
    }
}

pub fn calibration_bins(home_probs: &[f64], outcomes: &[Outcome], bins: usize) -> Vec<CalibrationBin> {
    let bins = bins.max(2);
    let mut counts = vec![0usize; bins];
    let mut pred_sum = vec![0.0_f64; bins];
    let mut actual_sum = vec![0.0_f64; bins];

    for (p, outcome) in home_probs.iter().zip(outcomes) {
        let p = p.clamp(0.0, 1.0);
        let idx = ((p * bins as f64).floor() as usize).min(bins - 1);
        counts[idx] += 1;
        pred_sum[idx] += p;
        actual_sum[idx] += home_target(*outcome);
    }

    let mut out = Vec::with_capacity(bins);
    for i in 0..bins {
        let count = counts[i];
        let (avg_pred, actual_rate) = if count > 0 {
            (pred_sum[i] / count as f64, actual_sum[i] / count as f64)
        } else {
            (0.0, 0.0)
        };
        out.push(CalibrationBin {
            bucket_start: i as f64 / bins as f64,
            bucket_end: (i + 1) as f64 / bins as f64,
            count,
            avg_pred,
            actual_rate,
        });
    }
    out
}

pub fn expected_calibration_error(home_probs: &[f64], outcomes: &[Outcome], bins: usize) -> f64 {
    if home_probs.is_empty() || home_probs.len() != outcomes.len() {
        return 0.0;
    }
    let n = home_probs.len() as f64;
    calibration_bins(home_probs, outcomes, bins)
        .iter()
        .filter(|b| b.count > 0)
        .map(|b| (b.count as f64 / n) * (b.avg_pred - b.actual_rate).abs())
        .sum()
}
