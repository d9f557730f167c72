//! Leakage-free rolling features per team-game.
//!
//! Every value on row `i` is computed from the same team's rows `< i` only. The
//! current game is folded into the running accumulators after its own row has
//! been emitted, which is the one-step lag the whole pipeline relies on.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};
use crate::team_game::{TeamGameRecord, WeekKey, ensure_ordered};

/// Recent-ratio value when the season baseline is missing or zero.
pub const NEUTRAL_RECENT_RATIO: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingFeatureRow {
    pub team: String,
    pub season: i32,
    pub week: u32,
    pub game_id: String,
    pub is_home: bool,
    pub values: BTreeMap<String, Option<f64>>,
}

impl RollingFeatureRow {
    fn skeleton(record: &TeamGameRecord) -> Self {
        Self {
            team: record.team.clone(),
            season: record.season,
            week: record.week,
            game_id: record.game_id.clone(),
            is_home: record.is_home,
            values: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied().flatten()
    }

    pub fn week_key(&self) -> WeekKey {
        WeekKey::new(self.season, self.week)
    }
}

/// Column names for one raw stat at one window length.
#[derive(Debug, Clone)]
pub struct FeatureNames {
    pub pre: String,
    pub ema: String,
    pub trend: String,
    pub vol: String,
    pub season_avg: String,
    pub recent_ratio: String,
}

impl FeatureNames {
    pub fn new(stat: &str, window: usize) -> Self {
        Self {
            pre: format!("{stat}_pre{window}"),
            ema: format!("{stat}_ema{window}"),
            trend: format!("{stat}_trend{window}"),
            vol: format!("{stat}_vol{window}"),
            season_avg: format!("{stat}_seasonAvg"),
            recent_ratio: format!("{stat}_recentRatio"),
        }
    }

    pub fn all(&self) -> [&str; 6] {
        [
            &self.pre,
            &self.ema,
            &self.trend,
            &self.vol,
            &self.season_avg,
            &self.recent_ratio,
        ]
    }
}

/// Every rolling column produced for `stats` at `window`, in a stable order.
pub fn feature_columns(stats: &[String], window: usize) -> Vec<String> {
    stats
        .iter()
        .flat_map(|s| {
            FeatureNames::new(s, window)
                .all()
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Union of raw stat names across all records, sorted.
pub fn stat_names(records: &[TeamGameRecord]) -> Vec<String> {
    records
        .iter()
        .flat_map(|r| r.raw_stats.keys().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn derive(records: &[TeamGameRecord], window: usize) -> Result<Vec<RollingFeatureRow>> {
    let stats = stat_names(records);
    derive_with_stats(records, window, &stats)
}

/// Same as [`derive`] but with an explicit stat list. Stats absent from the
/// records still produce (null) columns so the output schema is fixed.
pub fn derive_with_stats(
    records: &[TeamGameRecord],
    window: usize,
    stats: &[String],
) -> Result<Vec<RollingFeatureRow>> {
    if window == 0 {
        return Err(ForecastError::InvalidConfig(
            "rolling window must be at least 1".to_string(),
        ));
    }
    ensure_ordered(records)?;

    let mut out = Vec::with_capacity(records.len());
    let mut start = 0usize;
    while start < records.len() {
        let team = &records[start].team;
        let len = records[start..]
            .iter()
            .take_while(|r| &r.team == team)
            .count();
        out.extend(derive_team(&records[start..start + len], window, stats));
        start += len;
    }
    Ok(out)
}

fn derive_team(games: &[TeamGameRecord], window: usize, stats: &[String]) -> Vec<RollingFeatureRow> {
    let mut rows: Vec<RollingFeatureRow> = games.iter().map(RollingFeatureRow::skeleton).collect();
    let alpha = 2.0 / (window as f64 + 1.0);

    for stat in stats {
        let names = FeatureNames::new(stat, window);
        let series: Vec<Option<f64>> = games.iter().map(|g| g.stat(stat)).collect();

        let mut ema: Option<f64> = None;
        let mut season: Option<i32> = None;
        let mut season_sum = 0.0_f64;
        let mut season_n = 0usize;

        for (i, row) in rows.iter_mut().enumerate() {
            if season != Some(games[i].season) {
                season = Some(games[i].season);
                season_sum = 0.0;
                season_n = 0;
            }

            let lo = i.saturating_sub(window);
            let recent: Vec<f64> = series[lo..i].iter().flatten().copied().collect();
            let w = WindowStats::from_values(&recent);
            let season_avg = (season_n > 0).then(|| season_sum / season_n as f64);

            row.values.insert(names.pre.clone(), w.mean);
            row.values.insert(names.ema.clone(), ema);
            row.values.insert(names.trend.clone(), w.slope);
            row.values.insert(names.vol.clone(), w.coefficient_of_variation());
            row.values.insert(names.season_avg.clone(), season_avg);
            row.values
                .insert(names.recent_ratio.clone(), Some(recent_ratio(w.mean, season_avg)));

            if let Some(v) = series[i] {
                ema = Some(match ema {
                    Some(prev) => alpha * v + (1.0 - alpha) * prev,
                    None => v,
                });
                season_sum += v;
                season_n += 1;
            }
        }
    }

    rows
}

fn recent_ratio(trailing_mean: Option<f64>, season_avg: Option<f64>) -> f64 {
    match (trailing_mean, season_avg) {
        (Some(m), Some(s)) if s != 0.0 => m / s,
        _ => NEUTRAL_RECENT_RATIO,
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct WindowStats {
    mean: Option<f64>,
    std: Option<f64>,
    slope: Option<f64>,
}

impl WindowStats {
    fn from_values(values: &[f64]) -> Self {
        let k = values.len();
        if k == 0 {
            return Self::default();
        }
        let n = k as f64;
        let mean = values.iter().sum::<f64>() / n;
        if k < 2 {
            return Self {
                mean: Some(mean),
                ..Self::default()
            };
        }

        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);

        // x = 1..k, so x_bar = (k + 1) / 2.
        let x_bar = (n + 1.0) / 2.0;
        let mut sxy = 0.0;
        let mut sxx = 0.0;
        for (idx, y) in values.iter().enumerate() {
            let dx = (idx + 1) as f64 - x_bar;
            sxy += dx * (y - mean);
            sxx += dx * dx;
        }

        Self {
            mean: Some(mean),
            std: Some(var.sqrt()),
            slope: Some(sxy / sxx),
        }
    }

    fn coefficient_of_variation(&self) -> Option<f64> {
        match (self.std, self.mean) {
            (Some(s), Some(m)) if m != 0.0 => Some(s / m),
            _ => None,
        }
    }
}
