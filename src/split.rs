use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::design_matrix::GameDesignRow;
use crate::team_game::WeekKey;

/// Train / holdout partition by schedule position. Ungraded rows go to
/// `pending` so they stay available for prediction.
#[derive(Debug, Clone)]
pub struct Split<'a> {
    pub cutoff: WeekKey,
    pub train: Vec<&'a GameDesignRow>,
    pub holdout: Vec<&'a GameDesignRow>,
    pub pending: Vec<&'a GameDesignRow>,
}

pub fn split(rows: &[GameDesignRow], cutoff: WeekKey) -> Split<'_> {
    let mut train = Vec::new();
    let mut holdout = Vec::new();
    let mut pending = Vec::new();
    for row in rows {
        if !row.is_graded() {
            pending.push(row);
        } else if row.week_key() <= cutoff {
            train.push(row);
        } else {
            holdout.push(row);
        }
    }
    Split {
        cutoff,
        train,
        holdout,
        pending,
    }
}

/// Latest graded week in `rows`; the train-through point of a full refit.
pub fn latest_graded_week(rows: &[GameDesignRow]) -> Option<WeekKey> {
    rows.iter()
        .filter(|r| r.is_graded())
        .map(GameDesignRow::week_key)
        .max()
}

/// Cutoff that leaves the last `weeks` distinct graded weeks as holdout.
/// None when there are not enough graded weeks to keep any for training.
pub fn trailing_cutoff(rows: &[GameDesignRow], weeks: usize) -> Option<WeekKey> {
    let mut keys: Vec<WeekKey> = rows
        .iter()
        .filter(|r| r.is_graded())
        .map(GameDesignRow::week_key)
        .collect();
    keys.sort();
    keys.dedup();
    let keep = keys.len().checked_sub(weeks)?;
    keep.checked_sub(1).map(|idx| keys[idx])
}

/// Per-column means over train rows only. Columns never observed in train
/// fill with 0.0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FillMap {
    pub means: BTreeMap<String, f64>,
}

impl FillMap {
    pub fn from_train(train: &[&GameDesignRow], columns: &[String]) -> Self {
        let mut means = BTreeMap::new();
        for col in columns {
            let mut sum = 0.0;
            let mut n = 0usize;
            for row in train {
                if let Some(v) = row.feature(col).filter(|v| v.is_finite()) {
                    sum += v;
                    n += 1;
                }
            }
            let mean = if n > 0 { sum / n as f64 } else { 0.0 };
            means.insert(col.clone(), mean);
        }
        Self { means }
    }

    pub fn fill_value(&self, column: &str) -> f64 {
        self.means.get(column).copied().unwrap_or(0.0)
    }

    /// Dense feature vector in `columns` order with nulls replaced.
    pub fn apply(&self, features: &BTreeMap<String, Option<f64>>, columns: &[String]) -> Vec<f64> {
        columns
            .iter()
            .map(|c| {
                features
                    .get(c)
                    .copied()
                    .flatten()
                    .filter(|v| v.is_finite())
                    .unwrap_or_else(|| self.fill_value(c))
            })
            .collect()
    }
}

/// Dense, null-free training matrix with both targets.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    pub x: Vec<Vec<f64>>,
    pub margin: Vec<f64>,
    pub total: Vec<f64>,
}

impl FeatureMatrix {
    /// Ungraded rows are skipped.
    pub fn from_rows(rows: &[&GameDesignRow], columns: &[String], fill: &FillMap) -> Self {
        let mut x = Vec::with_capacity(rows.len());
        let mut margin = Vec::with_capacity(rows.len());
        let mut total = Vec::with_capacity(rows.len());
        for row in rows {
            let (Some(m), Some(t)) = (row.margin_home, row.total_points) else {
                continue;
            };
            x.push(fill.apply(&row.features, columns));
            margin.push(m);
            total.push(t);
        }
        Self { x, margin, total }
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, week: u32, x: Option<f64>, margin: Option<f64>) -> GameDesignRow {
        let mut features = BTreeMap::new();
        features.insert("delta_x".to_string(), x);
        GameDesignRow {
            game_id: id.to_string(),
            season: 2023,
            week,
            home_team: "H".to_string(),
            away_team: "A".to_string(),
            features,
            margin_home: margin,
            total_points: margin.map(|m| m.abs() + 40.0),
        }
    }

    #[test]
    fn split_is_by_week_and_keeps_pending() {
        let rows = vec![
            row("a", 1, Some(1.0), Some(3.0)),
            row("b", 2, Some(2.0), Some(-7.0)),
            row("c", 3, Some(3.0), Some(10.0)),
            row("d", 4, None, None),
        ];
        let s = split(&rows, WeekKey::new(2023, 2));
        let ids = |v: &[&GameDesignRow]| v.iter().map(|r| r.game_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(s.train.as_slice()), vec!["a", "b"]);
        assert_eq!(ids(s.holdout.as_slice()), vec!["c"]);
        assert_eq!(ids(s.pending.as_slice()), vec!["d"]);
        assert_eq!(latest_graded_week(&rows), Some(WeekKey::new(2023, 3)));
    }

    #[test]
    fn trailing_cutoff_counts_distinct_graded_weeks() {
        let rows = vec![
            row("a", 1, Some(1.0), Some(3.0)),
            row("b", 2, Some(2.0), Some(-7.0)),
            row("b2", 2, Some(2.0), Some(1.0)),
            row("c", 3, Some(3.0), Some(10.0)),
            row("d", 4, None, None),
        ];
        assert_eq!(trailing_cutoff(&rows, 1), Some(WeekKey::new(2023, 2)));
        assert_eq!(trailing_cutoff(&rows, 2), Some(WeekKey::new(2023, 1)));
        assert_eq!(trailing_cutoff(&rows, 3), None);
        assert_eq!(trailing_cutoff(&rows, 9), None);
    }

    #[test]
    fn fill_means_ignore_holdout() {
        let rows = vec![
            row("a", 1, Some(2.0), Some(3.0)),
            row("b", 2, None, Some(-7.0)),
            row("c", 3, Some(100.0), Some(10.0)),
        ];
        let cols = vec!["delta_x".to_string()];
        let s = split(&rows, WeekKey::new(2023, 2));
        let fill = FillMap::from_train(&s.train, &cols);
        assert_eq!(fill.fill_value("delta_x"), 2.0);

        let m = FeatureMatrix::from_rows(&s.train, &cols, &fill);
        assert_eq!(m.x, vec![vec![2.0], vec![2.0]]);
        assert_eq!(m.margin, vec![3.0, -7.0]);
    }

    #[test]
    fn unseen_column_fills_with_zero() {
        let rows = vec![row("a", 1, None, Some(3.0))];
        let cols = vec!["delta_x".to_string()];
        let s = split(&rows, WeekKey::new(2023, 1));
        let fill = FillMap::from_train(&s.train, &cols);
        assert_eq!(fill.fill_value("delta_x"), 0.0);
        assert_eq!(fill.fill_value("never_seen"), 0.0);
    }
}
