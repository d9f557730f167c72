use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};

/// One team's box score for one game, as supplied by the team-game store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamGameRecord {
    pub team: String,
    pub season: i32,
    pub week: u32,
    pub game_id: String,
    pub is_home: bool,
    #[serde(default)]
    pub raw_stats: BTreeMap<String, f64>,
}

impl TeamGameRecord {
    pub fn new(team: &str, season: i32, week: u32, game_id: &str, is_home: bool) -> Self {
        Self {
            team: team.to_string(),
            season,
            week,
            game_id: game_id.to_string(),
            is_home,
            raw_stats: BTreeMap::new(),
        }
    }

    pub fn with_stat(mut self, name: &str, value: f64) -> Self {
        self.raw_stats.insert(name.to_string(), value);
        self
    }

    /// Non-finite values are treated the same as a missing column.
    pub fn stat(&self, name: &str) -> Option<f64> {
        self.raw_stats.get(name).copied().filter(|v| v.is_finite())
    }

    pub fn week_key(&self) -> WeekKey {
        WeekKey::new(self.season, self.week)
    }

    fn order_cmp(&self, other: &Self) -> Ordering {
        self.team
            .cmp(&other.team)
            .then(self.season.cmp(&other.season))
            .then(self.week.cmp(&other.week))
            .then(self.game_id.cmp(&other.game_id))
    }

    fn unordered_error(&self) -> ForecastError {
        ForecastError::UnorderedInput {
            team: self.team.clone(),
            season: self.season,
            week: self.week,
            game_id: self.game_id.clone(),
        }
    }
}

/// A (season, week) position on the schedule, ordered chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WeekKey {
    pub season: i32,
    pub week: u32,
}

impl WeekKey {
    pub fn new(season: i32, week: u32) -> Self {
        Self { season, week }
    }

    /// Parses `2023:14` (or `2023-14`).
    pub fn parse(raw: &str) -> Option<Self> {
        let (season, week) = raw.trim().split_once([':', '-'])?;
        Some(Self {
            season: season.trim().parse().ok()?,
            week: week.trim().parse().ok()?,
        })
    }
}

impl std::fmt::Display for WeekKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.season, self.week)
    }
}

/// Closing and opening lines for one game. American odds: negative = favorite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketOdds {
    pub game_id: String,
    pub close_spread_home: Option<f64>,
    pub close_total: Option<f64>,
    pub open_spread_home: Option<f64>,
    pub open_total: Option<f64>,
    pub close_moneyline_home: Option<f64>,
    pub close_moneyline_away: Option<f64>,
}

/// Schedule entry plus final score. Null scores mark a game not yet played.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameOutcome {
    pub game_id: String,
    pub season: i32,
    pub week: u32,
    pub home_team: String,
    pub away_team: String,
    #[serde(default)]
    pub neutral_site: bool,
    pub home_score: Option<f64>,
    pub away_score: Option<f64>,
}

impl GameOutcome {
    pub fn week_key(&self) -> WeekKey {
        WeekKey::new(self.season, self.week)
    }

    pub fn is_graded(&self) -> bool {
        self.margin_home().is_some()
    }

    pub fn margin_home(&self) -> Option<f64> {
        match (self.home_score, self.away_score) {
            (Some(h), Some(a)) if h.is_finite() && a.is_finite() => Some(h - a),
            _ => None,
        }
    }

    pub fn total_points(&self) -> Option<f64> {
        match (self.home_score, self.away_score) {
            (Some(h), Some(a)) if h.is_finite() && a.is_finite() => Some(h + a),
            _ => None,
        }
    }
}

/// Fails on the first row that does not strictly follow its predecessor in
/// (team, season, week, game_id) order. A repeated key counts as out of order.
pub fn ensure_ordered(records: &[TeamGameRecord]) -> Result<()> {
    for pair in records.windows(2) {
        if pair[0].order_cmp(&pair[1]) != Ordering::Less {
            return Err(pair[1].unordered_error());
        }
    }
    Ok(())
}

pub fn sort_records(records: &mut [TeamGameRecord]) {
    records.sort_by(|a, b| a.order_cmp(b));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_rows_pass() {
        let rows = vec![
            TeamGameRecord::new("BUF", 2023, 1, "g1", true),
            TeamGameRecord::new("BUF", 2023, 2, "g2", false),
            TeamGameRecord::new("MIA", 2023, 1, "g1", false),
        ];
        assert!(ensure_ordered(&rows).is_ok());
    }

    #[test]
    fn week_regression_names_offending_row() {
        let rows = vec![
            TeamGameRecord::new("BUF", 2023, 3, "g3", true),
            TeamGameRecord::new("BUF", 2023, 2, "g2", false),
        ];
        let err = ensure_ordered(&rows).unwrap_err();
        assert_eq!(
            err,
            ForecastError::UnorderedInput {
                team: "BUF".to_string(),
                season: 2023,
                week: 2,
                game_id: "g2".to_string(),
            }
        );
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let rows = vec![
            TeamGameRecord::new("BUF", 2023, 2, "g2", true),
            TeamGameRecord::new("BUF", 2023, 2, "g2", true),
        ];
        assert!(ensure_ordered(&rows).is_err());
    }

    #[test]
    fn week_key_parses_both_separators() {
        assert_eq!(WeekKey::parse("2023:14"), Some(WeekKey::new(2023, 14)));
        assert_eq!(WeekKey::parse(" 2022-3 "), Some(WeekKey::new(2022, 3)));
        assert!(WeekKey::parse("2023").is_none());
        assert!(WeekKey::new(2022, 18) < WeekKey::new(2023, 1));
    }

    #[test]
    fn ungraded_outcome_has_no_margin() {
        let g = GameOutcome {
            game_id: "g".to_string(),
            season: 2023,
            week: 5,
            home_team: "KC".to_string(),
            away_team: "DEN".to_string(),
            neutral_site: false,
            home_score: Some(24.0),
            away_score: None,
        };
        assert!(!g.is_graded());
        assert!(g.total_points().is_none());
    }
}
