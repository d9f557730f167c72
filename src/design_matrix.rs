//! One supervised row per game: home-minus-away rolling deltas, the
//! neutral-site flag and market features, aligned to the final score.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ForecastError, Result};
use crate::market::{MARKET_COLUMNS, MarketFeatures};
use crate::rolling::RollingFeatureRow;
use crate::team_game::{GameOutcome, MarketOdds, WeekKey};

pub const NEUTRAL_SITE: &str = "neutralSite";
pub const DELTA_PREFIX: &str = "delta_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameDesignRow {
    pub game_id: String,
    pub season: i32,
    pub week: u32,
    pub home_team: String,
    pub away_team: String,
    pub features: BTreeMap<String, Option<f64>>,
    pub margin_home: Option<f64>,
    pub total_points: Option<f64>,
}

impl GameDesignRow {
    pub fn week_key(&self) -> WeekKey {
        WeekKey::new(self.season, self.week)
    }

    pub fn is_graded(&self) -> bool {
        self.margin_home.is_some() && self.total_points.is_some()
    }

    pub fn feature(&self, name: &str) -> Option<f64> {
        self.features.get(name).copied().flatten()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingSide {
    Home,
    Away,
    Both,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DroppedGame {
    pub game_id: String,
    pub season: i32,
    pub week: u32,
    pub missing: MissingSide,
}

#[derive(Debug, Clone)]
pub struct DesignMatrix {
    pub rows: Vec<GameDesignRow>,
    pub feature_columns: Vec<String>,
    pub dropped: Vec<DroppedGame>,
}

impl DesignMatrix {
    pub fn row(&self, game_id: &str) -> Option<&GameDesignRow> {
        self.rows.iter().find(|r| r.game_id == game_id)
    }
}

pub fn delta_name(feature: &str) -> String {
    format!("{DELTA_PREFIX}{feature}")
}

/// Design columns for a set of rolling columns, in model order.
pub fn design_columns(rolling_columns: &[String]) -> Vec<String> {
    let mut out: Vec<String> = rolling_columns.iter().map(|c| delta_name(c)).collect();
    out.push(NEUTRAL_SITE.to_string());
    out.extend(MARKET_COLUMNS.iter().map(|c| c.to_string()));
    out
}

/// Feature map for one matchup. Shared by training and single-game prediction
/// so both paths produce identical columns.
pub fn game_features(
    rolling_columns: &[String],
    home: &BTreeMap<String, Option<f64>>,
    away: &BTreeMap<String, Option<f64>>,
    neutral_site: bool,
    market: Option<&MarketFeatures>,
) -> BTreeMap<String, Option<f64>> {
    let mut out = BTreeMap::new();
    for col in rolling_columns {
        let h = home.get(col).copied().flatten();
        let a = away.get(col).copied().flatten();
        let delta = match (h, a) {
            (Some(h), Some(a)) => Some(h - a),
            _ => None,
        };
        out.insert(delta_name(col), delta);
    }
    out.insert(
        NEUTRAL_SITE.to_string(),
        Some(if neutral_site { 1.0 } else { 0.0 }),
    );
    let market = market.copied().unwrap_or_default();
    for (name, value) in market.columns() {
        out.insert(name.to_string(), value);
    }
    out
}

pub fn build(
    rolling: &[RollingFeatureRow],
    outcomes: &[GameOutcome],
    odds: &[MarketOdds],
) -> Result<DesignMatrix> {
    let rolling_columns: Vec<String> = rolling
        .iter()
        .flat_map(|r| r.values.keys().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut home_side: HashMap<&str, &RollingFeatureRow> = HashMap::new();
    let mut away_side: HashMap<&str, &RollingFeatureRow> = HashMap::new();
    for row in rolling {
        let side = if row.is_home {
            &mut home_side
        } else {
            &mut away_side
        };
        if side.insert(row.game_id.as_str(), row).is_some() {
            return Err(ForecastError::JoinMismatch {
                game_id: row.game_id.clone(),
                reason: format!(
                    "more than one {} team-game row",
                    if row.is_home { "home" } else { "away" }
                ),
            });
        }
    }

    let mut market_by_game: HashMap<&str, MarketFeatures> = HashMap::new();
    for o in odds {
        if market_by_game
            .insert(o.game_id.as_str(), MarketFeatures::from_odds(o))
            .is_some()
        {
            return Err(ForecastError::JoinMismatch {
                game_id: o.game_id.clone(),
                reason: "duplicate market odds row".to_string(),
            });
        }
    }

    let mut schedule: Vec<&GameOutcome> = outcomes.iter().collect();
    schedule.sort_by(|a, b| {
        a.week_key()
            .cmp(&b.week_key())
            .then(a.game_id.cmp(&b.game_id))
    });

    let mut seen: HashSet<&str> = HashSet::with_capacity(schedule.len());
    let mut rows = Vec::with_capacity(schedule.len());
    let mut dropped = Vec::new();

    for game in schedule {
        if !seen.insert(game.game_id.as_str()) {
            return Err(ForecastError::JoinMismatch {
                game_id: game.game_id.clone(),
                reason: "duplicate outcome row".to_string(),
            });
        }

        let home = home_side.get(game.game_id.as_str()).copied();
        let away = away_side.get(game.game_id.as_str()).copied();
        let (home, away) = match (home, away) {
            (Some(h), Some(a)) => (h, a),
            (h, a) => {
                let missing = match (h, a) {
                    (None, Some(_)) => MissingSide::Home,
                    (Some(_), None) => MissingSide::Away,
                    _ => MissingSide::Both,
                };
                warn!(
                    game_id = %game.game_id,
                    season = game.season,
                    week = game.week,
                    missing = ?missing,
                    "dropping game without rolling features for both sides"
                );
                dropped.push(DroppedGame {
                    game_id: game.game_id.clone(),
                    season: game.season,
                    week: game.week,
                    missing,
                });
                continue;
            }
        };

        check_side(game, home, &game.home_team)?;
        check_side(game, away, &game.away_team)?;

        let features = game_features(
            &rolling_columns,
            &home.values,
            &away.values,
            game.neutral_site,
            market_by_game.get(game.game_id.as_str()),
        );

        rows.push(GameDesignRow {
            game_id: game.game_id.clone(),
            season: game.season,
            week: game.week,
            home_team: game.home_team.clone(),
            away_team: game.away_team.clone(),
            features,
            margin_home: game.margin_home(),
            total_points: game.total_points(),
        });
    }

    let orphaned = home_side
        .keys()
        .chain(away_side.keys())
        .filter(|id| !seen.contains(*id))
        .count();
    if orphaned > 0 {
        debug!(orphaned, "team-game rows without a scheduled game were ignored");
    }

    Ok(DesignMatrix {
        rows,
        feature_columns: design_columns(&rolling_columns),
        dropped,
    })
}

fn check_side(game: &GameOutcome, row: &RollingFeatureRow, expected_team: &str) -> Result<()> {
    if row.team != expected_team {
        return Err(ForecastError::JoinMismatch {
            game_id: game.game_id.clone(),
            reason: format!(
                "team-game row for {} but schedule lists {}",
                row.team, expected_team
            ),
        });
    }
    if row.week_key() != game.week_key() {
        return Err(ForecastError::JoinMismatch {
            game_id: game.game_id.clone(),
            reason: format!(
                "team-game row dated {} but schedule lists {}",
                row.week_key(),
                game.week_key()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rolling;
    use crate::team_game::TeamGameRecord;

    fn outcome(id: &str, week: u32, home: &str, away: &str, score: Option<(f64, f64)>) -> GameOutcome {
        GameOutcome {
            game_id: id.to_string(),
            season: 2023,
            week,
            home_team: home.to_string(),
            away_team: away.to_string(),
            neutral_site: false,
            home_score: score.map(|s| s.0),
            away_score: score.map(|s| s.1),
        }
    }

    fn two_games() -> (Vec<TeamGameRecord>, Vec<GameOutcome>) {
        let records = vec![
            TeamGameRecord::new("DAL", 2023, 1, "g1", true).with_stat("pointsFor", 20.0),
            TeamGameRecord::new("DAL", 2023, 2, "g2", false).with_stat("pointsFor", 30.0),
            TeamGameRecord::new("NYG", 2023, 1, "g1", false).with_stat("pointsFor", 10.0),
            TeamGameRecord::new("NYG", 2023, 2, "g2", true).with_stat("pointsFor", 14.0),
        ];
        let outcomes = vec![
            outcome("g1", 1, "DAL", "NYG", Some((20.0, 10.0))),
            outcome("g2", 2, "NYG", "DAL", None),
        ];
        (records, outcomes)
    }

    #[test]
    fn deltas_are_home_minus_away() {
        let (records, outcomes) = two_games();
        let rolled = rolling::derive(&records, 3).unwrap();
        let dm = build(&rolled, &outcomes, &[]).unwrap();
        assert_eq!(dm.rows.len(), 2);

        let g2 = dm.row("g2").unwrap();
        // NYG home prior 10, DAL away prior 20
        assert_eq!(g2.feature("delta_pointsFor_pre3"), Some(-10.0));
        assert_eq!(g2.feature(NEUTRAL_SITE), Some(0.0));
        assert_eq!(g2.margin_home, None);

        let g1 = dm.row("g1").unwrap();
        assert_eq!(g1.feature("delta_pointsFor_pre3"), None);
        assert_eq!(g1.margin_home, Some(10.0));
        assert_eq!(g1.total_points, Some(30.0));
    }

    #[test]
    fn game_missing_a_side_is_dropped_and_reported() {
        let (mut records, outcomes) = two_games();
        records.retain(|r| !(r.team == "NYG" && r.game_id == "g2"));
        let rolled = rolling::derive(&records, 3).unwrap();
        let dm = build(&rolled, &outcomes, &[]).unwrap();
        assert_eq!(dm.rows.len(), 1);
        assert_eq!(dm.dropped.len(), 1);
        assert_eq!(dm.dropped[0].missing, MissingSide::Home);
    }

    #[test]
    fn market_is_left_joined() {
        let (records, outcomes) = two_games();
        let rolled = rolling::derive(&records, 3).unwrap();
        let odds = vec![MarketOdds {
            game_id: "g1".to_string(),
            close_spread_home: Some(-6.5),
            close_total: Some(44.0),
            open_spread_home: Some(-5.5),
            open_total: Some(45.0),
            close_moneyline_home: Some(-150.0),
            close_moneyline_away: Some(130.0),
        }];
        let dm = build(&rolled, &outcomes, &odds).unwrap();
        let g1 = dm.row("g1").unwrap();
        assert_eq!(g1.feature("spreadMove"), Some(-1.0));
        assert_eq!(g1.feature("totalMove"), Some(-1.0));
        assert!(g1.feature("impliedHomeWinProbNoVig").unwrap() > 0.5);
        let g2 = dm.row("g2").unwrap();
        assert_eq!(g2.feature("closeSpreadHome"), None);
        assert!(g2.features.contains_key("closeSpreadHome"));
    }

    #[test]
    fn team_mismatch_raises() {
        let (records, mut outcomes) = two_games();
        outcomes[0].home_team = "PHI".to_string();
        let rolled = rolling::derive(&records, 3).unwrap();
        assert!(matches!(
            build(&rolled, &outcomes, &[]),
            Err(ForecastError::JoinMismatch { .. })
        ));
    }

    #[test]
    fn duplicate_odds_raise() {
        let (records, outcomes) = two_games();
        let rolled = rolling::derive(&records, 3).unwrap();
        let odds = vec![
            MarketOdds {
                game_id: "g1".to_string(),
                ..Default::default()
            },
            MarketOdds {
                game_id: "g1".to_string(),
                ..Default::default()
            },
        ];
        assert!(build(&rolled, &outcomes, &odds).is_err());
    }

    #[test]
    fn columns_cover_every_feature_key() {
        let (records, outcomes) = two_games();
        let rolled = rolling::derive(&records, 3).unwrap();
        let dm = build(&rolled, &outcomes, &[]).unwrap();
        for row in &dm.rows {
            let mut keys: Vec<&String> = row.features.keys().collect();
            let mut cols: Vec<&String> = dm.feature_columns.iter().collect();
            keys.sort();
            cols.sort();
            assert_eq!(keys, cols);
        }
    }
}
