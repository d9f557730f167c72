use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::design_matrix::game_features;
use crate::error::{ForecastError, Result};
use crate::market::MarketFeatures;
use crate::rolling;
use crate::team_game::{GameOutcome, MarketOdds, TeamGameRecord, WeekKey, sort_records};
use crate::trainer::ModelArtifact;
use crate::win_prob::win_prob_from_margin;

/// An upcoming (or replayed) game to forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matchup {
    pub game_id: String,
    pub season: i32,
    pub week: u32,
    pub home_team: String,
    pub away_team: String,
    #[serde(default)]
    pub neutral_site: bool,
}

impl Matchup {
    pub fn from_outcome(game: &GameOutcome) -> Self {
        Self {
            game_id: game.game_id.clone(),
            season: game.season,
            week: game.week,
            home_team: game.home_team.clone(),
            away_team: game.away_team.clone(),
            neutral_site: game.neutral_site,
        }
    }

    pub fn week_key(&self) -> WeekKey {
        WeekKey::new(self.season, self.week)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GamePrediction {
    pub game_id: String,
    pub predicted_margin_home: f64,
    pub predicted_spread_away: f64,
    pub predicted_total: f64,
    pub win_prob_home: f64,
    pub win_prob_away: f64,
    pub sigma_margin: f64,
}

/// Scores one matchup with one member. Histories may contain rows of any team
/// or week; only the named team's rows strictly before the game are used.
pub fn predict(
    artifact: &ModelArtifact,
    matchup: &Matchup,
    home_history: &[TeamGameRecord],
    away_history: &[TeamGameRecord],
    market: Option<&MarketOdds>,
) -> Result<GamePrediction> {
    let home = pregame_features(artifact, matchup, &matchup.home_team, true, home_history)?;
    let away = pregame_features(artifact, matchup, &matchup.away_team, false, away_history)?;

    let market = market
        .filter(|m| m.game_id == matchup.game_id)
        .map(MarketFeatures::from_odds);
    let features = game_features(
        &artifact.rolling_columns(),
        &home,
        &away,
        matchup.neutral_site,
        market.as_ref(),
    );

    let (margin, total) = artifact.predict_features(&features);
    let p_home = win_prob_from_margin(margin, artifact.sigma_margin);
    Ok(GamePrediction {
        game_id: matchup.game_id.clone(),
        predicted_margin_home: margin,
        predicted_spread_away: -margin,
        predicted_total: total,
        win_prob_home: p_home,
        win_prob_away: 1.0 - p_home,
        sigma_margin: artifact.sigma_margin,
    })
}

/// Rolling features a team carries into the matchup. The team's prior games
/// are derived together with a stat-less placeholder row for the target game,
/// so the placeholder receives exactly the values training would have given it.
fn pregame_features(
    artifact: &ModelArtifact,
    matchup: &Matchup,
    team: &str,
    is_home: bool,
    history: &[TeamGameRecord],
) -> Result<BTreeMap<String, Option<f64>>> {
    let target = matchup.week_key();
    let mut games: Vec<TeamGameRecord> = history
        .iter()
        .filter(|r| r.team == team && r.week_key() < target)
        .cloned()
        .collect();
    if games.is_empty() {
        return Err(ForecastError::UnknownTeam {
            team: team.to_string(),
            game_id: matchup.game_id.clone(),
            season: matchup.season,
            week: matchup.week,
        });
    }
    sort_records(&mut games);
    games.push(TeamGameRecord::new(
        team,
        matchup.season,
        matchup.week,
        &matchup.game_id,
        is_home,
    ));

    let rows = rolling::derive_with_stats(&games, artifact.window_size, &artifact.stats)?;
    Ok(rows.into_iter().last().map(|r| r.values).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design_matrix;
    use crate::split::split;
    use crate::trainer::{ModelTrainer, ModelVariant};

    fn league() -> (Vec<TeamGameRecord>, Vec<GameOutcome>) {
        let mut records = Vec::new();
        let mut outcomes = Vec::new();
        for week in 1..=10u32 {
            let id = format!("w{week:02}");
            let (home, away) = if week % 2 == 0 { ("KC", "LV") } else { ("LV", "KC") };
            let kc = 20.0 + week as f64;
            let lv = 17.0;
            let (hs, as_) = if home == "KC" { (kc, lv) } else { (lv, kc) };
            records.push(TeamGameRecord::new(home, 2023, week, &id, true).with_stat("points", hs));
            records.push(TeamGameRecord::new(away, 2023, week, &id, false).with_stat("points", as_));
            outcomes.push(GameOutcome {
                game_id: id,
                season: 2023,
                week,
                home_team: home.to_string(),
                away_team: away.to_string(),
                neutral_site: false,
                home_score: Some(hs),
                away_score: Some(as_),
            });
        }
        crate::team_game::sort_records(&mut records);
        (records, outcomes)
    }

    fn artifact(
        records: &[TeamGameRecord],
        outcomes: &[GameOutcome],
    ) -> (ModelArtifact, design_matrix::DesignMatrix) {
        let rolled = rolling::derive(records, 3).unwrap();
        let dm = design_matrix::build(&rolled, outcomes, &[]).unwrap();
        let s = split(&dm.rows, WeekKey::new(2023, 10));
        let trainer = ModelTrainer::new(3, rolling::stat_names(records), 1).unwrap();
        let art = trainer
            .fit(&s.train, &dm.feature_columns, &ModelVariant::ridge())
            .unwrap();
        (art, dm)
    }

    #[test]
    fn replayed_game_matches_training_features() {
        let (records, outcomes) = league();
        let (art, dm) = artifact(&records, &outcomes);
        let game = outcomes.iter().find(|g| g.game_id == "w07").unwrap();
        let pred = predict(&art, &Matchup::from_outcome(game), &records, &records, None).unwrap();

        let expected = art.predict_features(&dm.row("w07").unwrap().features);
        assert!((pred.predicted_margin_home - expected.0).abs() < 1e-9);
        assert!((pred.predicted_total - expected.1).abs() < 1e-9);
        assert_eq!(pred.predicted_spread_away, -pred.predicted_margin_home);
        assert!((pred.win_prob_home + pred.win_prob_away - 1.0).abs() < 1e-12);
    }

    #[test]
    fn team_without_history_is_unknown() {
        let (records, outcomes) = league();
        let (art, _) = artifact(&records, &outcomes);
        let matchup = Matchup {
            game_id: "x1".to_string(),
            season: 2023,
            week: 11,
            home_team: "KC".to_string(),
            away_team: "SEA".to_string(),
            neutral_site: false,
        };
        let err = predict(&art, &matchup, &records, &records, None).unwrap_err();
        assert!(matches!(err, ForecastError::UnknownTeam { ref team, .. } if team == "SEA"));
    }

    #[test]
    fn later_rows_do_not_leak_into_the_forecast() {
        let (records, outcomes) = league();
        let (art, _) = artifact(&records, &outcomes);
        let game = outcomes.iter().find(|g| g.game_id == "w05").unwrap();
        let matchup = Matchup::from_outcome(game);
        let before: Vec<TeamGameRecord> =
            records.iter().filter(|r| r.week < 5).cloned().collect();
        let a = predict(&art, &matchup, &records, &records, None).unwrap();
        let b = predict(&art, &matchup, &before, &before, None).unwrap();
        assert_eq!(a, b);
    }
}
