//! Fits every (window, variant) member and turns them into game forecasts.

use std::collections::HashMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::calibration::{
    Outcome, RegressionMetrics, WinMetrics, classify_margin, evaluate_regression,
    evaluate_win_probs, expected_calibration_error,
};
use crate::config::ForecastConfig;
use crate::design_matrix::{self, DesignMatrix};
use crate::ensemble::{self, CombineMode, EnsembleMember, EnsemblePrediction, PredictionRecord};
use crate::error::{ForecastError, Result};
use crate::predictor::{self, Matchup};
use crate::rolling;
use crate::split::{latest_graded_week, split, trailing_cutoff};
use crate::team_game::{GameOutcome, MarketOdds, TeamGameRecord, WeekKey};
use crate::trainer::{HoldoutReport, ModelArtifact, ModelTrainer, evaluate_holdout};

const ECE_BINS: usize = 10;

#[derive(Debug, Clone)]
pub struct TrainedMember {
    pub artifact: ModelArtifact,
    pub holdout: HoldoutReport,
}

#[derive(Debug, Clone)]
pub struct MemberFailure {
    pub window: usize,
    pub variant_id: String,
    pub error: ForecastError,
}

#[derive(Debug, Clone)]
pub struct GameForecast {
    pub matchup: Matchup,
    pub prediction: EnsemblePrediction,
    pub members: Vec<EnsembleMember>,
}

impl GameForecast {
    pub fn record(&self) -> PredictionRecord {
        PredictionRecord::from_ensemble(&self.prediction)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnsembleBacktest {
    pub games: usize,
    pub skipped: usize,
    pub margin: RegressionMetrics,
    pub total: RegressionMetrics,
    pub win: WinMetrics,
    pub ece: f64,
}

pub struct EnsembleRunner {
    config: ForecastConfig,
}

impl EnsembleRunner {
    pub fn new(config: ForecastConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.config
    }

    /// Scores every member on the holdout after the scoring cutoff, then
    /// refits the survivors on all graded rows for forecasting.
    /// `records` must be ordered by (team, season, week, game_id).
    pub fn fit(
        &self,
        records: &[TeamGameRecord],
        outcomes: &[GameOutcome],
        odds: &[MarketOdds],
    ) -> Result<TrainedEnsemble> {
        self.fit_members(records, outcomes, odds, true)
    }

    /// Like [`fit`](Self::fit) without the refit, so the holdout games stay
    /// unseen and [`TrainedEnsemble::backtest`] can replay them.
    pub fn fit_through_cutoff(
        &self,
        records: &[TeamGameRecord],
        outcomes: &[GameOutcome],
        odds: &[MarketOdds],
    ) -> Result<TrainedEnsemble> {
        self.fit_members(records, outcomes, odds, false)
    }

    fn fit_members(
        &self,
        records: &[TeamGameRecord],
        outcomes: &[GameOutcome],
        odds: &[MarketOdds],
        refit: bool,
    ) -> Result<TrainedEnsemble> {
        let stats = self
            .config
            .stats
            .clone()
            .unwrap_or_else(|| rolling::stat_names(records));

        let matrices: Vec<(usize, DesignMatrix)> = self
            .config
            .windows
            .par_iter()
            .map(|&w| -> Result<(usize, DesignMatrix)> {
                let rolled = rolling::derive_with_stats(records, w, &stats)?;
                Ok((w, design_matrix::build(&rolled, outcomes, odds)?))
            })
            .collect::<Result<Vec<_>>>()?;

        let latest = matrices
            .iter()
            .filter_map(|(_, dm)| latest_graded_week(&dm.rows))
            .max();
        let scored_through = self
            .config
            .cutoff
            .or_else(|| {
                matrices
                    .iter()
                    .filter_map(|(_, dm)| trailing_cutoff(&dm.rows, self.config.holdout_weeks))
                    .min()
            })
            .or(latest)
            .unwrap_or(WeekKey::new(0, 0));
        let cutoff = match latest {
            Some(latest) if refit && latest > scored_through => latest,
            _ => scored_through,
        };

        let jobs: Vec<(&(usize, DesignMatrix), &_)> = matrices
            .iter()
            .flat_map(|m| self.config.variants.iter().map(move |v| (m, v)))
            .collect();

        let results: Vec<Result<TrainedMember>> = jobs
            .par_iter()
            .map(|((window, dm), variant)| -> Result<TrainedMember> {
                let parts = split(&dm.rows, scored_through);
                let trainer = ModelTrainer::new(*window, stats.clone(), self.config.min_train_rows)?;
                let scored = trainer.fit(&parts.train, &dm.feature_columns, variant)?;
                let holdout = evaluate_holdout(&scored, &parts.holdout);
                let artifact = if cutoff > scored_through {
                    trainer.fit(&split(&dm.rows, cutoff).train, &dm.feature_columns, variant)?
                } else {
                    scored
                };
                Ok(TrainedMember { artifact, holdout })
            })
            .collect();

        let mut members = Vec::new();
        let mut failures = Vec::new();
        for (((window, _), variant), result) in jobs.iter().zip(results) {
            match result {
                Ok(member) => members.push(member),
                Err(error) if error.is_member_recoverable() => {
                    warn!(window, variant = %variant.id, error = %error, "dropping ensemble member");
                    failures.push(MemberFailure {
                        window: *window,
                        variant_id: variant.id.clone(),
                        error,
                    });
                }
                Err(error) => return Err(error),
            }
        }

        let unscored = members
            .iter()
            .filter(|m| m.holdout.margin_mae.is_none())
            .count();
        if self.config.combine == CombineMode::InverseMae && unscored > 0 {
            warn!(
                unscored,
                scored_through = %scored_through,
                "no holdout MAE for some members, inverse-MAE weights fall back to uniform"
            );
        }

        info!(
            members = members.len(),
            failed = failures.len(),
            scored_through = %scored_through,
            cutoff = %cutoff,
            "ensemble fitted"
        );

        Ok(TrainedEnsemble {
            cutoff,
            scored_through,
            combine: self.config.combine,
            members,
            failures,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TrainedEnsemble {
    /// Last week the member artifacts were trained on.
    pub cutoff: WeekKey,
    /// Holdout MAE covers graded games after this week.
    pub scored_through: WeekKey,
    pub combine: CombineMode,
    pub members: Vec<TrainedMember>,
    pub failures: Vec<MemberFailure>,
}

impl TrainedEnsemble {
    /// Fit-level member failures drop that member. Unknown teams and malformed
    /// history abort the game.
    pub fn predict_game(
        &self,
        matchup: &Matchup,
        records: &[TeamGameRecord],
        market: Option<&MarketOdds>,
    ) -> Result<GameForecast> {
        let mut members = Vec::with_capacity(self.members.len());
        for member in &self.members {
            let art = &member.artifact;
            match predictor::predict(art, matchup, records, records, market) {
                Ok(p) => members.push(EnsembleMember {
                    window_size: art.window_size,
                    variant_id: art.variant_id.clone(),
                    predicted_margin_home: p.predicted_margin_home,
                    predicted_total: p.predicted_total,
                    holdout_mae: member.holdout.margin_mae,
                    sigma_margin: p.sigma_margin,
                }),
                Err(e) if e.is_member_recoverable() => warn!(
                    game_id = %matchup.game_id,
                    window = art.window_size,
                    variant = %art.variant_id,
                    error = %e,
                    "member prediction failed"
                ),
                Err(e) => return Err(e),
            }
        }

        let prediction = ensemble::combine(&matchup.game_id, &members, self.combine)?;
        Ok(GameForecast {
            matchup: matchup.clone(),
            prediction,
            members,
        })
    }

    /// Forecasts for every ungraded game, in schedule order.
    pub fn predict_pending(
        &self,
        outcomes: &[GameOutcome],
        records: &[TeamGameRecord],
        odds: &[MarketOdds],
    ) -> Vec<(Matchup, Result<GameForecast>)> {
        let games: Vec<&GameOutcome> = outcomes.iter().filter(|g| !g.is_graded()).collect();
        self.predict_games(&games, records, odds)
    }

    /// Replays every graded game after the cutoff through the full
    /// single-game path and scores the ensemble.
    pub fn backtest(
        &self,
        outcomes: &[GameOutcome],
        records: &[TeamGameRecord],
        odds: &[MarketOdds],
    ) -> EnsembleBacktest {
        let games: Vec<&GameOutcome> = outcomes
            .iter()
            .filter(|g| g.is_graded() && g.week_key() > self.cutoff)
            .collect();
        let results = self.predict_games(&games, records, odds);
        let actual: HashMap<&str, &GameOutcome> =
            games.iter().map(|g| (g.game_id.as_str(), *g)).collect();

        let mut out = EnsembleBacktest::default();
        let mut pm = Vec::new();
        let mut am = Vec::new();
        let mut pt = Vec::new();
        let mut at = Vec::new();
        let mut probs = Vec::new();
        let mut outcomes_seen: Vec<Outcome> = Vec::new();

        for (matchup, result) in results {
            let Some(game) = actual.get(matchup.game_id.as_str()) else {
                continue;
            };
            let (Ok(forecast), Some(margin), Some(total)) =
                (result, game.margin_home(), game.total_points())
            else {
                out.skipped += 1;
                continue;
            };
            let p = &forecast.prediction;
            pm.push(p.predicted_margin_home);
            am.push(margin);
            pt.push(p.predicted_total);
            at.push(total);
            probs.push(p.win_prob_home);
            outcomes_seen.push(classify_margin(margin));
        }

        out.games = pm.len();
        out.margin = evaluate_regression(&pm, &am);
        out.total = evaluate_regression(&pt, &at);
        out.win = evaluate_win_probs(&probs, &outcomes_seen);
        out.ece = expected_calibration_error(&probs, &outcomes_seen, ECE_BINS);
        out
    }

    fn predict_games(
        &self,
        games: &[&GameOutcome],
        records: &[TeamGameRecord],
        odds: &[MarketOdds],
    ) -> Vec<(Matchup, Result<GameForecast>)> {
        let market: HashMap<&str, &MarketOdds> =
            odds.iter().map(|o| (o.game_id.as_str(), o)).collect();
        let mut games = games.to_vec();
        games.sort_by(|a, b| a.week_key().cmp(&b.week_key()).then(a.game_id.cmp(&b.game_id)));

        games
            .par_iter()
            .map(|g| {
                let matchup = Matchup::from_outcome(g);
                let result = self.predict_game(
                    &matchup,
                    records,
                    market.get(g.game_id.as_str()).copied(),
                );
                (matchup, result)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainer::ModelVariant;

    fn league(weeks: u32) -> (Vec<TeamGameRecord>, Vec<GameOutcome>) {
        let teams = ["ATL", "CAR", "NO", "TB"];
        let strength = [6.0, -4.0, 2.0, -1.0];
        let mut records = Vec::new();
        let mut outcomes = Vec::new();
        for week in 1..=weeks {
            let pairs = if week % 2 == 0 { [(0, 1), (2, 3)] } else { [(3, 0), (1, 2)] };
            for (h, a) in pairs {
                let id = format!("2023_{week:02}_{}_{}", teams[a], teams[h]);
                let hs = 21.0 + strength[h] + (week % 3) as f64;
                let as_ = 20.0 + strength[a] - (week % 2) as f64;
                records.push(
                    TeamGameRecord::new(teams[h], 2023, week, &id, true)
                        .with_stat("points", hs)
                        .with_stat("allowed", as_),
                );
                records.push(
                    TeamGameRecord::new(teams[a], 2023, week, &id, false)
                        .with_stat("points", as_)
                        .with_stat("allowed", hs),
                );
                let graded = week < weeks;
                outcomes.push(GameOutcome {
                    game_id: id,
                    season: 2023,
                    week,
                    home_team: teams[h].to_string(),
                    away_team: teams[a].to_string(),
                    neutral_site: false,
                    home_score: graded.then_some(hs),
                    away_score: graded.then_some(as_),
                });
            }
        }
        crate::team_game::sort_records(&mut records);
        (records, outcomes)
    }

    fn config() -> ForecastConfig {
        ForecastConfig {
            windows: vec![2, 4],
            variants: vec![ModelVariant::ridge(), ModelVariant::boosted()],
            min_train_rows: 4,
            combine: CombineMode::InverseMae,
            cutoff: Some(WeekKey::new(2023, 8)),
            holdout_weeks: 2,
            stats: None,
        }
    }

    #[test]
    fn fits_every_member_and_forecasts_pending_games() {
        let (records, outcomes) = league(12);
        let runner = EnsembleRunner::new(config()).unwrap();
        let trained = runner.fit(&records, &outcomes, &[]).unwrap();
        assert_eq!(trained.members.len(), 4);
        assert!(trained.failures.is_empty());
        assert_eq!(trained.scored_through, WeekKey::new(2023, 8));
        assert_eq!(trained.cutoff, WeekKey::new(2023, 11));
        for m in &trained.members {
            assert_eq!(m.artifact.train_through_week, WeekKey::new(2023, 11));
            assert!(m.holdout.margin_mae.is_some());
        }

        let pending = trained.predict_pending(&outcomes, &records, &[]);
        assert_eq!(pending.len(), 2);
        for (matchup, result) in pending {
            let f = result.unwrap();
            assert_eq!(f.prediction.member_count, 4);
            assert_eq!(f.record().game_id, matchup.game_id);
            assert!(f.prediction.margin_95ci.0 <= f.prediction.predicted_margin_home);
        }
    }

    #[test]
    fn short_history_drops_members_not_the_run() {
        let (records, outcomes) = league(12);
        let mut cfg = config();
        cfg.min_train_rows = 15;
        let trained = EnsembleRunner::new(cfg).unwrap().fit(&records, &outcomes, &[]).unwrap();
        // 8 graded weeks x 2 games = 16 train rows; first-week rows still count
        assert_eq!(trained.members.len(), 4);

        let mut cfg = config();
        cfg.min_train_rows = 100;
        let trained = EnsembleRunner::new(cfg).unwrap().fit(&records, &outcomes, &[]).unwrap();
        assert!(trained.members.is_empty());
        assert_eq!(trained.failures.len(), 4);
        let game = outcomes.last().unwrap();
        assert!(matches!(
            trained.predict_game(&Matchup::from_outcome(game), &records, None),
            Err(ForecastError::NoSurvivingMembers { .. })
        ));
    }

    #[test]
    fn default_config_weights_members_by_trailing_holdout() {
        let (records, outcomes) = league(12);
        let mut cfg = config();
        cfg.cutoff = None;
        let trained = EnsembleRunner::new(cfg).unwrap().fit(&records, &outcomes, &[]).unwrap();
        // graded weeks 1..=11; the last two are held out for scoring
        assert_eq!(trained.scored_through, WeekKey::new(2023, 9));
        assert_eq!(trained.cutoff, WeekKey::new(2023, 11));
        assert!(trained.members.iter().all(|m| m.holdout.margin_mae.is_some()));

        let game = outcomes.last().unwrap();
        let f = trained.predict_game(&Matchup::from_outcome(game), &records, None).unwrap();
        assert_eq!(f.prediction.weights.len(), 4);
        assert!(f.prediction.weights.iter().any(|w| (w - 0.25).abs() > 1e-9));
        assert!((f.prediction.weights.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn too_few_graded_weeks_leaves_members_unscored() {
        let (records, outcomes) = league(3);
        let mut cfg = config();
        cfg.cutoff = None;
        cfg.min_train_rows = 1;
        let trained = EnsembleRunner::new(cfg).unwrap().fit(&records, &outcomes, &[]).unwrap();
        assert_eq!(trained.cutoff, WeekKey::new(2023, 2));
        assert_eq!(trained.scored_through, WeekKey::new(2023, 2));
        assert!(trained.members.iter().all(|m| m.holdout.margin_mae.is_none()));
    }

    #[test]
    fn failed_variant_shrinks_the_ensemble() {
        let (records, mut outcomes) = league(12);
        for g in &mut outcomes {
            if let Some(h) = g.home_score {
                g.away_score = Some(h - 3.0);
            }
        }
        let mut cfg = config();
        cfg.windows = vec![2];
        cfg.variants = vec![ModelVariant::ridge(), ModelVariant::stacked()];
        let trained = EnsembleRunner::new(cfg).unwrap().fit(&records, &outcomes, &[]).unwrap();
        assert_eq!(trained.members.len(), 1);
        assert_eq!(trained.failures.len(), 1);
        assert_eq!(trained.failures[0].variant_id, ModelVariant::stacked().id);
        assert!(matches!(
            trained.failures[0].error,
            ForecastError::InsufficientTrainingData { .. }
        ));

        let pending = trained.predict_pending(&outcomes, &records, &[]);
        assert_eq!(pending.len(), 2);
        for (_, result) in pending {
            let f = result.unwrap();
            assert_eq!(f.prediction.member_count, trained.members.len());
            assert!(f.prediction.member_count < 2);
            assert!((f.prediction.predicted_margin_home - 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn duplicated_history_row_aborts_the_game() {
        let (records, outcomes) = league(12);
        let trained = EnsembleRunner::new(config()).unwrap().fit(&records, &outcomes, &[]).unwrap();
        let mut dup = records.clone();
        dup.push(records[0].clone());
        crate::team_game::sort_records(&mut dup);

        let game = outcomes
            .iter()
            .find(|g| g.week == 12 && g.home_team == records[0].team)
            .unwrap();
        let err = trained.predict_game(&Matchup::from_outcome(game), &dup, None).unwrap_err();
        assert!(matches!(err, ForecastError::UnorderedInput { ref team, week: 1, .. } if team == &records[0].team));
    }

    #[test]
    fn backtest_scores_graded_games_after_cutoff() {
        let (records, outcomes) = league(12);
        let trained = EnsembleRunner::new(config())
            .unwrap()
            .fit_through_cutoff(&records, &outcomes, &[])
            .unwrap();
        assert_eq!(trained.cutoff, WeekKey::new(2023, 8));
        let report = trained.backtest(&outcomes, &records, &[]);
        // weeks 9..=11 are graded and after the cutoff
        assert_eq!(report.games, 6);
        assert_eq!(report.skipped, 0);
        assert!(report.margin.mae.is_finite());
    }

    #[test]
    fn fitting_is_reproducible() {
        let (records, outcomes) = league(12);
        let runner = EnsembleRunner::new(config()).unwrap();
        let a = runner.fit(&records, &outcomes, &[]).unwrap();
        let b = runner.fit(&records, &outcomes, &[]).unwrap();
        let arts = |t: &TrainedEnsemble| t.members.iter().map(|m| m.artifact.clone()).collect::<Vec<_>>();
        assert_eq!(arts(&a), arts(&b));
    }
}
