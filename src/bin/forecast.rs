use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gridiron_forecast::config::ForecastConfig;
use gridiron_forecast::ensemble::PredictionRecord;
use gridiron_forecast::historical_dataset::{self, DatasetSnapshot};
use gridiron_forecast::runner::EnsembleRunner;

#[derive(Debug, Serialize)]
struct ForecastOutput {
    generated_at: String,
    train_through: String,
    mae_scored_through: String,
    members: usize,
    failed_members: usize,
    predictions: Vec<PredictionRecord>,
    skipped: Vec<SkippedGame>,
}

#[derive(Debug, Serialize)]
struct SkippedGame {
    game_id: String,
    reason: String,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let db_path = parse_db_path_arg()
        .or_else(historical_dataset::default_db_path)
        .context("unable to resolve sqlite path")?;
    let mut conn = historical_dataset::open_db(&db_path)?;

    if let Some(path) = parse_path_arg("--import") {
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read snapshot {}", path.display()))?;
        let snapshot: DatasetSnapshot =
            serde_json::from_str(&raw).context("invalid snapshot json")?;
        let summary = historical_dataset::ingest_snapshot(&mut conn, &snapshot)?;
        info!(
            team_games = summary.team_games,
            games = summary.games,
            market_odds = summary.market_odds,
            "imported snapshot"
        );
    }

    let data = historical_dataset::load_snapshot(&conn)?;
    let mut config = ForecastConfig::from_env().context("load forecast config")?;
    if has_flag("--latest") {
        config.cutoff = None;
    }

    let runner = EnsembleRunner::new(config)?;
    let trained = runner.fit(&data.team_games, &data.games, &data.market_odds)?;

    let mut predictions = Vec::new();
    let mut skipped = Vec::new();
    for (matchup, result) in trained.predict_pending(&data.games, &data.team_games, &data.market_odds) {
        match result {
            Ok(forecast) => predictions.push(forecast.record()),
            Err(err) => {
                warn!(game_id = %matchup.game_id, error = %err, "no forecast for game");
                skipped.push(SkippedGame {
                    game_id: matchup.game_id,
                    reason: err.to_string(),
                });
            }
        }
    }

    let out = ForecastOutput {
        generated_at: Utc::now().to_rfc3339(),
        train_through: trained.cutoff.to_string(),
        mae_scored_through: trained.scored_through.to_string(),
        members: trained.members.len(),
        failed_members: trained.failures.len(),
        predictions,
        skipped,
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_db_path_arg() -> Option<PathBuf> {
    parse_path_arg("--db")
}

fn parse_path_arg(name: &str) -> Option<PathBuf> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(path) = arg.strip_prefix(&format!("{name}=")) {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                return Some(PathBuf::from(trimmed));
            }
        }
        if arg == name {
            let Some(next) = args.get(idx + 1) else {
                continue;
            };
            if !next.trim().is_empty() {
                return Some(PathBuf::from(next));
            }
        }
    }
    None
}

fn has_flag(name: &str) -> bool {
    std::env::args().skip(1).any(|arg| arg == name)
}
