use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tracing_subscriber::EnvFilter;

use gridiron_forecast::config::ForecastConfig;
use gridiron_forecast::historical_dataset;
use gridiron_forecast::runner::EnsembleRunner;
use gridiron_forecast::team_game::WeekKey;

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let db_path = parse_db_path_arg()
        .or_else(historical_dataset::default_db_path)
        .context("unable to resolve sqlite path")?;
    let conn = historical_dataset::open_db(&db_path)?;
    let data = historical_dataset::load_snapshot(&conn)?;

    let mut config = ForecastConfig::from_env().context("load forecast config")?;
    if let Some(raw) = parse_str_arg("--cutoff") {
        config.cutoff =
            Some(WeekKey::parse(&raw).ok_or_else(|| anyhow!("invalid --cutoff '{raw}'"))?);
    }
    if config.cutoff.is_none() {
        return Err(anyhow!(
            "backtest needs a cutoff (--cutoff season:week or FORECAST_CUTOFF)"
        ));
    }

    let runner = EnsembleRunner::new(config)?;
    let trained = runner.fit_through_cutoff(&data.team_games, &data.games, &data.market_odds)?;
    let report = trained.backtest(&data.games, &data.team_games, &data.market_odds);

    if has_flag("--json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Train through: {}", trained.cutoff);
    println!(
        "{:<4} {:<8} {:>6} {:>8} {:>8} {:>8} {:>8}",
        "win", "variant", "rows", "marMAE", "totMAE", "brier", "sigma"
    );
    for m in &trained.members {
        let h = &m.holdout;
        println!(
            "{:<4} {:<8} {:>6} {:>8.3} {:>8.3} {:>8.4} {:>8.2}",
            m.artifact.window_size,
            m.artifact.variant_id,
            m.artifact.train_rows,
            h.margin.mae,
            h.total.mae,
            h.win.brier,
            m.artifact.sigma_margin
        );
    }
    for f in &trained.failures {
        println!("{:<4} {:<8} FAILED: {}", f.window, f.variant_id, f.error);
    }

    println!();
    println!("Ensemble holdout games: {} (skipped {})", report.games, report.skipped);
    println!(
        "Margin MAE={:.3} RMSE={:.3} bias={:+.3}",
        report.margin.mae, report.margin.rmse, report.margin.bias
    );
    println!("Total  MAE={:.3} RMSE={:.3}", report.total.mae, report.total.rmse);
    println!(
        "Win    brier={:.4} logloss={:.4} acc={:.3} ece={:.4}",
        report.win.brier, report.win.log_loss, report.win.accuracy, report.ece
    );

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_db_path_arg() -> Option<PathBuf> {
    parse_str_arg("--db").map(PathBuf::from)
}

fn parse_str_arg(name: &str) -> Option<String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(raw) = arg.strip_prefix(&format!("{name}="))
            && !raw.trim().is_empty()
        {
            return Some(raw.trim().to_string());
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
            && !next.trim().is_empty()
        {
            return Some(next.trim().to_string());
        }
    }
    None
}

fn has_flag(name: &str) -> bool {
    std::env::args().skip(1).any(|arg| arg == name)
}
