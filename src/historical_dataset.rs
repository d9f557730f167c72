use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, Transaction, params};
use serde::{Deserialize, Serialize};

use crate::team_game::{GameOutcome, MarketOdds, TeamGameRecord};

const DEFAULT_DB_PATH: &str = "data/gridiron_history.sqlite";

/// Everything the forecaster reads, in one serializable bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetSnapshot {
    #[serde(default)]
    pub team_games: Vec<TeamGameRecord>,
    #[serde(default)]
    pub games: Vec<GameOutcome>,
    #[serde(default)]
    pub market_odds: Vec<MarketOdds>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub team_games: usize,
    pub games: usize,
    pub market_odds: usize,
}

pub fn default_db_path() -> Option<PathBuf> {
    std::env::var("FORECAST_DB_PATH")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| Some(PathBuf::from(DEFAULT_DB_PATH)))
}

pub fn open_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let conn =
        Connection::open(path).with_context(|| format!("open sqlite db {}", path.display()))?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().context("open in-memory sqlite db")?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS team_games (
            team TEXT NOT NULL,
            season INTEGER NOT NULL,
            week INTEGER NOT NULL,
            game_id TEXT NOT NULL,
            is_home INTEGER NOT NULL,
            stats_json TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (team, game_id)
        );
        CREATE INDEX IF NOT EXISTS idx_team_games_order
            ON team_games(team, season, week, game_id);

        CREATE TABLE IF NOT EXISTS games (
            game_id TEXT PRIMARY KEY,
            season INTEGER NOT NULL,
            week INTEGER NOT NULL,
            home_team TEXT NOT NULL,
            away_team TEXT NOT NULL,
            neutral_site INTEGER NOT NULL,
            home_score REAL NULL,
            away_score REAL NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_games_week ON games(season, week);

        CREATE TABLE IF NOT EXISTS market_odds (
            game_id TEXT PRIMARY KEY,
            close_spread_home REAL NULL,
            close_total REAL NULL,
            open_spread_home REAL NULL,
            open_total REAL NULL,
            close_moneyline_home REAL NULL,
            close_moneyline_away REAL NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )
    .context("create sqlite schema")?;
    Ok(())
}

pub fn ingest_snapshot(conn: &mut Connection, snapshot: &DatasetSnapshot) -> Result<IngestSummary> {
    let tx = conn.transaction().context("begin ingest transaction")?;
    for r in &snapshot.team_games {
        upsert_team_game(&tx, r)?;
    }
    for g in &snapshot.games {
        upsert_game(&tx, g)?;
    }
    for o in &snapshot.market_odds {
        upsert_market_odds(&tx, o)?;
    }
    tx.commit().context("commit ingest transaction")?;
    Ok(IngestSummary {
        team_games: snapshot.team_games.len(),
        games: snapshot.games.len(),
        market_odds: snapshot.market_odds.len(),
    })
}

pub fn upsert_team_game(tx: &Transaction<'_>, r: &TeamGameRecord) -> Result<()> {
    // JSON has no NaN; non-finite stats are stored as absent.
    let stats: BTreeMap<&str, f64> = r
        .raw_stats
        .iter()
        .filter(|(_, v)| v.is_finite())
        .map(|(k, v)| (k.as_str(), *v))
        .collect();
    let stats_json = serde_json::to_string(&stats).context("encode team-game stats")?;
    tx.execute(
        r#"
        INSERT INTO team_games (team, season, week, game_id, is_home, stats_json, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(team, game_id) DO UPDATE SET
            season = excluded.season,
            week = excluded.week,
            is_home = excluded.is_home,
            stats_json = excluded.stats_json,
            updated_at = excluded.updated_at
        "#,
        params![
            r.team,
            r.season,
            r.week,
            r.game_id,
            bool_to_i64(r.is_home),
            stats_json,
            Utc::now().to_rfc3339(),
        ],
    )
    .with_context(|| format!("upsert team game {} {}", r.team, r.game_id))?;
    Ok(())
}

pub fn upsert_game(tx: &Transaction<'_>, g: &GameOutcome) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO games (
            game_id, season, week, home_team, away_team, neutral_site,
            home_score, away_score, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(game_id) DO UPDATE SET
            season = excluded.season,
            week = excluded.week,
            home_team = excluded.home_team,
            away_team = excluded.away_team,
            neutral_site = excluded.neutral_site,
            home_score = excluded.home_score,
            away_score = excluded.away_score,
            updated_at = excluded.updated_at
        "#,
        params![
            g.game_id,
            g.season,
            g.week,
            g.home_team,
            g.away_team,
            bool_to_i64(g.neutral_site),
            g.home_score,
            g.away_score,
            Utc::now().to_rfc3339(),
        ],
    )
    .with_context(|| format!("upsert game {}", g.game_id))?;
    Ok(())
}

pub fn upsert_market_odds(tx: &Transaction<'_>, o: &MarketOdds) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO market_odds (
            game_id, close_spread_home, close_total, open_spread_home, open_total,
            close_moneyline_home, close_moneyline_away, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(game_id) DO UPDATE SET
            close_spread_home = excluded.close_spread_home,
            close_total = excluded.close_total,
            open_spread_home = excluded.open_spread_home,
            open_total = excluded.open_total,
            close_moneyline_home = excluded.close_moneyline_home,
            close_moneyline_away = excluded.close_moneyline_away,
            updated_at = excluded.updated_at
        "#,
        params![
            o.game_id,
            o.close_spread_home,
            o.close_total,
            o.open_spread_home,
            o.open_total,
            o.close_moneyline_home,
            o.close_moneyline_away,
            Utc::now().to_rfc3339(),
        ],
    )
    .with_context(|| format!("upsert market odds {}", o.game_id))?;
    Ok(())
}

/// Ordered by (team, season, week, game_id), ready for rolling derivation.
pub fn load_team_games(conn: &Connection) -> Result<Vec<TeamGameRecord>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT team, season, week, game_id, is_home, stats_json
            FROM team_games
            ORDER BY team ASC, season ASC, week ASC, game_id ASC
            "#,
        )
        .context("prepare load team games query")?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                TeamGameRecord::new(
                    &row.get::<_, String>(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    &row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)? != 0,
                ),
                row.get::<_, String>(5)?,
            ))
        })
        .context("query load team games")?;

    let mut out = Vec::new();
    for row in rows {
        let (mut record, stats_json) = row.context("decode team game row")?;
        record.raw_stats = serde_json::from_str(&stats_json).with_context(|| {
            format!("invalid stats_json for {} {}", record.team, record.game_id)
        })?;
        out.push(record);
    }
    Ok(out)
}

pub fn load_games(conn: &Connection) -> Result<Vec<GameOutcome>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT game_id, season, week, home_team, away_team, neutral_site,
                   home_score, away_score
            FROM games
            ORDER BY season ASC, week ASC, game_id ASC
            "#,
        )
        .context("prepare load games query")?;

    let rows = stmt
        .query_map([], |row| {
            Ok(GameOutcome {
                game_id: row.get(0)?,
                season: row.get(1)?,
                week: row.get(2)?,
                home_team: row.get(3)?,
                away_team: row.get(4)?,
                neutral_site: row.get::<_, i64>(5)? != 0,
                home_score: row.get(6)?,
                away_score: row.get(7)?,
            })
        })
        .context("query load games")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode game row")?);
    }
    Ok(out)
}

pub fn load_market_odds(conn: &Connection) -> Result<Vec<MarketOdds>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT game_id, close_spread_home, close_total, open_spread_home, open_total,
                   close_moneyline_home, close_moneyline_away
            FROM market_odds
            ORDER BY game_id ASC
            "#,
        )
        .context("prepare load market odds query")?;

    let rows = stmt
        .query_map([], |row| {
            Ok(MarketOdds {
                game_id: row.get(0)?,
                close_spread_home: row.get(1)?,
                close_total: row.get(2)?,
                open_spread_home: row.get(3)?,
                open_total: row.get(4)?,
                close_moneyline_home: row.get(5)?,
                close_moneyline_away: row.get(6)?,
            })
        })
        .context("query load market odds")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode market odds row")?);
    }
    Ok(out)
}

pub fn load_snapshot(conn: &Connection) -> Result<DatasetSnapshot> {
    Ok(DatasetSnapshot {
        team_games: load_team_games(conn)?,
        games: load_games(conn)?,
        market_odds: load_market_odds(conn)?,
    })
}

fn bool_to_i64(v: bool) -> i64 {
    if v { 1 } else { 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> DatasetSnapshot {
        DatasetSnapshot {
            team_games: vec![
                TeamGameRecord::new("SF", 2023, 2, "g2", false).with_stat("points", 30.0),
                TeamGameRecord::new("SF", 2023, 1, "g1", true)
                    .with_stat("points", 27.0)
                    .with_stat("broken", f64::NAN),
                TeamGameRecord::new("ARI", 2023, 1, "g1", false).with_stat("points", 13.0),
            ],
            games: vec![GameOutcome {
                game_id: "g1".to_string(),
                season: 2023,
                week: 1,
                home_team: "SF".to_string(),
                away_team: "ARI".to_string(),
                neutral_site: true,
                home_score: Some(27.0),
                away_score: Some(13.0),
            }],
            market_odds: vec![MarketOdds {
                game_id: "g1".to_string(),
                close_spread_home: Some(-10.5),
                close_moneyline_home: Some(-500.0),
                ..Default::default()
            }],
        }
    }

    #[test]
    fn round_trips_and_orders_team_games() {
        let mut conn = open_in_memory().unwrap();
        let summary = ingest_snapshot(&mut conn, &snapshot()).unwrap();
        assert_eq!(summary.team_games, 3);

        let loaded = load_snapshot(&conn).unwrap();
        let keys: Vec<(&str, &str)> = loaded
            .team_games
            .iter()
            .map(|r| (r.team.as_str(), r.game_id.as_str()))
            .collect();
        assert_eq!(keys, vec![("ARI", "g1"), ("SF", "g1"), ("SF", "g2")]);
        assert!(crate::team_game::ensure_ordered(&loaded.team_games).is_ok());
        assert_eq!(loaded.team_games[1].stat("broken"), None);
        assert_eq!(loaded.games, snapshot().games);
        assert_eq!(loaded.market_odds, snapshot().market_odds);
    }

    #[test]
    fn upsert_replaces_scores() {
        let mut conn = open_in_memory().unwrap();
        let mut snap = snapshot();
        snap.games[0].home_score = None;
        snap.games[0].away_score = None;
        ingest_snapshot(&mut conn, &snap).unwrap();
        assert!(!load_games(&conn).unwrap()[0].is_graded());

        ingest_snapshot(&mut conn, &snapshot()).unwrap();
        let games = load_games(&conn).unwrap();
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].margin_home(), Some(14.0));
    }
}
