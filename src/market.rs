use serde::{Deserialize, Serialize};

use crate::team_game::MarketOdds;

pub const CLOSE_SPREAD_HOME: &str = "closeSpreadHome";
pub const CLOSE_TOTAL: &str = "closeTotal";
pub const OPEN_SPREAD_HOME: &str = "openSpreadHome";
pub const OPEN_TOTAL: &str = "openTotal";
pub const IMPLIED_HOME_WIN_PROB_NO_VIG: &str = "impliedHomeWinProbNoVig";
pub const SPREAD_MOVE: &str = "spreadMove";
pub const TOTAL_MOVE: &str = "totalMove";

pub const MARKET_COLUMNS: [&str; 7] = [
    CLOSE_SPREAD_HOME,
    CLOSE_TOTAL,
    OPEN_SPREAD_HOME,
    OPEN_TOTAL,
    IMPLIED_HOME_WIN_PROB_NO_VIG,
    SPREAD_MOVE,
    TOTAL_MOVE,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketFeatures {
    pub close_spread_home: Option<f64>,
    pub close_total: Option<f64>,
    pub open_spread_home: Option<f64>,
    pub open_total: Option<f64>,
    pub implied_home_win_prob_no_vig: Option<f64>,
    pub spread_move: Option<f64>,
    pub total_move: Option<f64>,
}

impl MarketFeatures {
    pub fn from_odds(odds: &MarketOdds) -> Self {
        let finite = |v: Option<f64>| v.filter(|x| x.is_finite());
        let close_spread_home = finite(odds.close_spread_home);
        let close_total = finite(odds.close_total);
        let open_spread_home = finite(odds.open_spread_home);
        let open_total = finite(odds.open_total);

        let implied_home_win_prob_no_vig = match (
            finite(odds.close_moneyline_home),
            finite(odds.close_moneyline_away),
        ) {
            (Some(home), Some(away)) => no_vig_from_american(home, away).map(|(h, _)| h),
            _ => None,
        };

        Self {
            close_spread_home,
            close_total,
            open_spread_home,
            open_total,
            implied_home_win_prob_no_vig,
            spread_move: diff(close_spread_home, open_spread_home),
            total_move: diff(close_total, open_total),
        }
    }

    pub fn columns(&self) -> [(&'static str, Option<f64>); 7] {
        [
            (CLOSE_SPREAD_HOME, self.close_spread_home),
            (CLOSE_TOTAL, self.close_total),
            (OPEN_SPREAD_HOME, self.open_spread_home),
            (OPEN_TOTAL, self.open_total),
            (IMPLIED_HOME_WIN_PROB_NO_VIG, self.implied_home_win_prob_no_vig),
            (SPREAD_MOVE, self.spread_move),
            (TOTAL_MOVE, self.total_move),
        ]
    }
}

fn diff(close: Option<f64>, open: Option<f64>) -> Option<f64> {
    Some(close? - open?)
}

/// Implied win probability of an American moneyline. A zero line is not a price.
pub fn implied_prob_from_american(line: f64) -> Option<f64> {
    if !line.is_finite() || line == 0.0 {
        return None;
    }
    if line < 0.0 {
        let l = line.abs();
        Some(l / (l + 100.0))
    } else {
        Some(100.0 / (line + 100.0))
    }
}

/// Normalizes the two one-sided implied probabilities so they sum to one.
pub fn no_vig_from_american(home_line: f64, away_line: f64) -> Option<(f64, f64)> {
    let ih = implied_prob_from_american(home_line)?;
    let ia = implied_prob_from_american(away_line)?;
    let sum = ih + ia;
    if sum <= 0.0 {
        return None;
    }
    Some((ih / sum, ia / sum))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn favorite_and_underdog_lines_convert() {
        assert!((implied_prob_from_american(-150.0).unwrap() - 0.6).abs() < 1e-12);
        assert!((implied_prob_from_american(130.0).unwrap() - 100.0 / 230.0).abs() < 1e-12);
        assert!(implied_prob_from_american(0.0).is_none());
    }

    #[test]
    fn no_vig_probs_sum_to_one() {
        let (h, a) = no_vig_from_american(-150.0, 130.0).expect("valid");
        assert!((h + a - 1.0).abs() < 1e-12);
        assert!((h - 0.5798).abs() < 1e-3);
        // vig removal pulls the favorite down and the dog up
        assert!(h < 0.6);
        assert!(a > 100.0 / 230.0);
    }

    #[test]
    fn line_moves_need_both_ends() {
        let odds = MarketOdds {
            game_id: "g".to_string(),
            close_spread_home: Some(-3.5),
            close_total: Some(47.5),
            open_spread_home: Some(-2.5),
            open_total: None,
            close_moneyline_home: Some(-180.0),
            close_moneyline_away: None,
        };
        let f = MarketFeatures::from_odds(&odds);
        assert_eq!(f.spread_move, Some(-1.0));
        assert_eq!(f.total_move, None);
        assert_eq!(f.implied_home_win_prob_no_vig, None);
    }
}
