use std::collections::HashSet;
use std::env;

use crate::ensemble::CombineMode;
use crate::error::{ForecastError, Result};
use crate::team_game::WeekKey;
use crate::trainer::ModelVariant;

const DEFAULT_WINDOWS: &[usize] = &[3, 5, 8];
const DEFAULT_MIN_TRAIN_ROWS: usize = 24;
const DEFAULT_HOLDOUT_WEEKS: usize = 2;
const MAX_WINDOW: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastConfig {
    pub windows: Vec<usize>,
    pub variants: Vec<ModelVariant>,
    pub min_train_rows: usize,
    pub combine: CombineMode,
    /// Last (season, week) the holdout MAE is scored against. None: hold out
    /// the trailing `holdout_weeks` graded weeks.
    pub cutoff: Option<WeekKey>,
    pub holdout_weeks: usize,
    /// Raw stats to derive from. None: every stat seen in the store.
    pub stats: Option<Vec<String>>,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            windows: DEFAULT_WINDOWS.to_vec(),
            variants: vec![
                ModelVariant::ridge(),
                ModelVariant::boosted(),
                ModelVariant::stacked(),
            ],
            min_train_rows: DEFAULT_MIN_TRAIN_ROWS,
            combine: CombineMode::default(),
            cutoff: None,
            holdout_weeks: DEFAULT_HOLDOUT_WEEKS,
            stats: None,
        }
    }
}

impl ForecastConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut cfg = Self::default();

        if let Some(raw) = get("FORECAST_WINDOWS") {
            let windows = parse_windows(&raw);
            if windows.is_empty() {
                return Err(ForecastError::InvalidConfig(format!(
                    "FORECAST_WINDOWS has no usable window: '{raw}'"
                )));
            }
            cfg.windows = windows;
        }

        if let Some(raw) = get("FORECAST_VARIANTS") {
            let mut seen = HashSet::new();
            let mut variants = Vec::new();
            for part in split_list(&raw) {
                let variant = ModelVariant::parse(part)?;
                if seen.insert(variant.id.clone()) {
                    variants.push(variant);
                }
            }
            cfg.variants = variants;
        }

        if let Some(raw) = get("FORECAST_MIN_TRAIN_ROWS") {
            cfg.min_train_rows = raw.parse::<usize>().map_err(|_| {
                ForecastError::InvalidConfig(format!("FORECAST_MIN_TRAIN_ROWS='{raw}'"))
            })?;
        }

        if let Some(raw) = get("FORECAST_COMBINE") {
            cfg.combine = CombineMode::parse(&raw)
                .ok_or_else(|| ForecastError::InvalidConfig(format!("FORECAST_COMBINE='{raw}'")))?;
        }

        if let Some(raw) = get("FORECAST_CUTOFF") {
            cfg.cutoff = Some(WeekKey::parse(&raw).ok_or_else(|| {
                ForecastError::InvalidConfig(format!("FORECAST_CUTOFF='{raw}', expected season:week"))
            })?);
        }

        if let Some(raw) = get("FORECAST_HOLDOUT_WEEKS") {
            cfg.holdout_weeks = raw.parse::<usize>().map_err(|_| {
                ForecastError::InvalidConfig(format!("FORECAST_HOLDOUT_WEEKS='{raw}'"))
            })?;
        }

        if let Some(raw) = get("FORECAST_STATS") {
            let stats: Vec<String> = dedup(split_list(&raw).map(str::to_string).collect());
            cfg.stats = (!stats.is_empty()).then_some(stats);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.windows.is_empty() {
            return Err(ForecastError::InvalidConfig("no rolling windows".to_string()));
        }
        if let Some(w) = self.windows.iter().find(|w| **w == 0 || **w > MAX_WINDOW) {
            return Err(ForecastError::InvalidConfig(format!(
                "window {w} outside 1..={MAX_WINDOW}"
            )));
        }
        if self.variants.is_empty() {
            return Err(ForecastError::InvalidConfig("no model variants".to_string()));
        }
        for v in &self.variants {
            v.learner.validate()?;
        }
        if self.min_train_rows == 0 {
            return Err(ForecastError::InvalidConfig(
                "min_train_rows must be at least 1".to_string(),
            ));
        }
        if self.holdout_weeks == 0 {
            return Err(ForecastError::InvalidConfig(
                "holdout_weeks must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split([',', ';', ' ']).map(str::trim).filter(|s| !s.is_empty())
}

fn parse_windows(raw: &str) -> Vec<usize> {
    let windows = split_list(raw)
        .filter_map(|part| part.parse::<usize>().ok())
        .filter(|w| *w != 0)
        .collect::<Vec<_>>();
    dedup(windows)
}

fn dedup<T: Clone + Eq + std::hash::Hash>(items: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        if seen.insert(item.clone()) {
            out.push(item);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn cfg(vars: &[(&str, &str)]) -> Result<ForecastConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ForecastConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(cfg(&[]).unwrap(), ForecastConfig::default());
    }

    #[test]
    fn lists_are_trimmed_and_deduped() {
        let c = cfg(&[
            ("FORECAST_WINDOWS", "5, 3;5 0"),
            ("FORECAST_VARIANTS", "ridge,linear boosted"),
            ("FORECAST_STATS", "points,yards,points"),
            ("FORECAST_CUTOFF", "2023:12"),
            ("FORECAST_COMBINE", "mean"),
            ("FORECAST_HOLDOUT_WEEKS", "3"),
        ])
        .unwrap();
        assert_eq!(c.windows, vec![5, 3]);
        assert_eq!(c.variants, vec![ModelVariant::ridge(), ModelVariant::boosted()]);
        assert_eq!(c.stats, Some(vec!["points".to_string(), "yards".to_string()]));
        assert_eq!(c.cutoff, Some(WeekKey::new(2023, 12)));
        assert_eq!(c.combine, CombineMode::Mean);
        assert_eq!(c.holdout_weeks, 3);
    }

    #[test]
    fn bad_values_are_config_errors() {
        for vars in [
            [("FORECAST_WINDOWS", "0,x")],
            [("FORECAST_VARIANTS", "ridge,forest")],
            [("FORECAST_MIN_TRAIN_ROWS", "0")],
            [("FORECAST_CUTOFF", "week12")],
            [("FORECAST_WINDOWS", "64")],
            [("FORECAST_HOLDOUT_WEEKS", "0")],
        ] {
            assert!(matches!(cfg(&vars), Err(ForecastError::InvalidConfig(_))), "{vars:?}");
        }
    }
}
