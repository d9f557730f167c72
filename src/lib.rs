pub mod calibration;
pub mod config;
pub mod design_matrix;
pub mod ensemble;
pub mod error;
pub mod historical_dataset;
pub mod market;
pub mod predictor;
pub mod regressor;
pub mod rolling;
pub mod runner;
pub mod split;
pub mod team_game;
pub mod trainer;
pub mod win_prob;

pub use error::{ForecastError, Result};
