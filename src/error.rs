use thiserror::Error;

pub type Result<T> = std::result::Result<T, ForecastError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ForecastError {
    #[error(
        "team-game rows out of order at team={team} season={season} week={week} game_id={game_id}"
    )]
    UnorderedInput {
        team: String,
        season: i32,
        week: u32,
        game_id: String,
    },

    #[error(
        "insufficient training data for window={window} variant={variant} through {season}:{week}: {reason}"
    )]
    InsufficientTrainingData {
        window: usize,
        variant: String,
        season: i32,
        week: u32,
        reason: String,
    },

    #[error("no prior history for team {team} before {season}:{week} (game_id={game_id})")]
    UnknownTeam {
        team: String,
        game_id: String,
        season: i32,
        week: u32,
    },

    #[error("join mismatch for game_id={game_id}: {reason}")]
    JoinMismatch { game_id: String, reason: String },

    #[error("invalid forecast config: {0}")]
    InvalidConfig(String),

    #[error("no ensemble member survived for game_id={game_id}")]
    NoSurvivingMembers { game_id: String },

    #[error("regression fit failed for variant={variant}: {reason}")]
    Regression { variant: String, reason: String },
}

impl ForecastError {
    /// Member-level failures are dropped by the ensemble; everything else aborts the game.
    pub fn is_member_recoverable(&self) -> bool {
        matches!(
            self,
            ForecastError::InsufficientTrainingData { .. } | ForecastError::Regression { .. }
        )
    }
}
