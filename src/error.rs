use thiserror::Error;

#[derive(Debug, Error)]
pub enum TwoLevelError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Loader error: {0}")]
    Loader(String),

    #[error("Solve error: {0}")]
    Solve(String),

    /// The continuation step-count estimate went negative: the ramp has
    /// overshot its target and can no longer be trusted.
    #[error(
        "continuation step estimate is negative ({remaining:.3} steps remaining, \
         alpha={current}, step={step})"
    )]
    ContinuationEstimate {
        current: f64,
        step: f64,
        remaining: f64,
    },

    #[error("two-level Newton solve failed (status {status})")]
    TotalSolveFailure { status: i32 },

    #[error("two-level solver used before initialize_all")]
    NotInitialized,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TwoLevelError {
    /// True for the conditions that must stop the simulation outright.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TwoLevelError::ContinuationEstimate { .. } | TwoLevelError::TotalSolveFailure { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TwoLevelError>;
