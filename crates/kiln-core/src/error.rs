use thiserror::Error;

pub type KilnResult<T> = std::result::Result<T, KilnError>;

#[derive(Debug, Error)]
pub enum KilnError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("phase {phase} does not allow {command}")]
    Concurrency { command: String, phase: String },

    #[error("step failed: {0}")]
    Step(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KilnError {
    /// Build a `Concurrency` error for a command rejected in the given phase.
    #[must_use]
    pub fn concurrency(command: &str, phase: impl std::fmt::Display) -> Self {
        Self::Concurrency { command: command.to_string(), phase: phase.to_string() }
    }
}
