use serde::Serialize;
use thiserror::Error;

/// Stage of an indexing pass, used to report where a pass failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStage {
    Scan,
    Ingest,
    Reconcile,
}

impl std::fmt::Display for IndexStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IndexStage::Scan => "scan",
            IndexStage::Ingest => "ingest",
            IndexStage::Reconcile => "reconcile",
        };
        f.write_str(name)
    }
}

/// Application-wide error types that serialize cleanly to JSON for a frontend.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "message")]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Index pass failed during {stage}: {reason}")]
    PassFailed { stage: IndexStage, reason: String },
}

impl AppError {
    pub fn pass_failed(stage: IndexStage, err: impl std::fmt::Display) -> Self {
        AppError::PassFailed {
            stage,
            reason: err.to_string(),
        }
    }

    /// Stage that failed, if this error came out of an index pass.
    pub fn stage(&self) -> Option<IndexStage> {
        match self {
            AppError::PassFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err.to_string())
    }
}

/// Result type for application operations
pub type AppResult<T> = Result<T, AppError>;
