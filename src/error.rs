//! Error types for lamad-progression

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProgressionError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Usage ledger error: {0}")]
    Ledger(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Timer already running for {0}")]
    DuplicateTimer(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
