//! Error types for cmdswarm

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Core error: {0}")]
    Core(#[from] libcmdswarm_core::SwarmError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Task error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
