//! Error types for cmdswarm

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure categories recorded on error samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FailureKind {
    ConnectFailure,
    CommandFailure,
    ValidationFailure,
    NotConnected,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ConnectFailure => "connect_failure",
            FailureKind::CommandFailure => "command_failure",
            FailureKind::ValidationFailure => "validation_failure",
            FailureKind::NotConnected => "not_connected",
        }
    }
}

/// Errors raised by a protocol client while talking to the target server
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Dial, DNS resolution, welcome read or connect timeout
    #[error("Connection to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    /// Write/read error or timeout on an established connection
    #[error("Command '{name}' failed: {reason}")]
    Command { name: String, reason: String },

    /// Response did not satisfy the command's expectation
    #[error("Unexpected response to '{name}': {detail}")]
    Validation { name: String, detail: String },

    /// Command attempted without an active connection
    #[error("Not connected to server")]
    NotConnected,
}

impl ClientError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ClientError::Connect { .. } => FailureKind::ConnectFailure,
            ClientError::Command { .. } => FailureKind::CommandFailure,
            ClientError::Validation { .. } => FailureKind::ValidationFailure,
            ClientError::NotConnected => FailureKind::NotConnected,
        }
    }
}

/// Main error type for building and running a load test
#[derive(Error, Debug)]
pub enum SwarmError {
    #[error("Invalid profile '{name}': {reason}")]
    InvalidProfile { name: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SwarmError>;
