//! Bridge error types

use std::path::PathBuf;
use thiserror::Error;

/// Bridge error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persisted queue could not be read back
    #[error("Offline queue at {path} is unreadable: {reason}")]
    QueueCorrupt { path: PathBuf, reason: String },

    /// Persisted agent state could not be read or written
    #[error("Agent state error: {0}")]
    AgentState(String),

    /// A live agent process already exists for this id
    #[error("Agent {0} is already running")]
    AlreadyRunning(String),

    /// No live agent process exists for this id
    #[error("Agent {0} is not running")]
    NotRunning(String),

    /// Agent process could not be spawned
    #[error("Failed to spawn agent {agent_id}: {reason}")]
    SpawnFailed { agent_id: String, reason: String },

    /// Agent id cannot be used as a record name
    #[error("Invalid agent id: {0:?}")]
    InvalidAgentId(String),

    /// Backend answered a direct request with an error or not at all
    #[error("Backend error: {0}")]
    Backend(String),

    /// Command guard rule error
    #[error("Guard error: {0}")]
    Guard(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, Error>;
