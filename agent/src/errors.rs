//! Error types for the update agent

use thiserror::Error;

/// Main error type for the update agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Server responded with {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Malformed database value: {0}")]
    DatabaseValueError(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Update Module error: {0}")]
    ModuleError(String),

    #[error("Update Module timed out: {0}")]
    ModuleTimeout(String),

    #[error("Update Module protocol error: {0}")]
    ProtocolError(String),

    #[error("State loop detected: {0}")]
    StateLoopDetected(String),

    #[error("Unknown state: {0}")]
    UnknownState(String),

    #[error("Unsupported state data version: {0}")]
    UnsupportedStateDataVersion(i64),

    #[error("No update in progress")]
    NoUpdateInProgress,

    #[error("Update already in progress: {0}")]
    UpdateInProgress(String),

    #[error("Artifact dependencies not satisfied: {0}")]
    DependsMismatch(String),

    #[error("Artifact error: {0}")]
    ArtifactError(String),

    #[error("No Update Module for payload type: {0}")]
    NoModuleForPayload(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Whether the error is the checkpoint counter running out
    pub fn is_state_loop(&self) -> bool {
        matches!(self, AgentError::StateLoopDetected(_))
    }

    /// Whether the error means the key was absent from the store
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, AgentError::KeyNotFound(_))
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Internal(err.to_string())
    }
}
