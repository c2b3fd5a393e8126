//! Error types for edgeroll

use serde::Serialize;
use thiserror::Error;

/// Main error type for the orchestrator and the device updater
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Health check failed: {0}")]
    HealthCheckFailure(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Script error: {0}")]
    ScriptError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Flat classification of a [`FleetError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Transient,
    Integrity,
    HealthCheckFailure,
    InvalidState,
    Internal,
}

impl FleetError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::InvalidInput(_)
            | FleetError::JsonError(_)
            | FleetError::YamlError(_)
            | FleetError::ConfigError(_) => ErrorKind::InvalidInput,
            FleetError::NotFound(_) => ErrorKind::NotFound,
            FleetError::Transient(_) | FleetError::HttpError(_) => ErrorKind::Transient,
            FleetError::Integrity(_) => ErrorKind::Integrity,
            FleetError::HealthCheckFailure(_) => ErrorKind::HealthCheckFailure,
            FleetError::InvalidState(_) => ErrorKind::InvalidState,
            FleetError::ScriptError(_)
            | FleetError::IoError(_)
            | FleetError::ServerError(_)
            | FleetError::ShutdownError(_)
            | FleetError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the failed operation may succeed
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Error used when an operation observes its cancellation token
    pub fn cancelled() -> Self {
        FleetError::InvalidState(CANCELLED.to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FleetError::InvalidState(msg) if msg == CANCELLED)
    }
}

const CANCELLED: &str = "cancelled";

impl From<anyhow::Error> for FleetError {
    fn from(err: anyhow::Error) -> Self {
        FleetError::Internal(err.to_string())
    }
}
