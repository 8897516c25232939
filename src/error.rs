//! Failover Error Types

use thiserror::Error;

/// Result type alias for failover operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failover error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Unknown state name: {0}")]
    UnknownState(String),

    // Store errors
    #[error("Heartbeat store error: {0}")]
    Store(String),

    #[error("Heartbeat store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Heartbeat store timeout")]
    StoreTimeout,

    // State machine errors
    #[error("Unknown next state {outcome} on state {state}")]
    UnknownTransition { state: String, outcome: String },

    #[error("Runner failed unexpectedly on state {state}: {reason}")]
    RunnerFailed { state: String, reason: String },

    #[error("Failover stopped: {0}")]
    Fatal(std::sync::Arc<Error>),

    // Work queue errors
    #[error("Worker rejected task {id}: {reason}")]
    WorkerRejected { id: String, reason: String },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is absorbed by the error state and retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Store(_) | Error::StoreUnavailable(_) | Error::StoreTimeout | Error::Io(_)
        )
    }

    /// Check if this error means the process should be restarted
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnknownTransition { .. }
                | Error::RunnerFailed { .. }
                | Error::Fatal(_)
                | Error::Internal(_)
        )
    }
}
