//! Error types for the device agent

use lockagent_shared::{codec::CodecError, ModelError};
use std::time::Duration;
use thiserror::Error;

/// Errors returned by a [`RemoteStore`](crate::store::RemoteStore)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Write rejected: {0}")]
    Rejected(String),

    #[error("Write timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors from the encrypted local key-value store
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors from the local actuator layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActuatorError {
    #[error("Actuator unavailable")]
    Unavailable,

    #[error("Actuator failed: {0}")]
    Failed(String),
}

/// Top-level agent errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Registration failed: {0}")]
    Registration(#[source] StoreError),

    #[error("Heartbeat failed: {0}")]
    Heartbeat(#[source] StoreError),

    #[error("Subscription failed: {0}")]
    Subscription(#[source] StoreError),

    #[error("Command {command_id} failed: {message}")]
    CommandExecution { command_id: String, message: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Actuator(#[from] ActuatorError),

    #[error("Connection exhausted: {0}")]
    ConnectionExhausted(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(#[from] ModelError),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl AgentError {
    /// Transient network-class failures that the connection manager retries
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Registration(_) | AgentError::Heartbeat(_) | AgentError::Subscription(_)
        )
    }
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;
