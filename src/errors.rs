use std::time::Duration;

use thiserror::Error;

/// Error returned by a registered confirm/cancel handler.
///
/// Handlers are opaque to the coordinator, so the only thing carried is a
/// human readable message that ends up in the logs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<&str> for HandlerError {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

/// Failure signal of the dispatcher boundary.
///
/// Remote-call failures behind a proxy handler are reported the same way as
/// local handler errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("No handler registered for {target}::{operation}({})", .parameter_types.join(", "))]
    HandlerNotFound {
        target: String,
        operation: String,
        parameter_types: Vec<String>,
    },

    #[error("Argument mismatch: {expected} declared parameter types, {actual} arguments")]
    ArgumentMismatch { expected: usize, actual: usize },

    #[error("Handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("Handler panicked: {0}")]
    Panicked(String),

    #[error("Invocation timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug)]
pub enum TccError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transaction already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid transaction id: {0:?}")]
    InvalidId(String),

    #[error("Repository used before initialize()")]
    NotInitialized,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<bincode::Error> for TccError {
    fn from(e: bincode::Error) -> Self {
        TccError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for TccError {
    fn from(e: serde_json::Error) -> Self {
        TccError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TccError>;
