//! Error taxonomy for the datasource.

use std::time::Duration;

use scriptds_runtime::{EngineError, RuntimeError};

use crate::host::Status;

/// Errors raised while reading datasource settings.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid jsonData: {0}")]
    InvalidJsonData(String),

    #[error("Cannot read settings file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Invalid settings file: {0}")]
    Parse(String),

    #[error("No module path configured")]
    MissingModule,
}

/// Errors crossing the datasource/script boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    /// The request could not be built from the host query or settings.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The environment could not be created, died, or was torn down.
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// The module failed to load, resolve, or produce a result.
    #[error(transparent)]
    Invocation(EngineError),

    /// The module's output could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl BridgeError {
    /// Whether the error invalidates the whole instance rather than a single
    /// query.
    pub fn is_fatal(&self) -> bool {
        match self {
            BridgeError::Lifecycle(_) => true,
            BridgeError::Invocation(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// Status attached to a per-query error entry.
    pub fn status(&self) -> Status {
        match self {
            BridgeError::Configuration(_) | BridgeError::Decode(_) => Status::BadRequest,
            BridgeError::Timeout(_) => Status::Timeout,
            BridgeError::Lifecycle(_) | BridgeError::Invocation(_) => Status::Internal,
        }
    }
}

impl From<EngineError> for BridgeError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Timeout(ms) => BridgeError::Timeout(Duration::from_millis(ms)),
            other => BridgeError::Invocation(other),
        }
    }
}

impl From<RuntimeError> for BridgeError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Engine(e) => e.into(),
            other => BridgeError::Lifecycle(other.to_string()),
        }
    }
}

impl From<ConfigError> for BridgeError {
    fn from(e: ConfigError) -> Self {
        BridgeError::Configuration(e.to_string())
    }
}

/// Errors raised while decoding one frame of a module result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("field '{field}': value {index} is not a {expected}")]
    FieldType {
        field: String,
        index: usize,
        expected: &'static str,
    },

    #[error("field '{field}' has {found} values, expected {expected}")]
    LengthMismatch {
        field: String,
        expected: usize,
        found: usize,
    },
}
