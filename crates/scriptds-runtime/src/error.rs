//! Error types for the script runtime.

use serde::{Deserialize, Serialize};

/// Errors raised while loading or invoking a script module.
///
/// These are serializable because the out-of-process host reports them to
/// the parent over the IPC channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum EngineError {
    #[error("Module evaluation failed: {0}")]
    Evaluation(String),

    #[error("A module body has already been loaded into this environment")]
    AlreadyLoaded,

    #[error("No module body has been loaded")]
    NotLoaded,

    #[error("Entry point '{0}' is not a callable export of the module")]
    EntryNotFound(String),

    #[error("Entry point threw: {0}")]
    CallFailed(String),

    #[error("Deferred result rejected: {0}")]
    Rejected(String),

    #[error("Deferred result still pending after the event loop drained")]
    Stalled,

    #[error("Entry point settled with a non-string value of type '{0}'")]
    NonStringResult(String),

    #[error("Timed out after {0} ms waiting for the result")]
    Timeout(u64),

    #[error("Unknown call id {0}")]
    UnknownCall(u64),

    #[error("Event loop error: {0}")]
    EventLoop(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    /// Whether the error means the module contract is broken, so no later
    /// invocation on the same environment can succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Evaluation(_) | EngineError::EntryNotFound(_) | EngineError::NotLoaded
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

/// Errors that can occur when talking to a runtime worker thread.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Runtime has terminated")]
    Terminated,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Runtime thread panicked")]
    ThreadPanic,

    #[error("Runtime failed to start: {0}")]
    StartFailed(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Failed to spawn thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
}
