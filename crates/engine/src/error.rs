//! Structured error types for the engine crate.

use thiserror::Error;
use turnloop::ClientError;

/// Errors surfaced by the engine to embedders.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    // --- Configuration / resume validation ---
    #[error("cannot run: no messages, no thread history, and no checkpoint")]
    EmptyRun,

    #[error("cannot add messages when resuming mid-execution")]
    ResumeWithMessages,

    #[error("checkpoint version {version} is newer than supported version {supported}")]
    CheckpointVersionTooNew { version: u32, supported: u32 },

    #[error("checkpoint does not match thread state: {details}")]
    CheckpointMismatch { details: String },

    // --- Reduction ---
    #[error("message integrity check failed: reduced prefix no longer matches")]
    IntegrityCheckFailed,

    // --- Pipelines ---
    #[error("middleware error: {0}")]
    Middleware(String),

    // --- Event coordination ---
    #[error("setting this parent would create a coordinator cycle")]
    CoordinatorCycle,

    // --- Collaborators ---
    #[error("chat client error: {0}")]
    Client(#[from] ClientError),

    #[error("checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // --- Run lifecycle ---
    #[error("run cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

/// Errors from `EventCoordinator::wait_for_response`. Timeout and external
/// cancellation are deliberately distinct variants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("timed out waiting for response")]
    Timeout,

    #[error("cancelled while waiting for response")]
    Cancelled,

    #[error("response type mismatch: expected {expected}")]
    TypeMismatch { expected: &'static str },

    #[error("coordinator closed")]
    Closed,
}
