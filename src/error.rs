// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Invariant violation; the state was left untouched.
    #[error("validation failed on `{field}`: {reason}")]
    ValidationFailed { field: &'static str, reason: String },

    #[error("out-of-order tick for session {session_id}: last={last}, got={got}")]
    Sequence { session_id: String, last: u64, got: u64 },

    #[error("timed out waiting for {what} after {waited_ms}ms")]
    Timeout { what: &'static str, waited_ms: u64 },

    #[error("{worker} is already running")]
    AlreadyRunning { worker: &'static str },

    #[error("{worker} heartbeat is stale ({stale_ms}ms)")]
    WorkerUnresponsive { worker: &'static str, stale_ms: u64 },

    #[error("malformed tick: {reason}")]
    Malformed { reason: String },

    /// A mutator was called synchronously from inside an event callback.
    #[error("`{op}` called from inside an event callback; submit an action instead")]
    Reentrant { op: &'static str },

    #[error("{what} is not ready")]
    NotReady { what: &'static str },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        EngineError::ValidationFailed { field, reason: reason.into() }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::ValidationFailed { field, .. } => *field,
            EngineError::Sequence { .. } => "sequence",
            EngineError::Timeout { .. } => "timeout",
            EngineError::AlreadyRunning { .. } => "already_running",
            EngineError::WorkerUnresponsive { .. } => "unresponsive",
            EngineError::Malformed { .. } => "malformed",
            EngineError::Reentrant { .. } => "reentrant",
            EngineError::NotReady { .. } => "not_ready",
            EngineError::Io(_) => "io",
            EngineError::Json(_) => "json",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
