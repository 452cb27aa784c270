//! Error taxonomy for the analysis service.
//!
//! Every caller-facing operation resolves to a well-formed response or one
//! of these kinds; sessions are never left in a queued/running limbo.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Malformed request, rejected before touching any engine.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The session id already denotes an active (non-terminal) session.
    #[error("session '{0}' already active")]
    AlreadyExists(String),

    /// The operation references a session that does not exist.
    #[error("session '{0}' not found")]
    NotFound(String),

    /// An option update's id resolves to neither a session nor an engine.
    #[error("unknown option target '{0}'")]
    UnknownTarget(String),

    /// All engine slots busy and the wait queue is full.
    #[error("engine pool saturated")]
    PoolSaturated,

    /// The engine process could not be started or failed its handshake.
    #[error("engine start failed: {0}")]
    EngineStart(String),

    /// Writing to or reading from a live engine process failed.
    #[error("engine I/O failed: {0}")]
    EngineIo(String),

    /// The engine crashed or desynchronized while bound to this session.
    #[error("engine failure: {0}")]
    EngineFailure(String),

    /// A wait exceeded its configured bound.
    #[error("operation timed out")]
    Timeout,

    /// The session was cancelled before a result was produced.
    #[error("session cancelled")]
    Cancelled,

    /// The pool is shutting down and no longer accepts work.
    #[error("service shutting down")]
    Shutdown,
}

impl AnalysisError {
    /// Kind tag used by the front end's response envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::AlreadyExists(_) => "already_exists",
            Self::NotFound(_) => "not_found",
            Self::UnknownTarget(_) => "unknown_target",
            Self::PoolSaturated => "pool_saturated",
            Self::EngineStart(_) => "engine_start",
            Self::EngineIo(_) => "engine_io",
            Self::EngineFailure(_) => "engine_failure",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Shutdown => "shutdown",
        }
    }
}
