use thiserror::Error;

/// Errors produced by the session engine.
#[derive(Debug, Error)]
pub enum AgshError {
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("session quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("not authenticated: {0}")]
    Unauthenticated(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type AgshResult<T> = Result<T, AgshError>;
