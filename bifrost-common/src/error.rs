use thiserror::Error;

/// Error taxonomy shared across every component boundary.
///
/// Component crates define their own narrower `thiserror` enums (e.g.
/// `WriteError`, `PoolError`) and convert into this one at the server
/// boundary, where it is mapped onto HTTP/gRPC status codes.
#[derive(Debug, Error)]
pub enum BifrostError {
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("write blocked: {0} pending deactivation(s)")]
    PendingDeactivation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no worker available")]
    NoWorkerAvailable,

    #[error("execution timed out")]
    TimeoutError,

    #[error("execution cancelled")]
    CancelledError,

    #[error("worker process crashed")]
    ProcessCrashError,

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BifrostError {
    /// HTTP status mapping; a pending deactivation maps to 409 Conflict.
    pub fn status_code(&self) -> u16 {
        match self {
            BifrostError::Invalid(_) => 400,
            BifrostError::PendingDeactivation(_) => 409,
            BifrostError::NotFound(_) => 404,
            BifrostError::NoWorkerAvailable => 503,
            BifrostError::TimeoutError
            | BifrostError::CancelledError
            | BifrostError::ProcessCrashError => 200, // delivered via result callback, not HTTP failure
            BifrostError::Storage(_) | BifrostError::Serde(_) | BifrostError::Internal(_) => 500,
        }
    }
}
