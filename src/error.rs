use thiserror::Error;

/// Convenience alias for Results using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Error taxonomy for the controller and agent runtime.
///
/// Variants map onto the kinds used throughout the system rather than onto
/// individual failure sites: callers match on the kind, not on which
/// function produced it.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Malformed cron expression, unknown subtask kind, duplicate agent name
    /// with a different address, or an illegal status transition. Surfaces
    /// as HTTP 400.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Task, agent, or execution row does not exist. Surfaces as HTTP 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// The at-most-one-non-terminal-execution invariant would be violated.
    /// Surfaces as HTTP 409.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Transport hiccup or an agent unreachable at dispatch time. Retried
    /// internally with bounded backoff; should not escape to an API caller
    /// unless retries are exhausted.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A subtask completed with a business-level failure outcome. This is
    /// data carried on an execution row, not a thrown error in the usual
    /// sense, but the taxonomy still names it so call sites can reason about
    /// it uniformly.
    #[error("agent reported failure: {0}")]
    AgentFailure(String),

    /// The store is unavailable or a committed invariant was observed
    /// violated. Fatal errors halt the scheduler loop.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// The HTTP status code this error kind maps to (see spec §7).
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::AgentFailure(_) => StatusCode::OK,
            CoreError::Fatal(_)
            | CoreError::Database(_)
            | CoreError::Serialization(_)
            | CoreError::Http(_)
            | CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// A short machine-readable kind string, used in the `{success, error}`
    /// envelope so agents and scripts can match on it without parsing text.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidInput(_) => "InvalidInput",
            CoreError::NotFound(_) => "NotFound",
            CoreError::Conflict(_) => "Conflict",
            CoreError::Transient(_) => "Transient",
            CoreError::AgentFailure(_) => "AgentFailure",
            CoreError::Fatal(_) => "Fatal",
            CoreError::Database(_) => "Fatal",
            CoreError::Serialization(_) => "InvalidInput",
            CoreError::Http(_) => "Transient",
            CoreError::Internal(_) => "Fatal",
        }
    }
}
