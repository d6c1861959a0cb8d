use thiserror::Error;

/// Convenience type alias for Results with ConductorError
pub type Result<T> = std::result::Result<T, ConductorError>;

/// Main error type for Conductor Core
///
/// Represents every failure the engine itself can raise. Task-level
/// failures are not errors in this sense: they travel as `TaskError`
/// values inside results and events (see `models::TaskError`).
#[derive(Error, Debug)]
pub enum ConductorError {
    #[error("Agent HTTP error: {0}")]
    AgentHttp(#[from] reqwest::Error),

    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("Store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue error: {message}")]
    Queue { message: String },

    #[error("Scheduler error: {queue_id} - {message}")]
    Scheduler { queue_id: String, message: String },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Timeout error: {message}")]
    Timeout { message: String },

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ConductorError {
    /// True for errors that mean the backing store cannot be reached,
    /// as opposed to a malformed record or a logic error.
    pub fn is_store_connection(&self) -> bool {
        match self {
            ConductorError::StoreUnavailable { .. } => true,
            ConductorError::Store(e) => {
                e.is_connection_refusal() || e.is_io_error() || e.is_timeout()
            }
            _ => false,
        }
    }
}
