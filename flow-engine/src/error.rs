use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlowError>;

/// Errors produced by the flow engine and its storage services.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Flow validation failed: {0}")]
    Validation(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Capacity limit reached: {0}")]
    Capacity(String),

    #[error("Webhook call to {url} failed after {attempts} attempts: {reason}")]
    Webhook {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Concurrency violation: {0}")]
    Concurrency(String),
}

impl From<sqlx::Error> for FlowError {
    fn from(err: sqlx::Error) -> Self {
        FlowError::Storage(err.to_string())
    }
}
