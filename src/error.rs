use thiserror::Error;

pub type Result<T> = std::result::Result<T, EtlError>;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Change feed error: {0}")]
    Feed(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("ETL task not found: {0}")]
    TaskNotFound(u64),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Failure of a single transformation run. Scoped to one event.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("script '{transform}' failed to compile: {message}")]
    Compile { transform: String, message: String },

    #[error("script '{transform}' failed on document '{document_id}': {message}")]
    Runtime {
        transform: String,
        document_id: String,
        message: String,
    },

    #[error("script '{transform}' emitted an invalid message: {message}")]
    InvalidOutput { transform: String, message: String },
}

/// Failure delivering an outbound message to a broker.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PublishError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker authentication failed: {0}")]
    Auth(String),

    #[error("broker rejected message for '{destination}': {reason}")]
    Rejected { destination: String, reason: String },

    #[error("failed to declare '{destination}': {reason}")]
    Declare { destination: String, reason: String },

    #[error("message could not be encoded: {0}")]
    Encoding(String),

    #[error("publish timed out after {0}ms")]
    Timeout(u64),
}

impl PublishError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PublishError::Unavailable(_) => true,
            PublishError::Auth(_) => true,
            PublishError::Rejected { .. } => true,
            PublishError::Declare { .. } => true,
            PublishError::Timeout(_) => true,
            PublishError::Encoding(_) => false,
        }
    }
}
