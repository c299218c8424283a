use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Language not supported: {0}")]
    UnsupportedLanguage(i64),

    #[error("Invalid submission: {0}")]
    Validation(String),

    #[error("Too many requests")]
    AdmissionDenied,

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Unknown backend handle: {0}")]
    UnknownHandle(String),

    #[error("Cluster error: {0}")]
    Cluster(#[from] job_client::Error),

    #[error("Push delivery failed: {0}")]
    Delivery(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors the caller caused and should not retry unchanged.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::UnsupportedLanguage(_) | Error::AdmissionDenied
        )
    }
}
