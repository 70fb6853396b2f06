//! Error taxonomy shared by every public operation in the core engine.
//!
//! Mirrors the wire error codes in the streaming protocol one-to-one so a
//! session handler can serialize any `CoreError` straight onto the socket
//! without an intermediate mapping table.

use thiserror::Error;

/// The closed set of error kinds callers are expected to branch on.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not_found: {0}")]
    NotFound(String),

    #[error("already_exists: {0}")]
    AlreadyExists(String),

    #[error("queue_full: {0}")]
    QueueFull(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("model_unavailable: {0}")]
    ModelUnavailable(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl CoreError {
    /// The wire/error-code string used by the streaming protocol (§6.1) and
    /// by any HTTP surface that reports these errors.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation",
            CoreError::NotFound(_) => "not_found",
            CoreError::AlreadyExists(_) => "already_exists",
            CoreError::QueueFull(_) => "queue_full",
            CoreError::Timeout(_) => "timeout",
            CoreError::ModelUnavailable(_) => "model_unavailable",
            CoreError::Internal(_) => "internal",
        }
    }

    /// Human-readable detail, independent of the `Display` impl's prefix.
    pub fn detail(&self) -> String {
        match self {
            CoreError::Validation(s)
            | CoreError::NotFound(s)
            | CoreError::AlreadyExists(s)
            | CoreError::QueueFull(s)
            | CoreError::Timeout(s)
            | CoreError::ModelUnavailable(s)
            | CoreError::Internal(s) => s.clone(),
        }
    }

    /// Errors that the embedding queue worker should retry with backoff
    /// (network / rate-limit class failures from C4 or C6), per spec.md §4.7.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Timeout(_) | CoreError::ModelUnavailable(_))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Internal(format!("json: {e}"))
    }
}

impl From<tantivy::TantivyError> for CoreError {
    fn from(e: tantivy::TantivyError) -> Self {
        CoreError::Internal(format!("tantivy: {e}"))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
