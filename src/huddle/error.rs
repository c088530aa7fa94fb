use thiserror::Error;

use crate::huddle::backend::BackendError;
use crate::huddle::utils::retry::{GeneralRetryError, Retryable};

pub type Result<T> = core::result::Result<T, HuddleError>;

#[derive(Error, Debug)]
pub enum HuddleError {
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// A read or write against the document or blob store failed.
    #[error("Backend error: {0}")]
    TransientIo(#[from] BackendError),

    #[error("Operation '{operation}' failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: BackendError,
    },

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl HuddleError {
    /// True for failures the caller may retry later (network loss, backend outage).
    pub fn is_transient(&self) -> bool {
        match self {
            HuddleError::TransientIo(e) => e.is_retryable(),
            HuddleError::RetriesExhausted { .. } => true,
            _ => false,
        }
    }
}

impl From<GeneralRetryError<BackendError>> for HuddleError {
    fn from(err: GeneralRetryError<BackendError>) -> Self {
        match err {
            GeneralRetryError::MaxRetriesExceeded {
                last_error,
                operation_description,
                attempts_made,
            } => HuddleError::RetriesExhausted {
                operation: operation_description,
                attempts: attempts_made,
                source: last_error,
            },
            GeneralRetryError::NotRetryable { error, .. } => HuddleError::TransientIo(error),
        }
    }
}
