use std::fmt;
use thiserror::Error;

/// Why a retried operation gave up
#[derive(Debug, Error)]
pub enum RetryError<E: fmt::Display + fmt::Debug> {
    #[error("Maximum retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: E },

    #[error("Non-retryable failure: {0}")]
    Rejected(E),

    #[error("Retry interrupted by shutdown signal")]
    Interrupted,
}

impl<E: fmt::Display + fmt::Debug> RetryError<E> {
    pub fn is_max_retries(&self) -> bool {
        matches!(self, RetryError::MaxRetriesExceeded { .. })
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, RetryError::Interrupted)
    }

    /// The underlying error, if the operation produced one
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::MaxRetriesExceeded { last_error, .. } => Some(last_error),
            RetryError::Rejected(e) => Some(e),
            RetryError::Interrupted => None,
        }
    }
}
