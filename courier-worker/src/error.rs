use courier_common::queue::QueueError;
use thiserror::Error;

/// Enumeration of errors for a single outbound delivery attempt.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("{0} is not a valid HTTP method")]
    ParseMethodError(String),
    #[error("error parsing delivery url")]
    ParseUrlError(url::ParseError),
    #[error("the target reported status {0}")]
    FailedStatus(http::StatusCode),
    #[error("the delivery could not be performed: {0}")]
    TransportError(reqwest::Error),
}

impl DispatchError {
    /// Whether a later attempt against the same target could succeed.
    /// Parse-class errors cannot make forward progress and are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::FailedStatus(_) | DispatchError::TransportError(_)
        )
    }
}

/// Enumeration of errors aborting a worker iteration.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("an error occurred in the underlying queue")]
    QueueError(#[from] QueueError),
}
