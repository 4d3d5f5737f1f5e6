use thiserror::Error;

use crate::matrix::MatrixError;
use crate::rest::RestError;

/// Errors surfaced by a collector to its scheduler.
///
/// The scheduler reacts per kind: `MissingParam` is fatal at init,
/// `ApiRequestRejected` places the task into stand-by, `NoInstance` is a
/// retryable empty cycle, everything else aborts the current cycle only.
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("missing parameter: {0}")]
    MissingParam(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no instances: {0}")]
    NoInstance(String),

    #[error("API request rejected: {0}")]
    ApiRequestRejected(String),

    #[error("transport error: {0}")]
    Transport(#[from] RestError),

    #[error("matrix error: {0}")]
    Matrix(#[from] MatrixError),
}

impl CollectorError {
    /// Whether the scheduler should place the task into stand-by.
    pub fn is_request_rejected(&self) -> bool {
        matches!(self, CollectorError::ApiRequestRejected(_))
    }

    /// Whether this cycle produced no data but may succeed on retry.
    pub fn is_retryable_empty(&self) -> bool {
        matches!(self, CollectorError::NoInstance(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_rejected_classification() {
        let err = CollectorError::ApiRequestRejected("table gone".to_string());
        assert!(err.is_request_rejected());
        assert!(!err.is_retryable_empty());
    }

    #[test]
    fn test_no_instance_classification() {
        let err = CollectorError::NoInstance("no volumes on cluster".to_string());
        assert!(err.is_retryable_empty());
        assert!(!err.is_request_rejected());
    }
}
