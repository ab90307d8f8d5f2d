//! Store error types.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur against the document store.
///
/// Callers treat any of these as "the operation did not happen": quota
/// increments and job claims propagate them so the work is retried on the
/// next cycle. Only the circuit breaker deliberately swallows them.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The document or patch was not a JSON object.
    #[error("Document {collection}/{id} must be a JSON object")]
    InvalidDocument { collection: String, id: String },

    /// An increment targeted a field that holds a non-integer value.
    #[error("Field '{field}' of {collection}/{id} is not an integer")]
    NotAnInteger {
        collection: String,
        id: String,
        field: String,
    },

    /// A batch operation exceeded the write limit.
    #[error("Batch of {0} writes exceeds the {max} write limit", max = crate::MAX_BATCH_SIZE)]
    BatchTooLarge(usize),

    /// Serialization failure while reading or writing a document.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Infrastructure-level failure in the backing store.
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
