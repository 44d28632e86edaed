use thiserror::Error;

use crate::ai::ServiceError;
use crate::db::DatabaseError;
use crate::error::{BookforgeError, BusinessRuleError, NotFoundError, StorageError, ValidationError};

/// Classified pipeline failure. The orchestrator retries the whole run
/// for retryable errors and resolves the terminal state otherwise.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    NotFound(#[from] NotFoundError),

    #[error("{0}")]
    BusinessRule(#[from] BusinessRuleError),

    #[error("{0}")]
    Service(#[from] ServiceError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Job exceeded the {limit_secs}s time limit")]
    Timeout { limit_secs: u64 },

    #[error("All {page_count} page illustrations failed; last error: {last}")]
    AllImagesFailed { page_count: u32, last: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether the orchestrator may re-run the job for this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Service(e) => e.retryable,
            PipelineError::Timeout { .. } => true,
            // Every page failing is a service-wide condition, not bad input.
            PipelineError::AllImagesFailed { .. } => true,
            PipelineError::Validation(_)
            | PipelineError::NotFound(_)
            | PipelineError::BusinessRule(_)
            | PipelineError::Database(_)
            | PipelineError::Storage(_)
            | PipelineError::Internal(_) => false,
        }
    }
}

impl From<BookforgeError> for PipelineError {
    fn from(e: BookforgeError) -> Self {
        match e {
            BookforgeError::Validation(e) => PipelineError::Validation(e),
            BookforgeError::BusinessRule(e) => PipelineError::BusinessRule(e),
            BookforgeError::NotFound(e) => PipelineError::NotFound(e),
            BookforgeError::Database(e) => PipelineError::Database(e),
            BookforgeError::Storage(e) => PipelineError::Storage(e),
            other => PipelineError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PipelineError::Service(ServiceError::retryable("text-generation", "503"))
            .is_retryable());
        assert!(!PipelineError::Service(ServiceError::fatal("text-generation", "bad key"))
            .is_retryable());
        assert!(PipelineError::Timeout { limit_secs: 900 }.is_retryable());
        assert!(PipelineError::AllImagesFailed {
            page_count: 5,
            last: "503".to_string()
        }
        .is_retryable());
        assert!(!PipelineError::NotFound(NotFoundError::Book(1)).is_retryable());
        assert!(!PipelineError::Validation(ValidationError::PageCount { got: 25 }).is_retryable());
    }
}
