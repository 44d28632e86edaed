//! Generation collaborators.
//!
//! The pipeline only ever sees the two traits in this module; concrete
//! providers live behind them so tests can script failures and the
//! deployment can swap services without touching the pipeline.

pub mod http;
pub mod placeholder;

use async_trait::async_trait;
use thiserror::Error;

pub use http::HttpTextGenerator;
pub use placeholder::PlaceholderImageGenerator;

use crate::book::BookStyle;

/// A collaborator call failed. `retryable` decides whether the
/// orchestrator may re-run the job: transient transport/service trouble
/// is retryable, a misconfigured or rejected request is not.
#[derive(Error, Debug, Clone)]
#[error("{service} service error: {message}")]
pub struct ServiceError {
    pub service: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl ServiceError {
    pub fn retryable(service: &'static str, message: impl Into<String>) -> Self {
        Self {
            service,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(service: &'static str, message: impl Into<String>) -> Self {
        Self {
            service,
            message: message.into(),
            retryable: false,
        }
    }
}

/// Produces the story text for a whole book from one prompt.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, ServiceError>;
}

/// Produces one illustration as encoded image bytes.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, description: &str, style: BookStyle) -> Result<Vec<u8>, ServiceError>;
}
